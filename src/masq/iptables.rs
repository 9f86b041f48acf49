//! SNAT masquerading through the iptables command
//!
//! Appends one rule to the kernel's `nat`/`POSTROUTING` chain and removes
//! it again with the matching delete. The `iptables` and `ip6tables`
//! binaries are selected by the rule's address family.

use super::{run_command, Family, Masq, MasqError, Removal, SourceIpMasq};
use async_trait::async_trait;
use tracing::debug;

/// [`SourceIpMasq`] backed by the iptables rule table.
pub struct IptablesMasq {
    program_v4: String,
    program_v6: String,
}

impl IptablesMasq {
    /// Create a masquerader using the `iptables`/`ip6tables` binaries
    /// from `PATH`.
    pub fn new() -> Self {
        Self {
            program_v4: "iptables".to_string(),
            program_v6: "ip6tables".to_string(),
        }
    }

    /// Override the binaries, e.g. `iptables-legacy`.
    pub fn with_programs(program_v4: &str, program_v6: &str) -> Self {
        Self {
            program_v4: program_v4.to_string(),
            program_v6: program_v6.to_string(),
        }
    }

    fn program(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.program_v4,
            Family::V6 => &self.program_v6,
        }
    }
}

impl Default for IptablesMasq {
    fn default() -> Self {
        Self::new()
    }
}

/// The rule specification shared by the append and the delete.
fn rule_spec(masq: &Masq) -> Vec<String> {
    vec![
        "-s".to_string(),
        masq.original_source.to_string(),
        "-d".to_string(),
        masq.destination.to_string(),
        "-j".to_string(),
        "SNAT".to_string(),
        "--to-source".to_string(),
        masq.new_source.to_string(),
    ]
}

fn with_op(op: &str, spec: &[String]) -> Vec<String> {
    let mut args = vec![
        "-t".to_string(),
        "nat".to_string(),
        op.to_string(),
        "POSTROUTING".to_string(),
    ];
    args.extend_from_slice(spec);
    args
}

#[async_trait]
impl SourceIpMasq for IptablesMasq {
    async fn masquerade(&self, masq: &Masq) -> Result<Removal, MasqError> {
        let family = masq.family()?;
        let program = self.program(family).to_string();
        let spec = rule_spec(masq);

        run_command(&program, &with_op("-A", &spec), None).await?;
        debug!(
            "Masquerading {} -> {} as {}",
            masq.original_source, masq.destination, masq.new_source
        );

        Ok(Box::pin(async move {
            run_command(&program, &with_op("-D", &spec), None).await
        }))
    }
}
