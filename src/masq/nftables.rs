//! SNAT masquerading through the nftables command
//!
//! Builds a dedicated table with a postrouting NAT chain holding the one
//! SNAT rule, applied atomically as a single `nft -f -` batch. Removal
//! deletes the whole table. The table is exclusive to one in-flight
//! mapping attempt; the port forwarder serializes attempts host-wide.

use super::{run_command, Family, Masq, MasqError, Removal, SourceIpMasq};
use async_trait::async_trait;
use tracing::debug;

/// Name of the dedicated table holding the temporary rule.
pub const TABLE: &str = "portfwd-masq";

/// [`SourceIpMasq`] backed by an nftables table/chain/rule graph.
pub struct NftablesMasq {
    program: String,
}

impl NftablesMasq {
    /// Create a masquerader using the `nft` binary from `PATH`.
    pub fn new() -> Self {
        Self {
            program: "nft".to_string(),
        }
    }
}

impl Default for NftablesMasq {
    fn default() -> Self {
        Self::new()
    }
}

fn family_name(family: Family) -> &'static str {
    match family {
        Family::V4 => "ip",
        Family::V6 => "ip6",
    }
}

/// The batch creating table, chain, and rule in one transaction.
fn install_batch(masq: &Masq, family: Family) -> String {
    let fam = family_name(family);
    format!(
        "add table {fam} {TABLE}\n\
         add chain {fam} {TABLE} postrouting {{ type nat hook postrouting priority srcnat ; policy accept ; }}\n\
         add rule {fam} {TABLE} postrouting {fam} saddr {src} {fam} daddr {dst} snat to {new}\n",
        fam = fam,
        src = masq.original_source,
        dst = masq.destination,
        new = masq.new_source,
    )
}

fn remove_batch(family: Family) -> String {
    format!("delete table {} {}\n", family_name(family), TABLE)
}

#[async_trait]
impl SourceIpMasq for NftablesMasq {
    async fn masquerade(&self, masq: &Masq) -> Result<Removal, MasqError> {
        let family = masq.family()?;
        let program = self.program.clone();
        let args = vec!["-f".to_string(), "-".to_string()];

        run_command(&program, &args, Some(&install_batch(masq, family))).await?;
        debug!(
            "Masquerading {} -> {} as {}",
            masq.original_source, masq.destination, masq.new_source
        );

        Ok(Box::pin(async move {
            run_command(&program, &args, Some(&remove_batch(family))).await
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn v4_masq() -> Masq {
        Masq {
            original_source: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
            destination: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            new_source: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        }
    }

    #[test]
    fn test_install_batch_v4() {
        let batch = install_batch(&v4_masq(), Family::V4);
        let lines: Vec<&str> = batch.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "add table ip portfwd-masq");
        assert!(lines[1].contains("type nat hook postrouting priority srcnat"));
        assert_eq!(
            lines[2],
            "add rule ip portfwd-masq postrouting \
             ip saddr 192.168.1.100 ip daddr 192.168.1.1 snat to 10.0.0.5"
        );
    }

    #[test]
    fn test_install_batch_v6() {
        let masq = Masq {
            original_source: IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2)),
            destination: IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
            new_source: IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 3)),
        };
        let batch = install_batch(&masq, Family::V6);

        assert!(batch.starts_with("add table ip6 portfwd-masq"));
        assert!(batch.contains("ip6 saddr fd00::2 ip6 daddr fd00::1 snat to fd00::3"));
    }

    #[test]
    fn test_remove_batch_deletes_table() {
        assert_eq!(remove_batch(Family::V4), "delete table ip portfwd-masq\n");
        assert_eq!(remove_batch(Family::V6), "delete table ip6 portfwd-masq\n");
    }
}
