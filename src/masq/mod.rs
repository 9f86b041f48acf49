//! Temporary source-IP masquerading
//!
//! Home gateways only accept a port mapping whose internal client matches
//! the apparent source of the request. Before each gateway call the port
//! forwarder installs one SNAT rule rewriting its own source address into
//! the mapping's internal client for traffic headed to the gateway, and
//! removes it again right after. Two interchangeable backends render the
//! rule: `iptables` and `nftables`.

pub mod iptables;
pub mod nftables;

use async_trait::async_trait;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub use iptables::IptablesMasq;
pub use nftables::NftablesMasq;

/// The IP to masquerade as when targeting a specific destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Masq {
    /// Source address of the traffic as the kernel emits it.
    pub original_source: IpAddr,
    /// Destination (gateway) address the rule matches on.
    pub destination: IpAddr,
    /// Source address the traffic is rewritten to.
    pub new_source: IpAddr,
}

/// Idempotent action removing an installed rule.
///
/// Awaited exactly once per successful install, on every exit path of the
/// protected gateway call.
pub type Removal = Pin<Box<dyn Future<Output = Result<(), MasqError>> + Send>>;

/// Masquerades traffic to an IP address as another IP address.
#[async_trait]
pub trait SourceIpMasq: Send + Sync {
    /// Install one SNAT rule for the given masquerade and return the
    /// action that removes it.
    ///
    /// The rule is visible to the kernel before this returns.
    async fn masquerade(&self, masq: &Masq) -> Result<Removal, MasqError>;
}

/// Errors from the masquerade backends.
#[derive(Debug, Error)]
pub enum MasqError {
    /// The three addresses do not share one address family
    #[error("unable to determine address family: {0}")]
    FamilyMismatch(String),

    /// The backend command exited unsuccessfully
    #[error("{program} exited with {code}: {stderr}")]
    Command {
        /// Program that was run
        program: String,
        /// Exit code, or "signal" when killed
        code: String,
        /// Captured standard error
        stderr: String,
    },

    /// IO error spawning or driving the backend command
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address family of a masquerade rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// 4-byte addresses
    V4,
    /// 16-byte addresses
    V6,
}

impl Masq {
    /// Determine the single address family of the rule.
    ///
    /// Fails when the addresses mix families; this aborts the
    /// port-forward attempt before any rule or gateway call is made.
    pub fn family(&self) -> Result<Family, MasqError> {
        let family = match self.destination {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        };

        let same = |ip: &IpAddr| match (family, ip) {
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_)) => true,
            _ => false,
        };

        if !same(&self.original_source) || !same(&self.new_source) {
            return Err(MasqError::FamilyMismatch(format!(
                "{} -> {} masquerading as {}",
                self.original_source, self.destination, self.new_source
            )));
        }

        Ok(family)
    }
}

/// Run a backend command to completion, feeding it stdin when given.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
) -> Result<(), MasqError> {
    debug!("Running {} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;

    if let Some(input) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            handle.write_all(input.as_bytes()).await?;
        }
    }

    let output = child.wait_with_output().await?;

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());

        return Err(MasqError::Command {
            program: program.to_string(),
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}
