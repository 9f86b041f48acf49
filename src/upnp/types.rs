//! Common types for the UPnP gateway client

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Transport protocol of a forwarded port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP protocol
    TCP,
    /// UDP protocol
    UDP,
}

impl Protocol {
    /// Parse a declared protocol string (`"TCP"`, `"udp"`, ...).
    ///
    /// Returns `None` for protocols a home gateway cannot forward,
    /// such as SCTP.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Some(Self::TCP),
            "UDP" => Some(Self::UDP),
            _ => None,
        }
    }

    /// The wire name used in IGD AddPortMapping requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TCP => "TCP",
            Self::UDP => "UDP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One gateway port-mapping request.
///
/// Immutable once constructed; two mappings are the same mapping exactly
/// when all fields are equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    /// Remote host filter. Empty means any remote host.
    pub remote_host: String,
    /// External port to open on the gateway (1-65535).
    pub external_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Internal port traffic is forwarded to.
    pub internal_port: u16,
    /// Address gateway traffic should be forwarded to.
    pub internal_client: IpAddr,
    /// Whether the mapping is active.
    pub enabled: bool,
    /// Human-readable description shown in the gateway's UI.
    pub description: String,
    /// Gateway-enforced TTL. Zero means indefinite.
    pub lease_duration: Duration,
}

/// Errors that can occur while talking to the gateway.
#[derive(Debug, Error)]
pub enum UpnpError {
    /// No usable IGD control point was found across all variants
    #[error("no UPnP clients found")]
    NoClients,

    /// Malformed or unexpected gateway response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The endpoint's location hostname resolved to nothing
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The internal client address cannot be converted to the
    /// gateway's address family
    #[error("address {client} is not convertible to the gateway's {family} family")]
    FamilyMismatch {
        /// The internal client address that failed conversion
        client: IpAddr,
        /// The gateway endpoint's address family
        family: &'static str,
    },

    /// Transport-level discovery failure
    #[error("search error: {0}")]
    Search(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
