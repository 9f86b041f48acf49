//! External IP address sources
//!
//! The reconciler publishes the network's external address into watched
//! objects' status so clients learn where forwarded ports live. The
//! usual source is the gateway itself over UPnP, but deployments behind
//! broken or double-NAT gateways can override it with a fixed address or
//! an environment variable.

use crate::upnp::{GatewayClient, UpnpError};
use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

/// External IP lookup failure.
#[derive(Debug, Error)]
pub enum ExternalIpError {
    /// The configured override did not parse as an IP address
    #[error("cannot parse external IP address from {0}")]
    Unparseable(String),

    /// The gateway lookup failed
    #[error(transparent)]
    Upnp(#[from] UpnpError),
}

/// Yields the network's current external IP address.
#[async_trait]
pub trait ExternalIpSource: Send + Sync {
    /// Look up the external address.
    async fn external_ip(&self) -> Result<IpAddr, ExternalIpError>;
}

#[async_trait]
impl ExternalIpSource for GatewayClient {
    async fn external_ip(&self) -> Result<IpAddr, ExternalIpError> {
        Ok(GatewayClient::external_ip(self).await?)
    }
}

/// Fixed override, for gateways that report a useless external address.
pub struct StaticExternalIp(
    /// The address to report.
    pub IpAddr,
);

#[async_trait]
impl ExternalIpSource for StaticExternalIp {
    async fn external_ip(&self) -> Result<IpAddr, ExternalIpError> {
        Ok(self.0)
    }
}

/// Reads the override from an environment variable on every lookup.
pub struct EnvExternalIp {
    var: String,
}

impl EnvExternalIp {
    /// Create a source reading the named variable.
    pub fn new(var: &str) -> Self {
        Self {
            var: var.to_string(),
        }
    }
}

#[async_trait]
impl ExternalIpSource for EnvExternalIp {
    async fn external_ip(&self) -> Result<IpAddr, ExternalIpError> {
        let value = std::env::var(&self.var)
            .map_err(|_| ExternalIpError::Unparseable(format!("${}", self.var)))?;
        value
            .parse()
            .map_err(|_| ExternalIpError::Unparseable(value))
    }
}
