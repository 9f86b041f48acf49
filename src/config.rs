//! Runtime configuration
//!
//! Deployment-level knobs loaded from a JSON file: which protocol
//! variants to try, discovery timing, the masquerade backend, address
//! overrides, and the external IP source. A missing or empty file yields
//! the defaults.

use crate::extip::{EnvExternalIp, ExternalIpSource, StaticExternalIp};
use crate::masq::iptables::IptablesMasq;
use crate::masq::nftables::NftablesMasq;
use crate::masq::SourceIpMasq;
use crate::reconcile::{StaticAddresses, StatusAddresses, TargetAddresses};
use crate::upnp::client::{SsdpDiscovery, Variant};
use crate::upnp::GatewayClient;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for this schema
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which command-line firewall tool installs masquerade rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasqBackend {
    /// iptables/ip6tables.
    Iptables,
    /// nft.
    Nftables,
}

/// Where the published external IP address comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ExternalIpConfig {
    /// Ask the gateway over UPnP.
    Upnp,
    /// A fixed address.
    Static {
        /// The address to publish.
        address: IpAddr,
    },
    /// An environment variable read on every lookup.
    Env {
        /// Name of the variable.
        var: String,
    },
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Protocol variants to try, in order.
    pub variants: Vec<Variant>,
    /// SSDP search timeout per variant, in seconds.
    pub discovery_timeout_secs: u64,
    /// Masquerade backend.
    pub masq_backend: MasqBackend,
    /// Fixed target addresses overriding the objects' published ones.
    pub override_addresses: Vec<IpAddr>,
    /// External IP source.
    pub external_ip: ExternalIpConfig,
    /// Reconciliation interval in seconds when no lease annotation
    /// shortens it.
    pub base_requeue_secs: u64,
    /// Re-check delay in seconds while an object has no addresses.
    pub pending_recheck_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            variants: Variant::all().to_vec(),
            discovery_timeout_secs: 5,
            masq_backend: MasqBackend::Iptables,
            override_addresses: Vec::new(),
            external_ip: ExternalIpConfig::Upnp,
            base_requeue_secs: 15 * 60,
            pending_recheck_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults
    /// when the file is missing or empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_json::from_str(&data)?)
    }

    /// The SSDP discovery this configuration describes.
    pub fn discovery(&self) -> SsdpDiscovery {
        SsdpDiscovery::new(Duration::from_secs(self.discovery_timeout_secs))
    }

    /// The masquerade backend this configuration describes.
    pub fn masquerader(&self) -> Arc<dyn SourceIpMasq> {
        match self.masq_backend {
            MasqBackend::Iptables => Arc::new(IptablesMasq::new()),
            MasqBackend::Nftables => Arc::new(NftablesMasq::new()),
        }
    }

    /// Target address resolution: the configured overrides, or the
    /// objects' own published addresses.
    pub fn target_addresses(&self) -> Arc<dyn TargetAddresses> {
        if self.override_addresses.is_empty() {
            Arc::new(StatusAddresses)
        } else {
            Arc::new(StaticAddresses(self.override_addresses.clone()))
        }
    }

    /// The external IP source, given the bound gateway client for the
    /// UPnP case.
    pub fn external_ip_source(&self, client: Arc<GatewayClient>) -> Arc<dyn ExternalIpSource> {
        match &self.external_ip {
            ExternalIpConfig::Upnp => client,
            ExternalIpConfig::Static { address } => Arc::new(StaticExternalIp(*address)),
            ExternalIpConfig::Env { var } => Arc::new(EnvExternalIp::new(var)),
        }
    }

    /// Base reconciliation interval.
    pub fn base_requeue(&self) -> Duration {
        Duration::from_secs(self.base_requeue_secs)
    }

    /// Pending-address re-check delay.
    pub fn pending_recheck(&self) -> Duration {
        Duration::from_secs(self.pending_recheck_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_defaults_cover_all_variants() {
        let config = Config::default();
        assert_eq!(config.variants, Variant::all().to_vec());
        assert_eq!(config.masq_backend, MasqBackend::Iptables);
        assert_eq!(config.external_ip, ExternalIpConfig::Upnp);
        assert_eq!(config.base_requeue(), Duration::from_secs(900));
        assert_eq!(config.pending_recheck(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"masq_backend": "nftables"}"#).unwrap();

        assert_eq!(config.masq_backend, MasqBackend::Nftables);
        assert_eq!(config.variants, Variant::all().to_vec());
        assert_eq!(config.external_ip, ExternalIpConfig::Upnp);
    }

    #[test]
    fn test_external_ip_config_variants() {
        let config: Config = serde_json::from_str(
            r#"{"external_ip": {"source": "static", "address": "198.51.100.7"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.external_ip,
            ExternalIpConfig::Static {
                address: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))
            }
        );

        let config: Config = serde_json::from_str(
            r#"{"external_ip": {"source": "env", "var": "EXTERNAL_IP"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.external_ip,
            ExternalIpConfig::Env {
                var: "EXTERNAL_IP".to_string()
            }
        );
    }

    #[test]
    fn test_variant_list_round_trips() {
        let config: Config = serde_json::from_str(
            r#"{"variants": ["wan-ip-connection2", "igd1-wan-ppp-connection1"]}"#,
        )
        .unwrap();
        assert_eq!(
            config.variants,
            vec![Variant::WanIpConnection2, Variant::Igd1WanPppConnection1]
        );
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/portfwd.json").unwrap();
        assert_eq!(config.base_requeue_secs, 900);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portfwd.json");
        std::fs::write(
            &path,
            r#"{"discovery_timeout_secs": 2, "pending_recheck_secs": 3}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.discovery_timeout_secs, 2);
        assert_eq!(config.pending_recheck(), Duration::from_secs(3));

        std::fs::write(&path, "  ").unwrap();
        assert_eq!(Config::load(&path).unwrap().base_requeue_secs, 900);

        std::fs::write(&path, "{nope").unwrap();
        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::Json(_)
        ));
    }

    #[test]
    fn test_override_addresses_switch_resolution() {
        let mut config = Config::default();
        assert!(config.override_addresses.is_empty());

        config.override_addresses = vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))];
        let resolved = config.target_addresses();

        let target = crate::reconcile::ForwardTarget {
            key: crate::reconcile::ObjectKey::new("default", "web"),
            kind: crate::reconcile::TargetKind::LoadBalancer,
            annotations: Default::default(),
            ports: Vec::new(),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))],
            deleting: false,
            marked: false,
        };
        assert_eq!(
            resolved.addresses(&target),
            vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))]
        );
    }
}
