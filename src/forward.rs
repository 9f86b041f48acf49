//! End-to-end port forwarding
//!
//! Performs one gateway mapping request bracketed by temporary source-IP
//! masquerading. The gateway only honors mappings that appear to come
//! from the internal client itself, so each AddPortMapping call runs with
//! an SNAT rule rewriting this host's source address into the mapping's
//! internal client, installed right before the call and removed right
//! after it, whatever the outcome.

use crate::masq::{Masq, MasqError, Removal, SourceIpMasq};
use crate::upnp::{GatewayClient, PortMapping, UpnpError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Holds an installed rule's removal action until it runs.
///
/// The normal path drives the removal on a background task and waits for
/// it. If the protected section's future is dropped first, `Drop` hands
/// the removal to the runtime instead, so a cancelled mapping attempt
/// never orphans its rule.
struct RemovalGuard(Option<Removal>);

impl RemovalGuard {
    fn armed(removal: Removal) -> Self {
        Self(Some(removal))
    }

    async fn remove(mut self) {
        let Some(removal) = self.0.take() else { return };

        match tokio::spawn(removal).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to remove masquerade rule: {}", err),
            Err(err) => warn!("masquerade removal task failed: {}", err),
        }
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        let Some(removal) = self.0.take() else { return };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = removal.await {
                        warn!("failed to remove masquerade rule: {}", err);
                    }
                });
            }
            Err(_) => warn!("masquerade rule left behind: no runtime to run its removal"),
        }
    }
}

/// Errors from a single port-forward attempt.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Gateway discovery, resolution, or mapping failure
    #[error(transparent)]
    Upnp(#[from] UpnpError),

    /// Masquerade rule installation failure
    #[error(transparent)]
    Masq(#[from] MasqError),
}

/// Forwards ports on the gateway, one mapping at a time.
///
/// The internal mutex is the only synchronization primitive of the core:
/// the masquerade rule is shared host-wide state, so the
/// rule-install/gateway-call/rule-remove critical section must never
/// interleave.
pub struct PortForwarder {
    client: Arc<GatewayClient>,
    masq: Arc<dyn SourceIpMasq>,
    lock: Mutex<()>,
}

impl PortForwarder {
    /// Create a forwarder over a bound gateway client and a masquerade
    /// backend.
    pub fn new(client: Arc<GatewayClient>, masq: Arc<dyn SourceIpMasq>) -> Self {
        Self {
            client,
            masq,
            lock: Mutex::new(()),
        }
    }

    /// The gateway client this forwarder drives.
    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    /// Add one port mapping on the gateway.
    ///
    /// Steps: resolve the gateway address, install the masquerade rule,
    /// issue the mapping call, remove the rule, return the mapping
    /// call's result. Rule removal runs on every exit path after a
    /// successful install, including when this future is dropped before
    /// completing; its failure is logged and never masks the mapping
    /// result.
    pub async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), ForwardError> {
        let _guard = self.lock.lock().await;

        let destination = self.client.gateway_ip().await?;

        let removal = self
            .masq
            .masquerade(&Masq {
                original_source: self.client.source_ip(),
                destination,
                new_source: mapping.internal_client,
            })
            .await?;
        let removal = RemovalGuard::armed(removal);

        debug!(
            "Adding mapping {}:{} -> {}:{} ({})",
            destination,
            mapping.external_port,
            mapping.internal_client,
            mapping.internal_port,
            mapping.protocol
        );

        let result = self.client.add_port_mapping(mapping).await;

        removal.remove().await;

        result.map_err(Into::into)
    }
}
