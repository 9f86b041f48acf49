//! Reconciliation policy
//!
//! Drives one watched object from its annotations to gateway port
//! mappings. Each pass translates the annotations into a forwarding
//! intent, issues one forwarder call per resolved (external port, target
//! address) pair, records per-attempt events, and schedules the next
//! pass at half the effective lease so mappings are refreshed before the
//! gateway expires them.
//!
//! Cleanup on deletion (or on a removed/falsy forward toggle) only drops
//! the tracking marker and the published external address; it does not
//! unmap ports on the gateway. The forced lease duration expires stale
//! mappings on its own.

pub mod types;

use crate::extip::ExternalIpSource;
use crate::forward::PortForwarder;
use crate::intent::{self, ForwardToggle, ANNOTATION_FORWARD, ANNOTATION_PORT_MAP};
use crate::upnp::{PortMapping, Protocol};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use types::{
    EventSink, ForwardTarget, ObjectKey, ObjectStore, Outcome, Severity, StaticAddresses,
    StatusAddresses, StoreError, TargetAddresses, TargetKind, REASON_ANNOTATION,
    REASON_EXTERNAL_IP, REASON_FORWARD,
};

/// Reconciliation interval when no lease annotation shortens it.
pub const BASE_REQUEUE: Duration = Duration::from_secs(15 * 60);

/// Re-check delay while the object has no resolvable addresses yet.
pub const PENDING_RECHECK: Duration = Duration::from_secs(10);

/// Reconciles watched objects against the gateway.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventSink>,
    forwarder: Arc<PortForwarder>,
    addresses: Arc<dyn TargetAddresses>,
    external_ip: Option<Arc<dyn ExternalIpSource>>,
    base_requeue: Duration,
    pending_recheck: Duration,
}

impl Reconciler {
    /// Create a reconciler with the default intervals and no external
    /// IP publication.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventSink>,
        forwarder: Arc<PortForwarder>,
        addresses: Arc<dyn TargetAddresses>,
    ) -> Self {
        Self {
            store,
            events,
            forwarder,
            addresses,
            external_ip: None,
            base_requeue: BASE_REQUEUE,
            pending_recheck: PENDING_RECHECK,
        }
    }

    /// Publish the external address from this source into reconciled
    /// objects' status.
    pub fn with_external_ip_source(mut self, source: Arc<dyn ExternalIpSource>) -> Self {
        self.external_ip = Some(source);
        self
    }

    /// Override the base reconciliation interval.
    pub fn with_base_requeue(mut self, base_requeue: Duration) -> Self {
        self.base_requeue = base_requeue;
        self
    }

    /// Override the pending-address re-check delay.
    pub fn with_pending_recheck(mut self, pending_recheck: Duration) -> Self {
        self.pending_recheck = pending_recheck;
        self
    }

    /// Reconcile one object by key.
    ///
    /// Errors reading the object propagate to the dispatch layer, which
    /// retries; everything else degrades to events and a requeue.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, StoreError> {
        let Some(target) = self.store.get(key).await? else {
            debug!("{} no longer exists", key);
            return Ok(Outcome::Done);
        };

        if target.deleting {
            return self.cleanup(&target).await;
        }

        match intent::forward_toggle(&target.annotations) {
            ForwardToggle::Truthy => {}
            ForwardToggle::Absent => {
                return if target.marked {
                    self.cleanup(&target).await
                } else {
                    Ok(Outcome::Done)
                };
            }
            ForwardToggle::Falsy(value) => {
                self.events.event(
                    key,
                    Severity::Normal,
                    REASON_ANNOTATION,
                    format!(
                        "redundant falsy value {} in {} annotation",
                        value, ANNOTATION_FORWARD
                    ),
                );
                return self.cleanup(&target).await;
            }
        }

        if target.kind != TargetKind::LoadBalancer {
            self.events.event(
                key,
                Severity::Warning,
                REASON_ANNOTATION,
                format!("cannot port forward to object of kind {}", target.kind),
            );
            return self.cleanup(&target).await;
        }

        let translation =
            match intent::translate(&target.annotations, &target.ports, self.base_requeue) {
                Ok(translation) => translation,
                Err(err) => {
                    // Fail-closed: no mapping is issued from a pass with
                    // a malformed port map.
                    self.events.event(
                        key,
                        Severity::Warning,
                        REASON_ANNOTATION,
                        err.to_string(),
                    );
                    return Ok(Outcome::Done);
                }
            };

        for warning in &translation.warnings {
            self.events
                .event(key, Severity::Warning, REASON_ANNOTATION, warning.clone());
        }

        let forwarding = translation.intent;

        let addresses = self.addresses.addresses(&target);
        if addresses.is_empty() {
            debug!("{} has no target addresses yet", key);
            return Ok(Outcome::RequeueAfter(self.pending_recheck));
        }

        for port in &target.ports {
            let Some(protocol) = Protocol::parse(&port.protocol) else {
                self.events.event(
                    key,
                    Severity::Normal,
                    REASON_FORWARD,
                    format!(
                        "skipping port {} with unsupported protocol {}",
                        port.display_name(),
                        port.protocol
                    ),
                );
                continue;
            };

            for external in forwarding.external_ports(port) {
                if external <= 0 {
                    self.events.event(
                        key,
                        Severity::Normal,
                        REASON_FORWARD,
                        format!(
                            "skip port {} due to {} annotation mapping it to {}",
                            port.display_name(),
                            ANNOTATION_PORT_MAP,
                            external
                        ),
                    );
                    continue;
                }
                let external = external as u16;

                let description = forwarding.description(&key.namespace, &key.name, port);

                for address in &addresses {
                    let mapping = PortMapping {
                        remote_host: forwarding.remote_host.clone(),
                        external_port: external,
                        protocol,
                        internal_port: port.port,
                        internal_client: *address,
                        enabled: forwarding.enabled(),
                        description: description.clone(),
                        lease_duration: forwarding.lease_duration,
                    };

                    // Per-attempt outcomes are isolated: one failing
                    // pair never blocks the others in the pass.
                    match self.forwarder.add_port_mapping(&mapping).await {
                        Ok(()) => {
                            info!(
                                "{} mapped {} to {}:{}",
                                key, external, address, port.port
                            );
                            self.events.event(
                                key,
                                Severity::Normal,
                                REASON_FORWARD,
                                format!(
                                    "{} to {}:{} for port {}",
                                    external,
                                    address,
                                    port.port,
                                    port.display_name()
                                ),
                            );
                        }
                        Err(err) => {
                            self.events.event(
                                key,
                                Severity::Warning,
                                REASON_FORWARD,
                                format!(
                                    "{} to {}:{} for port {} failed with: {}",
                                    external,
                                    address,
                                    port.port,
                                    port.display_name(),
                                    err
                                ),
                            );
                        }
                    }
                }
            }
        }

        if let Err(err) = self.store.add_marker(key).await {
            warn!("{} add marker: {}", key, err);
            return Ok(Outcome::Requeue);
        }

        if let Some(source) = &self.external_ip {
            match source.external_ip().await {
                Ok(external) => {
                    if !target.addresses.contains(&external) {
                        if let Err(err) = self.store.publish_address(key, external).await {
                            warn!("{} publish external address: {}", key, err);
                            return Ok(Outcome::Requeue);
                        }
                    }
                }
                Err(err) => {
                    self.events.event(
                        key,
                        Severity::Warning,
                        REASON_EXTERNAL_IP,
                        format!("get external IP address failed with: {}", err),
                    );
                }
            }
        }

        Ok(Outcome::RequeueAfter(forwarding.requeue_after))
    }

    /// Release the object: retract the published external address and
    /// drop the tracking marker. Gateway-side mappings are left to lease
    /// expiry.
    async fn cleanup(&self, target: &ForwardTarget) -> Result<Outcome, StoreError> {
        if !target.marked {
            return Ok(Outcome::Done);
        }

        if let Some(source) = &self.external_ip {
            match source.external_ip().await {
                Ok(external) => {
                    if let Err(err) = self.store.retract_address(&target.key, external).await {
                        warn!("{} retract external address: {}", target.key, err);
                        return Ok(Outcome::Requeue);
                    }
                }
                Err(err) => {
                    debug!("{} external address unknown during cleanup: {}", target.key, err);
                }
            }
        }

        if let Err(err) = self.store.remove_marker(&target.key).await {
            warn!("{} remove marker: {}", target.key, err);
            return Ok(Outcome::Requeue);
        }

        debug!("{} released", target.key);
        Ok(Outcome::Done)
    }
}
