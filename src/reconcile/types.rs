//! Typed inputs and collaborator interfaces for reconciliation
//!
//! The watch/queue machinery, the object API, and the event recorder all
//! live outside this crate. Reconciliation consumes them through the
//! small traits here and receives already-typed objects; nothing touches
//! a process-wide registry.

use crate::intent::ServicePort;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Namespaced identity of a watched object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Object namespace.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Build a key from namespace and name.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Kind of the watched object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    /// A load-balancer-type service, the supported target.
    LoadBalancer,
    /// Anything else; forwarding to it is refused.
    Other(String),
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::LoadBalancer => f.write_str("LoadBalancer"),
            TargetKind::Other(kind) => f.write_str(kind),
        }
    }
}

/// Snapshot of one watched object as read from the store.
#[derive(Debug, Clone)]
pub struct ForwardTarget {
    /// Object identity.
    pub key: ObjectKey,
    /// Object kind.
    pub kind: TargetKind,
    /// Object annotations.
    pub annotations: BTreeMap<String, String>,
    /// Declared ports.
    pub ports: Vec<ServicePort>,
    /// Addresses forwarded traffic should reach, from the object's
    /// published status.
    pub addresses: Vec<IpAddr>,
    /// Whether the object is being deleted.
    pub deleting: bool,
    /// Whether the object carries this system's tracking marker.
    pub marked: bool,
}

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational.
    Normal,
    /// Something went wrong but reconciliation continues or retries.
    Warning,
}

/// Event reason for annotation handling.
pub const REASON_ANNOTATION: &str = "PortForwardAnnotation";
/// Event reason for per-attempt forwarding outcomes.
pub const REASON_FORWARD: &str = "PortForward";
/// Event reason for external IP address handling.
pub const REASON_EXTERNAL_IP: &str = "ExternalIPAddress";

/// Records per-object events for operators to observe.
pub trait EventSink: Send + Sync {
    /// Record one event against the object.
    fn event(&self, key: &ObjectKey, severity: Severity, reason: &str, message: String);
}

/// Object store failure.
#[derive(Debug, Error)]
#[error("object store: {0}")]
pub struct StoreError(
    /// What the store reported.
    pub String,
);

/// Read and update access to watched objects.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the object, `None` when it no longer exists.
    async fn get(&self, key: &ObjectKey) -> Result<Option<ForwardTarget>, StoreError>;

    /// Add the tracking marker. Returns whether the object changed.
    async fn add_marker(&self, key: &ObjectKey) -> Result<bool, StoreError>;

    /// Remove the tracking marker. Returns whether the object changed.
    async fn remove_marker(&self, key: &ObjectKey) -> Result<bool, StoreError>;

    /// Publish an address into the object's status.
    async fn publish_address(&self, key: &ObjectKey, address: IpAddr) -> Result<(), StoreError>;

    /// Retract a previously published address from the object's status.
    async fn retract_address(&self, key: &ObjectKey, address: IpAddr) -> Result<(), StoreError>;
}

/// What the dispatch layer should do with the object next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing further to do until the object changes.
    Done,
    /// Re-queue immediately.
    Requeue,
    /// Re-queue after the given delay.
    RequeueAfter(Duration),
}

/// Determines the addresses mapping traffic is forwarded to.
pub trait TargetAddresses: Send + Sync {
    /// Resolve the target addresses for the object.
    fn addresses(&self, target: &ForwardTarget) -> Vec<IpAddr>;
}

/// Default resolution: the object's own published addresses.
pub struct StatusAddresses;

impl TargetAddresses for StatusAddresses {
    fn addresses(&self, target: &ForwardTarget) -> Vec<IpAddr> {
        target.addresses.clone()
    }
}

/// Configured override: a fixed address list for every object.
pub struct StaticAddresses(
    /// The addresses to forward to.
    pub Vec<IpAddr>,
);

impl TargetAddresses for StaticAddresses {
    fn addresses(&self, _target: &ForwardTarget) -> Vec<IpAddr> {
        self.0.clone()
    }
}
