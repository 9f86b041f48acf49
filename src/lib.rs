//! portfwd - UPnP IGD port forwarding orchestration
//!
//! This library turns annotations on watched load-balancer objects into
//! port mappings on the local Internet Gateway Device. It discovers a
//! gateway control point across the IGD1/IGD2 protocol variants, issues
//! AddPortMapping calls bracketed by temporary source-IP masquerading,
//! and reconciles each object on a lease-driven schedule.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod extip;
pub mod forward;
pub mod intent;
pub mod masq;
pub mod reconcile;
pub mod upnp;

/// Result type alias for portfwd operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for portfwd operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// UPnP discovery or gateway error
    #[error("UPnP error: {0}")]
    Upnp(#[from] upnp::UpnpError),

    /// Source-IP masquerade error
    #[error("Masquerade error: {0}")]
    Masq(#[from] masq::MasqError),

    /// Port forwarding error
    #[error("Forwarding error: {0}")]
    Forward(#[from] forward::ForwardError),

    /// Annotation translation error
    #[error("Annotation error: {0}")]
    Annotation(#[from] intent::AnnotationError),

    /// Object store error
    #[error("Store error: {0}")]
    Store(#[from] reconcile::StoreError),

    /// External IP lookup error
    #[error("External IP error: {0}")]
    ExternalIp(#[from] extip::ExternalIpError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Initialize the portfwd library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_wrap_module_errors() {
        let err: Error = upnp::UpnpError::NoClients.into();
        assert!(matches!(err, Error::Upnp(_)));

        let err: Error = reconcile::StoreError("conflict".to_string()).into();
        assert_eq!(err.to_string(), "Store error: object store: conflict");
    }
}
