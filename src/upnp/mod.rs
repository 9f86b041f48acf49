//! UPnP IGD gateway client
//!
//! Discovers a usable Internet Gateway Device control point across the
//! IGD1/IGD2 protocol variants and exposes the uniform capability set the
//! port forwarder needs: external IP, gateway IP, source IP, and
//! AddPortMapping.

pub mod client;
pub mod types;

pub use client::{
    ControlPoint, Candidates, Discovery, GatewayClient, IgdControlPoint, SsdpDiscovery, Variant,
    DISCOVERY_TIMEOUT,
};
pub use types::{PortMapping, Protocol, UpnpError};
