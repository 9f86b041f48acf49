//! UPnP IGD gateway client with protocol-variant fallback discovery
//!
//! Home gateways implement inconsistent subsets of the UPnP IGD1/IGD2
//! service specifications. Discovery therefore tries a list of protocol
//! variants in capability order and binds to the first control point any
//! variant yields. The SSDP/SOAP transport itself comes from `igd-next`;
//! this module only decides which candidate to bind and normalizes the
//! operations the rest of the crate needs.

use super::types::{PortMapping, UpnpError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default timeout for SSDP discovery
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// An IGD service variant to try during discovery.
///
/// The first three live on the IGD2 device class, the last two on the
/// original IGD1 device class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// WANIPConnection:2 (IGD2)
    WanIpConnection2,
    /// WANIPConnection:1 (IGD2)
    WanIpConnection1,
    /// WANPPPConnection:1 (IGD2)
    WanPppConnection1,
    /// WANIPConnection:1 (IGD1)
    Igd1WanIpConnection1,
    /// WANPPPConnection:1 (IGD1)
    Igd1WanPppConnection1,
}

impl Variant {
    /// All variants in the default order, most to least capable.
    pub fn all() -> [Variant; 5] {
        [
            Variant::WanIpConnection2,
            Variant::WanIpConnection1,
            Variant::WanPppConnection1,
            Variant::Igd1WanIpConnection1,
            Variant::Igd1WanPppConnection1,
        ]
    }

    /// The UPnP service type URN this variant searches for.
    pub fn service_type(&self) -> &'static str {
        match self {
            Variant::WanIpConnection2 => "urn:schemas-upnp-org:service:WANIPConnection:2",
            Variant::WanIpConnection1 | Variant::Igd1WanIpConnection1 => {
                "urn:schemas-upnp-org:service:WANIPConnection:1"
            }
            Variant::WanPppConnection1 | Variant::Igd1WanPppConnection1 => {
                "urn:schemas-upnp-org:service:WANPPPConnection:1"
            }
        }
    }
}

/// One discovered IGD control point.
///
/// Implementations wrap the SSDP/SOAP transport; the gateway client owns
/// the bound control point exclusively and never hands it out.
#[async_trait]
pub trait ControlPoint: Send + Sync {
    /// Query the gateway for its external IP address.
    async fn external_ip(&self) -> Result<IpAddr, UpnpError>;

    /// Forward the mapping fields 1:1 to the endpoint's add-mapping
    /// operation.
    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), UpnpError>;

    /// The declared service location (control URL) of the endpoint.
    fn location(&self) -> &str;

    /// The local address used to reach the endpoint. Always available
    /// once the control point is bound.
    fn local_ip(&self) -> IpAddr;
}

/// Candidates a single variant search turned up.
///
/// A variant may yield several control points along with partial errors
/// for devices that answered the search but could not be queried.
pub struct Candidates {
    /// Usable control points, best first.
    pub control_points: Vec<Arc<dyn ControlPoint>>,
    /// Errors for devices that answered but failed to bind.
    pub partial_errors: Vec<UpnpError>,
}

/// Per-variant control point search.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Search for control points speaking the given variant.
    ///
    /// Finding nothing is expressed as an empty candidate list or
    /// [`UpnpError::NoClients`]; any other error is a transport failure.
    async fn candidates(&self, variant: Variant) -> Result<Candidates, UpnpError>;
}

/// Production [`Discovery`] backed by `igd-next` SSDP search.
///
/// `igd_next::search_gateway` cannot restrict the search to one service
/// type, so every variant performs the same network search and the first
/// configured variant binds whatever gateway answers. The per-variant
/// fallback order only differentiates discoveries that can actually
/// search per service type.
pub struct SsdpDiscovery {
    timeout: Duration,
}

impl SsdpDiscovery {
    /// Create a discovery with the given per-variant search timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SsdpDiscovery {
    fn default() -> Self {
        Self::new(DISCOVERY_TIMEOUT)
    }
}

#[async_trait]
impl Discovery for SsdpDiscovery {
    async fn candidates(&self, variant: Variant) -> Result<Candidates, UpnpError> {
        let timeout = self.timeout;

        debug!(
            "Searching for IGD control points ({})",
            variant.service_type()
        );

        // igd-next's search is blocking I/O.
        let found = tokio::task::spawn_blocking(move || {
            igd_next::search_gateway(igd_next::SearchOptions {
                timeout: Some(timeout),
                ..Default::default()
            })
        })
        .await
        .map_err(|e| UpnpError::Internal(format!("join search task: {}", e)))?;

        let gateway = match found {
            Ok(gateway) => gateway,
            Err(e) if search_timed_out(&e) => {
                return Ok(Candidates {
                    control_points: Vec::new(),
                    partial_errors: Vec::new(),
                });
            }
            Err(e) => return Err(UpnpError::Search(e.to_string())),
        };

        // A device that answered the search but cannot be bound is a
        // partial error, not a fatal one.
        match IgdControlPoint::bind(gateway) {
            Ok(control_point) => Ok(Candidates {
                control_points: vec![Arc::new(control_point)],
                partial_errors: Vec::new(),
            }),
            Err(e) => Ok(Candidates {
                control_points: Vec::new(),
                partial_errors: vec![e],
            }),
        }
    }
}

/// Whether a search error means "no gateway answered in time".
///
/// `igd-next` surfaces an expired search deadline as an I/O error on the
/// SSDP socket read, not as a dedicated variant.
fn search_timed_out(err: &igd_next::SearchError) -> bool {
    match err {
        igd_next::SearchError::IoError(e) => matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
        _ => false,
    }
}

/// [`ControlPoint`] wrapping an `igd-next` gateway handle.
pub struct IgdControlPoint {
    gateway: igd_next::Gateway,
    location: String,
    local_ip: IpAddr,
}

impl IgdControlPoint {
    /// Bind a control point around a discovered gateway, recording the
    /// local source address used to reach it.
    pub fn bind(gateway: igd_next::Gateway) -> Result<Self, UpnpError> {
        let local_ip = local_ip_towards(&gateway)?;
        let root = gateway.root_url.clone();
        let location = if root.starts_with('/') {
            format!("http://{}{}", gateway.addr, root)
        } else {
            format!("http://{}/{}", gateway.addr, root)
        };

        Ok(Self {
            gateway,
            location,
            local_ip,
        })
    }
}

/// Determine the local address the kernel routes towards the gateway.
///
/// A connected UDP socket never sends any packet; its local address is
/// the source address the gateway will see.
fn local_ip_towards(gateway: &igd_next::Gateway) -> Result<IpAddr, UpnpError> {
    let bind_addr = if gateway.addr.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };

    let socket = UdpSocket::bind(bind_addr)
        .map_err(|e| UpnpError::Internal(format!("bind socket: {}", e)))?;

    socket
        .connect(gateway.addr)
        .map_err(|e| UpnpError::Internal(format!("connect socket: {}", e)))?;

    let local_addr = socket
        .local_addr()
        .map_err(|e| UpnpError::Internal(format!("local address: {}", e)))?;

    Ok(local_addr.ip())
}

#[async_trait]
impl ControlPoint for IgdControlPoint {
    async fn external_ip(&self) -> Result<IpAddr, UpnpError> {
        let gateway = self.gateway.clone();

        tokio::task::spawn_blocking(move || gateway.get_external_ip())
            .await
            .map_err(|e| UpnpError::Internal(format!("join task: {}", e)))?
            .map_err(|e| UpnpError::Protocol(format!("GetExternalIPAddress: {}", e)))
    }

    async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), UpnpError> {
        let gateway = self.gateway.clone();
        let protocol = match mapping.protocol {
            super::types::Protocol::TCP => igd_next::PortMappingProtocol::TCP,
            super::types::Protocol::UDP => igd_next::PortMappingProtocol::UDP,
        };
        let external_port = mapping.external_port;
        let local_addr = std::net::SocketAddr::new(mapping.internal_client, mapping.internal_port);
        let lease_secs = mapping.lease_duration.as_secs() as u32;
        let description = mapping.description.clone();

        // The SOAP transport sends an empty remote host and an always-on
        // enabled flag; surface mappings that wanted otherwise.
        if !mapping.remote_host.is_empty() {
            debug!(
                "remote host filter {} not supported by transport, mapping applies to any host",
                mapping.remote_host
            );
        }
        if !mapping.enabled {
            debug!("transport cannot create a disabled mapping, mapping will be active");
        }

        tokio::task::spawn_blocking(move || {
            gateway.add_port(protocol, external_port, local_addr, lease_secs, &description)
        })
        .await
        .map_err(|e| UpnpError::Internal(format!("join task: {}", e)))?
        .map_err(|e| UpnpError::Protocol(format!("AddPortMapping: {}", e)))
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn local_ip(&self) -> IpAddr {
        self.local_ip
    }
}

/// Gateway client bound to one discovered IGD control point.
///
/// Construction runs fallback discovery once; afterwards the endpoint is
/// read-only and the client is safe to share.
pub struct GatewayClient {
    control_point: Arc<dyn ControlPoint>,
    variant: Option<Variant>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("location", &self.control_point.location())
            .field("variant", &self.variant)
            .finish()
    }
}

impl GatewayClient {
    /// Discover a usable control point, trying variants in the given
    /// order and binding the first candidate of the first variant that
    /// yields any.
    ///
    /// Variants that find nothing are skipped. A transport error is
    /// remembered and returned only if no later variant succeeds either;
    /// otherwise the whole discovery fails with
    /// [`UpnpError::NoClients`].
    pub async fn discover(
        discovery: &dyn Discovery,
        variants: &[Variant],
    ) -> Result<Self, UpnpError> {
        let mut last_transport_error = None;

        for &variant in variants {
            match discovery.candidates(variant).await {
                Ok(candidates) => {
                    for err in &candidates.partial_errors {
                        debug!("partial discovery error for {:?}: {}", variant, err);
                    }

                    if let Some(control_point) = candidates.control_points.into_iter().next() {
                        info!(
                            "Bound IGD control point at {} via {:?}",
                            control_point.location(),
                            variant
                        );
                        return Ok(Self {
                            control_point,
                            variant: Some(variant),
                        });
                    }
                }
                Err(UpnpError::NoClients) => {}
                Err(e) => {
                    warn!("discovery transport error for {:?}: {}", variant, e);
                    last_transport_error = Some(e);
                }
            }
        }

        Err(last_transport_error.unwrap_or(UpnpError::NoClients))
    }

    /// Wrap an already-bound control point, bypassing discovery.
    pub fn bound(control_point: Arc<dyn ControlPoint>) -> Self {
        Self {
            control_point,
            variant: None,
        }
    }

    /// The variant that matched during discovery, if any.
    pub fn variant(&self) -> Option<Variant> {
        self.variant
    }

    /// Get the gateway's external IP address.
    pub async fn external_ip(&self) -> Result<IpAddr, UpnpError> {
        self.control_point.external_ip().await
    }

    /// Resolve the gateway's own IP address from the hostname embedded
    /// in the endpoint's location.
    pub async fn gateway_ip(&self) -> Result<IpAddr, UpnpError> {
        let location = self.control_point.location();
        let url = Url::parse(location)
            .map_err(|e| UpnpError::Resolution(format!("parse location {}: {}", location, e)))?;

        let host = url
            .host_str()
            .ok_or_else(|| UpnpError::Resolution(format!("no host in location {}", location)))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| UpnpError::Resolution(format!("lookup {}: {}", host, e)))?;

        addrs.next().map(|addr| addr.ip()).ok_or_else(|| {
            UpnpError::Resolution(format!("no IP addresses found for location {}", location))
        })
    }

    /// The local address used to reach the endpoint.
    pub fn source_ip(&self) -> IpAddr {
        self.control_point.local_ip()
    }

    /// Add the port mapping on the gateway.
    ///
    /// The internal client address must be convertible to the endpoint's
    /// address family; a mismatch fails before any network I/O.
    pub async fn add_port_mapping(&self, mapping: &PortMapping) -> Result<(), UpnpError> {
        let internal_client =
            convert_to_family(mapping.internal_client, self.control_point.local_ip())?;

        let mapping = PortMapping {
            internal_client,
            ..mapping.clone()
        };

        self.control_point.add_port_mapping(&mapping).await
    }
}

/// Convert `client` into the address family of `endpoint`, unmapping
/// IPv4-mapped IPv6 addresses where possible.
fn convert_to_family(client: IpAddr, endpoint: IpAddr) -> Result<IpAddr, UpnpError> {
    match (client, endpoint) {
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => Ok(client),
        (IpAddr::V6(v6), IpAddr::V4(_)) => match v6.to_ipv4_mapped() {
            Some(v4) => Ok(IpAddr::V4(v4)),
            None => Err(UpnpError::FamilyMismatch {
                client,
                family: "IPv4",
            }),
        },
        (IpAddr::V4(v4), IpAddr::V6(_)) => Ok(IpAddr::V6(v4.to_ipv6_mapped())),
    }
}
