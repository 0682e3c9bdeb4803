//! UPnP-IGD mapper drivers.
//!
//! Two drivers share the SOAP-over-TCP plumbing: the port mapping driver
//! speaks to `WANIPConnection`/`WANPPPConnection` services, the firewall
//! driver to `WANIPv6FirewallControl`. Both submit the byte-exact HTTP
//! requests of [`protocol::soap`] through the multiplexer and parse the
//! response body for the arguments they need.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    num::NonZeroU16,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tracing::trace;

use crate::{
    error::{CodecError, Error, ServerFailure, TransportError},
    gateway::{NetworkGateway, SocketHandle},
    mapping::{MappedPort, PortType, ProtocolTag},
};

pub mod protocol;

use protocol::soap::{render_address, Fault, HttpResponse, SoapAction};

/// How long a TCP connect to a control endpoint may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-chunk read timeout while collecting an HTTP response.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Read chunk size for HTTP responses.
const READ_CHUNK: usize = 16 * 1024;

/// Description the gateway shows for mappings created by this crate.
const PORT_MAPPING_DESCRIPTION: &str = "portmapper";

/// Pinhole lease bounds of the WANIPv6FirewallControl service.
const MAX_PINHOLE_LEASE: u32 = 86400;

/// The kind of service behind a [`UpnpEndpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// `WANIPConnection` (version 1 or 2) or `WANPPPConnection:1`.
    PortMapping {
        /// Service version; version 2 adds `AddAnyPortMapping`.
        version: u8,
    },
    /// `WANIPv6FirewallControl:1`.
    Firewall,
}

/// Identity of a control endpoint found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{service_type} at {host}{control_path}")]
pub struct UpnpEndpoint {
    /// Address the control endpoint listens on.
    pub addr: SocketAddr,
    /// Authority sent in the `Host` header.
    pub host: String,
    /// Path of the control endpoint.
    pub control_path: String,
    /// Exact service type string, echoed in the SOAP envelope.
    pub service_type: String,
    /// What the service can do.
    pub kind: ServiceKind,
}

/// A UPnP-IGD WAN connection service.
#[derive(Debug, Clone, derive_more::Display)]
#[display("UPnP gateway {endpoint}")]
pub struct UpnpPortMapper {
    net: NetworkGateway,
    endpoint: UpnpEndpoint,
    local_ip: IpAddr,
}

impl UpnpPortMapper {
    pub(crate) fn new(net: NetworkGateway, endpoint: UpnpEndpoint, local_ip: IpAddr) -> Self {
        UpnpPortMapper {
            net,
            endpoint,
            local_ip,
        }
    }

    /// The endpoint this mapper talks to.
    pub fn endpoint(&self) -> &UpnpEndpoint {
        &self.endpoint
    }

    /// Creates a mapping.
    ///
    /// With no external port preference on a version 2 service the gateway
    /// picks the port through `AddAnyPortMapping`; everywhere else
    /// `AddPortMapping` is used, suggesting the internal port when the
    /// caller has no preference.
    pub async fn map(
        &self,
        port_type: PortType,
        internal_port: NonZeroU16,
        external_port_hint: Option<NonZeroU16>,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let version = match self.endpoint.kind {
            ServiceKind::PortMapping { version } => version,
            ServiceKind::Firewall => return Err(Error::InvalidArgument("service")),
        };

        let external_port = if external_port_hint.is_none() && version >= 2 {
            let action = add_any_port_mapping(
                port_type,
                internal_port.get(),
                self.local_ip,
                lifetime_seconds,
            )?;
            let body = self.soap(action).await?;
            protocol::soap::response_argument(&body, "NewReservedPort")?
                .and_then(|port| port.parse::<u16>().ok())
                .ok_or(CodecError::Malformed)?
        } else {
            let suggestion = external_port_hint.unwrap_or(internal_port).get();
            let action = add_port_mapping(
                None,
                suggestion,
                port_type,
                internal_port.get(),
                self.local_ip,
                true,
                PORT_MAPPING_DESCRIPTION,
                lifetime_seconds,
            )?;
            self.soap(action).await?;
            suggestion
        };

        let external_address = self.external_ip().await?;
        Ok(MappedPort {
            port_type,
            internal_port,
            external_port,
            external_address,
            lifetime_seconds,
            protocol: ProtocolTag::UpnpPortMapping,
        })
    }

    /// Refreshes a mapping by re-adding it with a new lease duration.
    pub async fn refresh(
        &self,
        port: &MappedPort,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let action = add_port_mapping(
            None,
            port.external_port,
            port.port_type,
            port.internal_port.get(),
            self.local_ip,
            true,
            PORT_MAPPING_DESCRIPTION,
            lifetime_seconds,
        )?;
        self.soap(action).await?;
        Ok(MappedPort {
            lifetime_seconds,
            ..port.clone()
        })
    }

    /// Releases a mapping.
    pub async fn unmap(&self, port: &MappedPort) -> Result<(), Error> {
        let action = delete_port_mapping(None, port.external_port, port.port_type)?;
        self.soap(action).await?;
        Ok(())
    }

    /// Asks the gateway for its external address.
    pub async fn external_ip(&self) -> Result<IpAddr, Error> {
        let body = self.soap(SoapAction::new("GetExternalIPAddress")).await?;
        protocol::soap::response_argument(&body, "NewExternalIPAddress")?
            .and_then(|addr| addr.parse().ok())
            .ok_or_else(|| CodecError::Malformed.into())
    }

    async fn soap(&self, action: SoapAction) -> Result<Vec<u8>, Error> {
        soap_request(&self.net, &self.endpoint, action).await
    }
}

/// A UPnP-IGD IPv6 firewall control service.
///
/// No NAT occurs: a pinhole opens the firewall for traffic towards the
/// client's own address, so the mapping's external address and port are the
/// internal ones.
#[derive(Debug, Clone, derive_more::Display)]
#[display("UPnP firewall {endpoint}")]
pub struct UpnpFirewallMapper {
    net: NetworkGateway,
    endpoint: UpnpEndpoint,
    local_ip: Ipv6Addr,
    /// `UniqueID`s of the pinholes created through this mapper, so refresh
    /// and unmap address the right server-side entry.
    pinholes: Arc<Mutex<HashMap<(PortType, u16), String>>>,
}

impl UpnpFirewallMapper {
    pub(crate) fn new(net: NetworkGateway, endpoint: UpnpEndpoint, local_ip: Ipv6Addr) -> Self {
        UpnpFirewallMapper {
            net,
            endpoint,
            local_ip,
            pinholes: Default::default(),
        }
    }

    /// The endpoint this mapper talks to.
    pub fn endpoint(&self) -> &UpnpEndpoint {
        &self.endpoint
    }

    /// Opens a pinhole for `internal_port`.
    pub async fn map(
        &self,
        port_type: PortType,
        internal_port: NonZeroU16,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let lease = pinhole_lease(lifetime_seconds)?;
        let action = add_pinhole(port_type, internal_port.get(), self.local_ip, lease);
        let body = self.soap(action).await?;
        let unique_id = protocol::soap::response_argument(&body, "UniqueID")?
            .ok_or(CodecError::Malformed)?;
        self.pinholes
            .lock()
            .expect("poisoned")
            .insert((port_type, internal_port.get()), unique_id);

        Ok(MappedPort {
            port_type,
            internal_port,
            external_port: internal_port.get(),
            external_address: IpAddr::V6(self.local_ip),
            lifetime_seconds: lease,
            protocol: ProtocolTag::UpnpFirewall,
        })
    }

    /// Refreshes a pinhole by opening it again; the new `UniqueID` replaces
    /// the stored one.
    pub async fn refresh(
        &self,
        port: &MappedPort,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let refreshed = self
            .map(port.port_type, port.internal_port, lifetime_seconds)
            .await?;
        Ok(refreshed)
    }

    /// Closes a pinhole.
    pub async fn unmap(&self, port: &MappedPort) -> Result<(), Error> {
        let unique_id = self
            .pinholes
            .lock()
            .expect("poisoned")
            .remove(&(port.port_type, port.internal_port.get()))
            .ok_or(Error::InvalidArgument("port"))?;
        let action = SoapAction::new("DeletePinhole").argument("UniqueID", unique_id);
        self.soap(action).await?;
        Ok(())
    }

    /// Asks the firewall how long it keeps outbound pinholes open.
    pub async fn outbound_pinhole_timeout(&self) -> Result<u32, Error> {
        let action = SoapAction::new("GetOutboundPinholeTimeout")
            .argument("RemoteHost", "")
            .argument("RemotePort", "0")
            .argument("InternalClient", render_address(IpAddr::V6(self.local_ip)))
            .argument("InternalPort", "0")
            .argument("Protocol", protocol_number(PortType::Udp));
        let body = self.soap(action).await?;
        protocol::soap::response_argument(&body, "OutboundPinholeTimeout")?
            .and_then(|timeout| timeout.parse().ok())
            .ok_or_else(|| CodecError::Malformed.into())
    }

    async fn soap(&self, action: SoapAction) -> Result<Vec<u8>, Error> {
        soap_request(&self.net, &self.endpoint, action).await
    }
}

/// Runs one SOAP action against a control endpoint: connect, send the fixed
/// request bytes, collect the response, map SOAP faults to
/// [`ServerFailure::Upnp`]. Returns the response body.
async fn soap_request(
    net: &NetworkGateway,
    endpoint: &UpnpEndpoint,
    action: SoapAction,
) -> Result<Vec<u8>, Error> {
    trace!("{} on {}", action.name(), endpoint);
    let request = action.encode_request(&endpoint.host, &endpoint.control_path, &endpoint.service_type);
    let response = http_request(net, endpoint.addr, request.into()).await?;
    if response.status == 200 {
        return Ok(response.body);
    }
    match Fault::parse(&response.body) {
        Some(fault) => Err(ServerFailure::Upnp {
            code: fault.code,
            description: fault.description,
        }
        .into()),
        None => Err(ServerFailure::Upnp {
            code: response.status,
            description: "http error".into(),
        }
        .into()),
    }
}

/// Fetches a document with a plain GET, used for device descriptors.
pub(crate) async fn http_get(
    net: &NetworkGateway,
    addr: SocketAddr,
    host: &str,
    path: &str,
) -> Result<Vec<u8>, Error> {
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: Close\r\n\
         \r\n"
    );
    let response = http_request(net, addr, request.into_bytes().into()).await?;
    if response.status != 200 {
        return Err(ServerFailure::Upnp {
            code: response.status,
            description: "http error".into(),
        }
        .into());
    }
    Ok(response.body)
}

async fn http_request(
    net: &NetworkGateway,
    addr: SocketAddr,
    request: Bytes,
) -> Result<HttpResponse, Error> {
    let local = unspecified_for(addr);
    let handle = net.connect_tcp(local, addr, CONNECT_TIMEOUT).await?;
    let result = http_request_on(net, handle, request).await;
    net.close(handle);
    result
}

async fn http_request_on(
    net: &NetworkGateway,
    handle: SocketHandle,
    request: Bytes,
) -> Result<HttpResponse, Error> {
    net.send(handle, request).await?;
    let mut collected = Vec::new();
    loop {
        let inbound = net.read(handle, READ_CHUNK, READ_TIMEOUT).await;
        let (chunk, eof) = match inbound {
            Ok(inbound) => {
                let eof = inbound.bytes.is_empty();
                (inbound.bytes, eof)
            }
            // the peer resetting after the body counts as end of stream
            Err(TransportError::ConnectionReset) if !collected.is_empty() => {
                (Bytes::new(), true)
            }
            Err(e) => return Err(e.into()),
        };
        collected.extend_from_slice(&chunk);
        if let Some(response) = HttpResponse::parse(&collected, eof)? {
            return Ok(response);
        }
        if eof {
            return Err(CodecError::Truncated.into());
        }
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    if addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}

/// `Protocol` argument of the firewall service, an IANA protocol number.
fn protocol_number(port_type: PortType) -> &'static str {
    match port_type {
        PortType::Tcp => "6",
        PortType::Udp => "17",
    }
}

fn check_lease(lifetime_seconds: u32) -> Result<(), Error> {
    // WANIPConnection leases top out at a week
    if lifetime_seconds > 604800 {
        return Err(Error::InvalidArgument("lifetime"));
    }
    Ok(())
}

fn pinhole_lease(lifetime_seconds: u32) -> Result<u32, Error> {
    if lifetime_seconds == 0 || lifetime_seconds > MAX_PINHOLE_LEASE {
        return Err(Error::InvalidArgument("lifetime"));
    }
    Ok(lifetime_seconds)
}

/// Builds an `AddPortMapping` action.
///
/// The wildcard internal port is not permitted here, unlike external ports
/// in deletes; an absent remote host renders as an empty element.
fn add_port_mapping(
    remote_host: Option<IpAddr>,
    external_port: u16,
    port_type: PortType,
    internal_port: u16,
    internal_client: IpAddr,
    enabled: bool,
    description: &str,
    lease_seconds: u32,
) -> Result<SoapAction, Error> {
    if internal_port == 0 {
        return Err(Error::InvalidArgument("internal_port"));
    }
    check_lease(lease_seconds)?;
    Ok(SoapAction::new("AddPortMapping")
        .argument("NewRemoteHost", render_optional_address(remote_host))
        .argument("NewExternalPort", external_port.to_string())
        .argument("NewProtocol", port_type.to_string())
        .argument("NewInternalPort", internal_port.to_string())
        .argument("NewInternalClient", render_address(internal_client))
        .argument("NewEnabled", if enabled { "1" } else { "0" })
        .argument("NewPortMappingDescription", description)
        .argument("NewLeaseDuration", lease_seconds.to_string()))
}

/// Builds an `AddAnyPortMapping` action (`WANIPConnection:2`).
fn add_any_port_mapping(
    port_type: PortType,
    internal_port: u16,
    internal_client: IpAddr,
    lease_seconds: u32,
) -> Result<SoapAction, Error> {
    if internal_port == 0 {
        return Err(Error::InvalidArgument("internal_port"));
    }
    check_lease(lease_seconds)?;
    Ok(SoapAction::new("AddAnyPortMapping")
        .argument("NewRemoteHost", "")
        .argument("NewExternalPort", internal_port.to_string())
        .argument("NewProtocol", port_type.to_string())
        .argument("NewInternalPort", internal_port.to_string())
        .argument("NewInternalClient", render_address(internal_client))
        .argument("NewEnabled", "1")
        .argument("NewPortMappingDescription", PORT_MAPPING_DESCRIPTION)
        .argument("NewLeaseDuration", lease_seconds.to_string()))
}

/// Builds a `DeletePortMapping` action.
fn delete_port_mapping(
    remote_host: Option<IpAddr>,
    external_port: u16,
    port_type: PortType,
) -> Result<SoapAction, Error> {
    Ok(SoapAction::new("DeletePortMapping")
        .argument("NewRemoteHost", render_optional_address(remote_host))
        .argument("NewExternalPort", external_port.to_string())
        .argument("NewProtocol", port_type.to_string()))
}

/// Builds an `AddPinhole` action.
fn add_pinhole(
    port_type: PortType,
    internal_port: u16,
    internal_client: Ipv6Addr,
    lease_seconds: u32,
) -> SoapAction {
    SoapAction::new("AddPinhole")
        .argument("RemoteHost", "")
        .argument("RemotePort", "0")
        .argument("InternalClient", render_address(IpAddr::V6(internal_client)))
        .argument("InternalPort", internal_port.to_string())
        .argument("Protocol", protocol_number(port_type))
        .argument("LeaseTime", lease_seconds.to_string())
}

fn render_optional_address(addr: Option<IpAddr>) -> String {
    addr.map(render_address).unwrap_or_default()
}
