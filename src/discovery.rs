//! Discovery engine.
//!
//! For every local address this concurrently probes derived gateway
//! candidates over NAT-PMP/PCP and searches for IGDs over SSDP, collects
//! replies within a bounded window, and returns the union of everything
//! found as ready-to-use [`Mapper`]s.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use crate::{
    defaults,
    error::Error,
    gateway::NetworkGateway,
    mapping::Mapper,
    nat_pmp::{self, NatPmpMapper},
    pcp::{self, PcpMapper},
    upnp::{
        self,
        protocol::{descriptor::DeviceDescriptor, ssdp},
        ServiceKind, UpnpEndpoint, UpnpFirewallMapper, UpnpPortMapper,
    },
    util::RetrySchedule,
};

/// Finds every mapper reachable from this host.
///
/// Blocks for at most the discovery window. Returns
/// [`Error::NoGatewayFound`] when nothing answered.
pub async fn discover(net: &NetworkGateway) -> Result<Vec<Mapper>, Error> {
    let local_ips = net.local_ips().await?;
    if local_ips.is_empty() {
        return Err(Error::NoGatewayFound);
    }
    let deadline = Instant::now() + defaults::DISCOVERY_TIMEOUT;

    let mut tasks: FuturesUnordered<BoxFuture<'_, Vec<Mapper>>> = FuturesUnordered::new();
    for local_ip in local_ips {
        tasks.push(probe_candidates(net, local_ip, deadline).boxed());
        tasks.push(ssdp_search(net, local_ip, deadline).boxed());
    }

    let mut mappers: Vec<Mapper> = Vec::new();
    while let Some(found) = tasks.next().await {
        for mapper in found {
            // the same gateway can be reachable from several local addresses
            if !mappers
                .iter()
                .any(|known| known.to_string() == mapper.to_string())
            {
                debug!("discovered {mapper}");
                mappers.push(mapper);
            }
        }
    }

    if mappers.is_empty() {
        Err(Error::NoGatewayFound)
    } else {
        Ok(mappers)
    }
}

/// Gateway addresses worth probing from `local_ip`: the platform-reported
/// default route, then the `.1` heuristic for IPv4 segments.
fn gateway_candidates(local_ip: IpAddr) -> Vec<IpAddr> {
    let mut candidates = Vec::new();
    if let Ok(route) = default_net::get_default_gateway() {
        if route.ip_addr.is_ipv4() == local_ip.is_ipv4() {
            candidates.push(route.ip_addr);
        }
    }
    if let IpAddr::V4(v4) = local_ip {
        let octets = v4.octets();
        let guess = IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], 1));
        if guess != local_ip && !candidates.contains(&guess) {
            candidates.push(guess);
        }
    }
    candidates
}

async fn probe_candidates(
    net: &NetworkGateway,
    local_ip: IpAddr,
    deadline: Instant,
) -> Vec<Mapper> {
    for candidate in gateway_candidates(local_ip) {
        let found = probe_gateway(net, local_ip, candidate, deadline).await;
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

/// Sends a NAT-PMP external-address request and a PCP delete-probe to the
/// candidate and classifies it by what comes back: a NAT-PMP reply or a PCP
/// `UNSUPP_VERSION` marks a NAT-PMP gateway, any other well-formed PCP
/// reply marks a PCP one.
async fn probe_gateway(
    net: &NetworkGateway,
    local_ip: IpAddr,
    gateway_ip: IpAddr,
    deadline: Instant,
) -> Vec<Mapper> {
    let local = SocketAddr::new(local_ip, 0);
    let Ok((handle, _)) = net.create_udp(local).await else {
        return Vec::new();
    };
    let server = SocketAddr::new(gateway_ip, pcp::protocol::SERVER_PORT);

    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    // a random nonce matches no existing mapping, so the all-protocols
    // delete is a no-op on the server
    let pcp_probe = pcp::protocol::Request::mapping(
        nonce,
        pcp::protocol::MapProtocol::All,
        0,
        local_ip,
        None,
        None,
        0,
        Vec::new(),
    )
    .expect("wildcard delete is a valid request")
    .encode();
    let pmp_probe = nat_pmp::protocol::Request::ExternalAddress.encode();

    let mut pcp_seen = false;
    let mut pmp_seen = false;

    let schedule = RetrySchedule::new(
        defaults::INITIAL_REQUEST_TIMEOUT,
        defaults::MAX_REQUEST_TIMEOUT,
        defaults::MAX_REQUEST_ATTEMPTS,
    );
    'attempts: for wait in schedule {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let attempt_deadline = deadline.min(now + wait);

        if net
            .send_to(handle, server, Bytes::from(pcp_probe.clone()))
            .await
            .is_err()
        {
            break;
        }
        if local_ip.is_ipv4() {
            let _ = net
                .send_to(handle, server, Bytes::from(pmp_probe.clone()))
                .await;
        }

        loop {
            let remaining = attempt_deadline.saturating_duration_since(Instant::now());
            let Ok(inbound) = net.read(handle, pcp::protocol::Response::MAX_SIZE, remaining).await
            else {
                if pcp_seen || pmp_seen {
                    break 'attempts;
                }
                // next retransmission slot
                continue 'attempts;
            };
            if inbound.from.map(|from| from.ip()) != Some(gateway_ip) {
                continue;
            }
            match inbound.bytes.first() {
                Some(0) => {
                    if let Ok(nat_pmp::protocol::Response::PublicAddress { .. }) =
                        nat_pmp::protocol::Response::decode(&inbound.bytes)
                    {
                        trace!("{gateway_ip} answered nat-pmp");
                        pmp_seen = true;
                    }
                }
                Some(2) => match pcp::protocol::Response::decode(&inbound.bytes) {
                    Ok(response) => match response.result_code {
                        pcp::protocol::ResultCode::Error(
                            pcp::protocol::ErrorCode::UnsuppVersion,
                        ) => {
                            trace!("{gateway_ip} speaks nat-pmp only");
                            pmp_seen = true;
                        }
                        _ => {
                            trace!("{gateway_ip} answered pcp");
                            pcp_seen = true;
                        }
                    },
                    Err(e) => trace!("dropping malformed pcp datagram: {e}"),
                },
                _ => {}
            }
            if pcp_seen && (pmp_seen || !local_ip.is_ipv4()) {
                break 'attempts;
            }
        }
    }
    net.close(handle);

    let mut mappers = Vec::new();
    if pcp_seen {
        mappers.push(Mapper::Pcp(PcpMapper::new(
            net.clone(),
            local_ip,
            gateway_ip,
        )));
    }
    if pmp_seen {
        if let (IpAddr::V4(local), IpAddr::V4(gateway)) = (local_ip, gateway_ip) {
            mappers.push(Mapper::NatPmp(NatPmpMapper::new(
                net.clone(),
                local,
                gateway,
            )));
        }
    }
    mappers
}

/// Searches the SSDP multicast group for IGDs, fetches each distinct
/// descriptor and emits one mapper per recognized service.
async fn ssdp_search(net: &NetworkGateway, local_ip: IpAddr, deadline: Instant) -> Vec<Mapper> {
    let local = SocketAddr::new(local_ip, 0);
    let Ok((handle, _)) = net.create_udp(local).await else {
        return Vec::new();
    };
    let group: SocketAddr = if local_ip.is_ipv4() {
        ssdp::MULTICAST_ADDR_V4.into()
    } else {
        ssdp::MULTICAST_ADDR_V6.into()
    };

    for target in ssdp::SearchTarget::ALL {
        let request = ssdp::SearchRequest::new(group, target, defaults::SSDP_MX)
            .expect("mx constant is in range");
        if let Err(e) = net
            .send_to(handle, group, Bytes::from(request.encode()))
            .await
        {
            debug!("ssdp search on {local_ip} failed: {e}");
            net.close(handle);
            return Vec::new();
        }
    }

    // responders spread replies over MX seconds
    let window = Duration::from_secs(u64::from(defaults::SSDP_MX) + 1);
    let window_deadline = deadline.min(Instant::now() + window);
    let mut locations: Vec<String> = Vec::new();
    loop {
        let remaining = window_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Ok(inbound) = net.read(handle, 2048, remaining).await else {
            break;
        };
        match ssdp::SearchResponse::decode(&inbound.bytes) {
            Ok(response) => {
                if !locations.contains(&response.location) {
                    trace!("ssdp response from {:?}: {}", inbound.from, response.location);
                    locations.push(response.location);
                }
            }
            Err(e) => trace!("dropping ssdp datagram: {e}"),
        }
    }
    net.close(handle);

    let mut mappers = Vec::new();
    for location in locations {
        match fetch_endpoints(net, &location, local_ip).await {
            Ok(mut found) => mappers.append(&mut found),
            Err(e) => debug!("fetching descriptor {location} failed: {e}"),
        }
    }
    mappers
}

/// Fetches and parses the descriptor behind an SSDP `LOCATION` and builds a
/// mapper per recognized service.
async fn fetch_endpoints(
    net: &NetworkGateway,
    location: &str,
    local_ip: IpAddr,
) -> Result<Vec<Mapper>, Error> {
    let url = Url::parse(location).map_err(|_| crate::CodecError::Malformed)?;
    let Some(host) = url.host_str() else {
        return Err(crate::CodecError::Malformed.into());
    };
    // descriptors advertise literal addresses; names would need a resolver
    let Ok(ip) = host.parse::<IpAddr>() else {
        debug!("ignoring descriptor at non-literal host {host}");
        return Ok(Vec::new());
    };
    let port = url.port_or_known_default().unwrap_or(80);
    let addr = SocketAddr::new(ip, port);
    let authority = addr.to_string();

    let body = upnp::http_get(net, addr, &authority, url.path()).await?;
    let descriptor = DeviceDescriptor::parse(&body)?;

    let mut mappers = Vec::new();
    for service in descriptor.services {
        let kind = match service.service_type.as_str() {
            upnp::protocol::WAN_IP_CONNECTION_1 | upnp::protocol::WAN_PPP_CONNECTION_1 => {
                ServiceKind::PortMapping { version: 1 }
            }
            upnp::protocol::WAN_IP_CONNECTION_2 => ServiceKind::PortMapping { version: 2 },
            upnp::protocol::WAN_IPV6_FIREWALL_CONTROL_1 => ServiceKind::Firewall,
            _ => continue,
        };
        let control_path = resolve_control_path(&service.control_url);
        let endpoint = UpnpEndpoint {
            addr,
            host: authority.clone(),
            control_path,
            service_type: service.service_type,
            kind,
        };
        match kind {
            ServiceKind::PortMapping { .. } => {
                mappers.push(Mapper::UpnpPort(UpnpPortMapper::new(
                    net.clone(),
                    endpoint,
                    local_ip,
                )));
            }
            ServiceKind::Firewall => {
                if let IpAddr::V6(local) = local_ip {
                    mappers.push(Mapper::UpnpFirewall(UpnpFirewallMapper::new(
                        net.clone(),
                        endpoint,
                        local,
                    )));
                }
            }
        }
    }
    Ok(mappers)
}

/// Control URLs come either absolute or as a path relative to the
/// descriptor's host.
fn resolve_control_path(control_url: &str) -> String {
    if let Ok(url) = Url::parse(control_url) {
        if url.has_host() {
            return url.path().to_string();
        }
    }
    if control_url.starts_with('/') {
        control_url.to_string()
    } else {
        format!("/{control_url}")
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_gateway_candidates_guesses_dot_one() {
        let candidates = gateway_candidates(IpAddr::V4(Ipv4Addr::new(192, 168, 7, 23)));
        assert!(candidates.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 7, 1))));
    }

    #[test]
    fn test_gateway_candidates_skip_self() {
        let candidates = gateway_candidates(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!candidates.contains(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_resolve_control_path() {
        assert_eq!(resolve_control_path("/ctl/IPConn"), "/ctl/IPConn");
        assert_eq!(resolve_control_path("ctl/IPConn"), "/ctl/IPConn");
        assert_eq!(
            resolve_control_path("http://192.168.1.1:5000/ctl/IPConn"),
            "/ctl/IPConn"
        );
    }

    const DESCRIPTOR: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceList>
      <device>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:WANIPConnection:2</serviceType>
            <controlURL>/ctl/IPConn</controlURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[tokio::test]
    async fn test_fetch_endpoints_from_descriptor() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{DESCRIPTOR}",
                DESCRIPTOR.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let net = NetworkGateway::spawn();
        let location = format!("http://{addr}/rootDesc.xml");
        let mappers = fetch_endpoints(&net, &location, IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        assert_eq!(mappers.len(), 1);
        let Mapper::UpnpPort(mapper) = &mappers[0] else {
            panic!("expected a port mapping service");
        };
        assert_eq!(mapper.endpoint().control_path, "/ctl/IPConn");
        assert_eq!(
            mapper.endpoint().kind,
            ServiceKind::PortMapping { version: 2 }
        );
        server.await.unwrap();
    }
}
