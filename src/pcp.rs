//! PCP mapper driver ([RFC 6887](https://datatracker.ietf.org/doc/html/rfc6887)).
//!
//! Every operation runs on its own ephemeral UDP socket created through the
//! multiplexer and correlates its reply by the 96-bit nonce carried in the
//! MAP data. The nonce of an active mapping is kept keyed by its port so
//! refreshes and deletes present the nonce the server stored with the
//! mapping.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    num::NonZeroU16,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    defaults,
    error::{Error, ServerFailure, TransportError},
    gateway::{NetworkGateway, SocketHandle},
    mapping::{MappedPort, PortType, ProtocolTag},
    util::RetrySchedule,
};

pub mod protocol;

use protocol::{MapProtocol, OpcodeData, Request, Response, ResultCode};

/// A PCP gateway.
#[derive(Debug, Clone, derive_more::Display)]
#[display("PCP gateway {gateway_ip}")]
pub struct PcpMapper {
    net: NetworkGateway,
    local_ip: IpAddr,
    gateway_ip: IpAddr,
    server_port: u16,
    /// Nonces of the mappings created through this mapper, so refresh and
    /// unmap authenticate as the owner of the server-side state.
    nonces: Arc<Mutex<HashMap<(PortType, u16), [u8; 12]>>>,
    /// Highest server epoch observed. A backwards step means the server
    /// lost its mapping state.
    last_epoch: Arc<Mutex<Option<u32>>>,
}

impl PcpMapper {
    pub(crate) fn new(net: NetworkGateway, local_ip: IpAddr, gateway_ip: IpAddr) -> Self {
        PcpMapper {
            net,
            local_ip,
            gateway_ip,
            server_port: protocol::SERVER_PORT,
            nonces: Default::default(),
            last_epoch: Default::default(),
        }
    }

    #[cfg(test)]
    fn with_server_port(
        net: NetworkGateway,
        local_ip: IpAddr,
        gateway_ip: IpAddr,
        server_port: u16,
    ) -> Self {
        PcpMapper {
            server_port,
            ..Self::new(net, local_ip, gateway_ip)
        }
    }

    /// The gateway this mapper talks to.
    pub fn gateway(&self) -> IpAddr {
        self.gateway_ip
    }

    /// Creates a mapping with a fresh nonce.
    pub async fn map(
        &self,
        port_type: PortType,
        internal_port: NonZeroU16,
        external_port_hint: Option<NonZeroU16>,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let mapped = self
            .request_mapping(
                nonce,
                port_type,
                internal_port,
                external_port_hint.map(NonZeroU16::get),
                None,
                lifetime_seconds,
            )
            .await?;
        self.remember_nonce(port_type, internal_port.get(), nonce);
        Ok(mapped)
    }

    /// Refreshes a mapping, suggesting the granted external port and address
    /// so the server can restore state it may have lost.
    pub async fn refresh(
        &self,
        port: &MappedPort,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let nonce = self.nonce_for(port);
        let mapped = self
            .request_mapping(
                nonce,
                port.port_type,
                port.internal_port,
                Some(port.external_port),
                Some(port.external_address),
                lifetime_seconds,
            )
            .await?;
        self.remember_nonce(port.port_type, port.internal_port.get(), nonce);
        Ok(mapped)
    }

    /// Releases a mapping: the same request with a zero lifetime.
    pub async fn unmap(&self, port: &MappedPort) -> Result<(), Error> {
        let nonce = self.nonce_for(port);
        let request = Request::mapping(
            nonce,
            map_protocol(port.port_type),
            port.internal_port.get(),
            self.local_ip,
            None,
            None,
            0,
            Vec::new(),
        )?;
        self.request(request, Instant::now() + defaults::MAPPING_DEADLINE)
            .await?;
        self.nonces
            .lock()
            .expect("poisoned")
            .remove(&(port.port_type, port.internal_port.get()));
        Ok(())
    }

    async fn request_mapping(
        &self,
        nonce: [u8; 12],
        port_type: PortType,
        internal_port: NonZeroU16,
        external_port_hint: Option<u16>,
        external_address_hint: Option<IpAddr>,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let request = Request::mapping(
            nonce,
            map_protocol(port_type),
            internal_port.get(),
            self.local_ip,
            external_port_hint,
            external_address_hint,
            lifetime_seconds,
            Vec::new(),
        )?;
        let response = self
            .request(request, Instant::now() + defaults::MAPPING_DEADLINE)
            .await?;

        let OpcodeData::MapData(map_data) = response.data else {
            unreachable!("correlated against the request nonce");
        };
        let external_address = from_pcp_addr(map_data.external_address);
        let external_port = map_data.external_port;
        Ok(MappedPort {
            port_type,
            internal_port,
            external_port,
            external_address,
            lifetime_seconds: response.lifetime_seconds,
            protocol: ProtocolTag::Pcp,
        })
    }

    /// Sends `request`, retransmitting on the RFC schedule until the nonce-
    /// correlated reply arrives or `deadline` passes. Error responses
    /// classified short lifetime are retried after the server-supplied
    /// interval.
    async fn request(&self, request: Request, deadline: Instant) -> Result<Response, Error> {
        let local = SocketAddr::new(self.local_ip, 0);
        let (handle, _) = self.net.create_udp(local).await?;
        let result = self.request_on(handle, &request, deadline).await;
        self.net.close(handle);
        result
    }

    async fn request_on(
        &self,
        handle: SocketHandle,
        request: &Request,
        deadline: Instant,
    ) -> Result<Response, Error> {
        let server = SocketAddr::new(self.gateway_ip, self.server_port);
        let bytes = Bytes::from(request.encode());
        let schedule = RetrySchedule::new(
            defaults::INITIAL_REQUEST_TIMEOUT,
            defaults::MAX_REQUEST_TIMEOUT,
            defaults::MAX_REQUEST_ATTEMPTS,
        );

        for wait in schedule {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let attempt_deadline = deadline.min(now + wait);

            if let Err(e) = self.net.send_to(handle, server, bytes.clone()).await {
                match e {
                    TransportError::Unreachable => {
                        debug!("gateway {server} unreachable, retrying");
                        tokio::time::sleep_until(attempt_deadline).await;
                        continue;
                    }
                    other => return Err(other.into()),
                }
            }

            loop {
                let remaining = attempt_deadline.saturating_duration_since(Instant::now());
                let inbound = match self.net.read(handle, Response::MAX_SIZE, remaining).await {
                    Ok(inbound) => inbound,
                    // next slot of the retransmission schedule
                    Err(TransportError::Timeout) => break,
                    Err(other) => return Err(other.into()),
                };
                if inbound.from.map(|from| from.ip()) != Some(self.gateway_ip) {
                    trace!("dropping datagram from unexpected source");
                    continue;
                }
                let response = match Response::decode(&inbound.bytes) {
                    Ok(response) => response,
                    Err(e) => {
                        trace!("dropping malformed datagram: {e}");
                        continue;
                    }
                };
                if !correlates(request, &response) {
                    trace!("dropping uncorrelated response");
                    continue;
                }
                self.check_epoch(response.epoch_time);
                match response.result_code {
                    ResultCode::Success => return Ok(response),
                    ResultCode::Error(code) if code.is_transient() => {
                        // short lifetime error: the response lifetime is the
                        // server-requested retry-after
                        let retry_after =
                            std::time::Duration::from_secs(response.lifetime_seconds.into());
                        let wakeup = deadline.min(Instant::now() + retry_after);
                        debug!("gateway busy ({code}), retrying after {retry_after:?}");
                        tokio::time::sleep_until(wakeup).await;
                        break;
                    }
                    ResultCode::Error(code) => {
                        return Err(ServerFailure::Pcp(code).into());
                    }
                }
            }
        }
        Err(TransportError::Timeout.into())
    }

    /// Applies the epoch validation of RFC 6887 section 8.5: a server whose
    /// epoch stepped backwards lost its state, so the nonces remembered for
    /// it no longer authenticate anything and the next map starts fresh.
    fn check_epoch(&self, epoch_time: u32) {
        let mut last = self.last_epoch.lock().expect("poisoned");
        if let Some(previous) = *last {
            if epoch_time.saturating_add(1) < previous {
                debug!("server epoch went back ({previous} -> {epoch_time}), mappings lost");
                self.nonces.lock().expect("poisoned").clear();
            }
        }
        *last = Some(epoch_time);
    }

    fn remember_nonce(&self, port_type: PortType, port: u16, nonce: [u8; 12]) {
        self.nonces
            .lock()
            .expect("poisoned")
            .insert((port_type, port), nonce);
    }

    /// The nonce the server stored with this mapping, or a fresh one if the
    /// mapping was not created through this mapper instance.
    fn nonce_for(&self, port: &MappedPort) -> [u8; 12] {
        let known = self
            .nonces
            .lock()
            .expect("poisoned")
            .get(&(port.port_type, port.internal_port.get()))
            .copied();
        known.unwrap_or_else(|| {
            let mut nonce = [0u8; 12];
            rand::thread_rng().fill_bytes(&mut nonce);
            nonce
        })
    }
}

fn map_protocol(port_type: PortType) -> MapProtocol {
    match port_type {
        PortType::Udp => MapProtocol::Udp,
        PortType::Tcp => MapProtocol::Tcp,
    }
}

/// Undoes the 16-byte address encoding: IPv4-mapped addresses come back as
/// IPv4.
fn from_pcp_addr(addr: std::net::Ipv6Addr) -> IpAddr {
    match addr.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(addr),
    }
}

/// A MAP reply correlates iff it echoes the request's nonce, protocol and
/// internal port.
fn correlates(request: &Request, response: &Response) -> bool {
    match (&request.opcode_data, &response.data) {
        (OpcodeData::Announce, OpcodeData::Announce) => true,
        (OpcodeData::MapData(sent), OpcodeData::MapData(got)) => {
            sent.nonce == got.nonce
                && sent.protocol == got.protocol
                && sent.internal_port == got.internal_port
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use protocol::MapData;

    fn map_data(nonce: [u8; 12], internal_port: u16) -> MapData {
        MapData {
            nonce,
            protocol: MapProtocol::Udp,
            internal_port,
            external_port: 6000,
            external_address: Ipv4Addr::new(203, 0, 113, 1).to_ipv6_mapped(),
        }
    }

    #[test]
    fn test_correlation_requires_matching_nonce() {
        let nonce = [3u8; 12];
        let request = Request::mapping(
            nonce,
            MapProtocol::Udp,
            5000,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            None,
            7200,
            Vec::new(),
        )
        .unwrap();
        let response = Response {
            result_code: ResultCode::Success,
            lifetime_seconds: 7200,
            epoch_time: 1,
            data: OpcodeData::MapData(map_data(nonce, 5000)),
            options: Vec::new(),
        };
        assert!(correlates(&request, &response));

        let wrong_nonce = Response {
            data: OpcodeData::MapData(map_data([4u8; 12], 5000)),
            ..response.clone()
        };
        assert!(!correlates(&request, &wrong_nonce));

        let wrong_port = Response {
            data: OpcodeData::MapData(map_data(nonce, 5001)),
            ..response
        };
        assert!(!correlates(&request, &wrong_port));
    }

    /// A minimal in-process PCP server answering MAP requests.
    async fn fake_gateway(socket: tokio::net::UdpSocket) {
        let mut buf = vec![0u8; Response::MAX_SIZE];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            // version 2, MAP request, data after the 24 byte header
            if n < 60 || buf[0] != 2 || buf[1] != 1 {
                continue;
            }
            let mut reply = Vec::with_capacity(60);
            reply.push(2); // version
            reply.push(0x81); // MAP response
            reply.push(0); // reserved
            reply.push(0); // success
            reply.extend_from_slice(&buf[4..8]); // echo lifetime
            reply.extend_from_slice(&100u32.to_be_bytes()); // epoch
            reply.extend_from_slice(&[0u8; 12]); // reserved
            reply.extend_from_slice(&buf[24..36]); // echo nonce
            reply.push(buf[36]); // echo protocol
            reply.extend_from_slice(&[0u8; 3]);
            reply.extend_from_slice(&buf[40..42]); // echo internal port
            reply.extend_from_slice(&6000u16.to_be_bytes()); // assigned port
            reply.extend_from_slice(&Ipv4Addr::new(203, 0, 113, 1).to_ipv6_mapped().octets());
            let _ = socket.send_to(&reply, from).await;
        }
    }

    #[tokio::test]
    async fn test_map_and_unmap_against_fake_gateway() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // tests cannot bind the well-known PCP port
        let server_port = server.local_addr().unwrap().port();
        let gateway_task = tokio::spawn(fake_gateway(server));

        let net = NetworkGateway::spawn();
        let mapper = PcpMapper::with_server_port(
            net,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port,
        );
        let port = NonZeroU16::new(5000).unwrap();
        let mapped = mapper.map(PortType::Udp, port, None, 7200).await.unwrap();
        assert_eq!(mapped.internal_port, port);
        assert_eq!(mapped.external_port, 6000);
        assert_eq!(mapped.external_address, IpAddr::from([203, 0, 113, 1]));
        assert_eq!(mapped.lifetime_seconds, 7200);
        assert_eq!(mapped.protocol, ProtocolTag::Pcp);

        let refreshed = mapper.refresh(&mapped, 7200).await.unwrap();
        assert_eq!(refreshed.external_port, 6000);

        mapper.unmap(&mapped).await.unwrap();
        gateway_task.abort();
    }
}
