//! NAT-PMP mapper driver ([RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886)).
//!
//! Every operation runs on its own ephemeral UDP socket created through the
//! multiplexer. NAT-PMP has no transaction ids: within a socket, the first
//! well-formed reply whose opcode and fields match the outstanding request
//! wins, anything else is dropped. Since sockets are per-operation, two
//! in-flight operations towards the same gateway can never observe each
//! other's replies.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU16,
};

use bytes::Bytes;
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

use protocol::{MapProtocol, Request, Response, ResponseError, ResultCode};

/// A NAT-PMP gateway.
#[derive(Debug, Clone, derive_more::Display)]
#[display("NAT-PMP gateway {gateway_ip}")]
pub struct NatPmpMapper {
    net: NetworkGateway,
    local_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
    server_port: u16,
}

impl NatPmpMapper {
    pub(crate) fn new(net: NetworkGateway, local_ip: Ipv4Addr, gateway_ip: Ipv4Addr) -> Self {
        NatPmpMapper {
            net,
            local_ip,
            gateway_ip,
            server_port: protocol::SERVER_PORT,
        }
    }

    #[cfg(test)]
    fn with_server_port(
        net: NetworkGateway,
        local_ip: Ipv4Addr,
        gateway_ip: Ipv4Addr,
        server_port: u16,
    ) -> Self {
        NatPmpMapper {
            net,
            local_ip,
            gateway_ip,
            server_port,
        }
    }

    /// The gateway this mapper talks to.
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway_ip
    }

    /// Creates a mapping.
    ///
    /// The external address is obtained with a separate external-address
    /// request and kept in the returned [`MappedPort`] for the duration of
    /// the mapping.
    pub async fn map(
        &self,
        port_type: PortType,
        internal_port: NonZeroU16,
        external_port_hint: Option<NonZeroU16>,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let deadline = Instant::now() + defaults::MAPPING_DEADLINE;
        let external_address = self.external_address(deadline).await?;
        let (external_port, granted_lifetime) = self
            .request_mapping(
                port_type,
                internal_port.get(),
                external_port_hint.map(NonZeroU16::get).unwrap_or_default(),
                lifetime_seconds,
                deadline,
            )
            .await?;
        Ok(MappedPort {
            port_type,
            internal_port,
            external_port,
            external_address: IpAddr::V4(external_address),
            lifetime_seconds: granted_lifetime,
            protocol: ProtocolTag::NatPmp,
        })
    }

    /// Refreshes a mapping, suggesting the previously granted external port.
    pub async fn refresh(
        &self,
        port: &MappedPort,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        let deadline = Instant::now() + defaults::MAPPING_DEADLINE;
        let (external_port, granted_lifetime) = self
            .request_mapping(
                port.port_type,
                port.internal_port.get(),
                port.external_port,
                lifetime_seconds,
                deadline,
            )
            .await?;
        Ok(MappedPort {
            external_port,
            lifetime_seconds: granted_lifetime,
            ..port.clone()
        })
    }

    /// Releases a mapping: a map request with a zero suggested external port
    /// and a zero lifetime, the NAT-PMP delete convention.
    pub async fn unmap(&self, port: &MappedPort) -> Result<(), Error> {
        let deadline = Instant::now() + defaults::MAPPING_DEADLINE;
        self.request_mapping(port.port_type, port.internal_port.get(), 0, 0, deadline)
            .await
            .map(|_| ())
    }

    async fn external_address(&self, deadline: Instant) -> Result<Ipv4Addr, Error> {
        match self.request(Request::ExternalAddress, deadline).await? {
            Response::PublicAddress { public_ip, .. } => Ok(public_ip),
            Response::PortMap { .. } => unreachable!("correlated against the request opcode"),
        }
    }

    async fn request_mapping(
        &self,
        port_type: PortType,
        local_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
        deadline: Instant,
    ) -> Result<(u16, u32), Error> {
        let request = Request::Mapping {
            proto: map_protocol(port_type),
            local_port,
            external_port,
            lifetime_seconds,
        };
        match self.request(request, deadline).await? {
            Response::PortMap {
                external_port,
                lifetime_seconds,
                ..
            } => Ok((external_port, lifetime_seconds)),
            Response::PublicAddress { .. } => {
                unreachable!("correlated against the request opcode")
            }
        }
    }

    /// Sends `request`, retransmitting on the RFC schedule until a
    /// correlated reply arrives or `deadline` passes.
    async fn request(&self, request: Request, deadline: Instant) -> Result<Response, Error> {
        let local = SocketAddr::new(IpAddr::V4(self.local_ip), 0);
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
        let server = SocketAddr::new(IpAddr::V4(self.gateway_ip), self.server_port);
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
                if inbound.from.map(|from| from.ip()) != Some(IpAddr::V4(self.gateway_ip)) {
                    trace!("dropping datagram from unexpected source");
                    continue;
                }
                match Response::decode(&inbound.bytes) {
                    Ok(response) if correlates(request, &response) => return Ok(response),
                    Ok(response) => {
                        trace!("dropping uncorrelated response {response:?}");
                    }
                    Err(ResponseError::Code(code)) => {
                        if is_transient(code) {
                            debug!("gateway busy ({code}), retrying");
                            break;
                        }
                        return Err(ServerFailure::NatPmp(code).into());
                    }
                    Err(ResponseError::Codec(e)) => {
                        trace!("dropping malformed datagram: {e}");
                    }
                }
            }
        }
        Err(TransportError::Timeout.into())
    }
}

fn map_protocol(port_type: PortType) -> MapProtocol {
    match port_type {
        PortType::Udp => MapProtocol::Udp,
        PortType::Tcp => MapProtocol::Tcp,
    }
}

/// NAT-PMP replies are matched positionally: a reply correlates with the
/// single outstanding request on the socket iff its opcode and echoed fields
/// agree.
fn correlates(request: &Request, response: &Response) -> bool {
    match (request, response) {
        (Request::ExternalAddress, Response::PublicAddress { .. }) => true,
        (
            Request::Mapping {
                proto, local_port, ..
            },
            Response::PortMap {
                proto: got,
                private_port,
                ..
            },
        ) => got == proto && private_port == local_port,
        _ => false,
    }
}

/// Codes after which a retry can succeed without operator involvement.
fn is_transient(code: ResultCode) -> bool {
    matches!(
        code,
        ResultCode::NetworkFailure | ResultCode::OutOfResources
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_matches_opcode_and_fields() {
        let request = Request::Mapping {
            proto: MapProtocol::Udp,
            local_port: 5000,
            external_port: 5000,
            lifetime_seconds: 7200,
        };
        let response = Response::PortMap {
            proto: MapProtocol::Udp,
            epoch_time: 7,
            private_port: 5000,
            external_port: 5000,
            lifetime_seconds: 7200,
        };
        assert!(correlates(&request, &response));

        let other_port = Response::PortMap {
            proto: MapProtocol::Udp,
            epoch_time: 7,
            private_port: 5001,
            external_port: 5001,
            lifetime_seconds: 7200,
        };
        assert!(!correlates(&request, &other_port));

        let other_proto = Response::PortMap {
            proto: MapProtocol::Tcp,
            epoch_time: 7,
            private_port: 5000,
            external_port: 5000,
            lifetime_seconds: 7200,
        };
        assert!(!correlates(&request, &other_proto));

        assert!(!correlates(
            &Request::ExternalAddress,
            &other_proto
        ));
    }

    /// A minimal in-process NAT-PMP server: answers an external address
    /// request and then a UDP map request on the real socket path.
    async fn fake_gateway(socket: tokio::net::UdpSocket) {
        let mut buf = vec![0u8; 64];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let reply: Vec<u8> = match (n, buf[1]) {
                (2, 0) => {
                    // external address request
                    let mut reply = vec![0u8, 0x80, 0, 0, 0, 0, 0, 1];
                    reply.extend_from_slice(&[203, 0, 113, 1]);
                    reply
                }
                (12, opcode @ (1 | 2)) => {
                    let mut reply = vec![0u8, 0x80 | opcode, 0, 0, 0, 0, 0, 1];
                    // echo the private port, assign external 6000
                    reply.extend_from_slice(&buf[4..6]);
                    reply.extend_from_slice(&6000u16.to_be_bytes());
                    reply.extend_from_slice(&buf[8..12]);
                    reply
                }
                _ => continue,
            };
            let _ = socket.send_to(&reply, from).await;
        }
    }

    #[tokio::test]
    async fn test_map_against_fake_gateway() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // tests cannot bind the well-known NAT-PMP port
        let server_port = server.local_addr().unwrap().port();
        let gateway_task = tokio::spawn(fake_gateway(server));

        let net = NetworkGateway::spawn();
        let mapper = NatPmpMapper::with_server_port(
            net,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            server_port,
        );
        let port = NonZeroU16::new(5000).unwrap();
        let mapped = mapper
            .map(PortType::Udp, port, Some(port), 7200)
            .await
            .unwrap();
        assert_eq!(mapped.internal_port, port);
        assert_eq!(mapped.external_port, 6000);
        assert_eq!(mapped.external_address, IpAddr::from([203, 0, 113, 1]));
        assert_eq!(mapped.lifetime_seconds, 7200);
        assert_eq!(mapped.protocol, ProtocolTag::NatPmp);

        mapper.unmap(&mapped).await.unwrap();
        gateway_task.abort();
    }
}
