use std::net::{IpAddr, Ipv6Addr};

use crate::CodecError;

use super::{
    opcode_data::{MapData, MapProtocol, OpcodeData},
    option::PcpOption,
    Version,
};

/// A PCP Request.
///
/// See [RFC 6887 Request Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// [`Version`] to use in this request.
    pub(crate) version: Version,
    /// Requested lifetime in seconds.
    pub(crate) lifetime_seconds: u32,
    /// IP Address of the client.
    ///
    /// If the IP is an IpV4 address, is represented as a IpV4-mapped IpV6 address.
    pub(crate) client_addr: Ipv6Addr,
    /// Data associated to the [`super::Opcode`] in this request.
    pub(crate) opcode_data: OpcodeData,
    /// Options trailing the opcode data.
    pub(crate) options: Vec<PcpOption>,
}

impl Request {
    /// Size of the header of a [`Request`], in bytes.
    pub const MIN_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        4 + // lifetime
        16; // local ip

    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        let Request {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
            options,
        } = self;
        let options_size: usize = options.iter().map(PcpOption::encoded_size).sum();
        let mut buf =
            Vec::with_capacity(Self::MIN_SIZE + opcode_data.encoded_size() + options_size);
        // buf[0]
        buf.push((*version).into());
        // buf[1]
        buf.push(opcode_data.opcode().into());
        // buf[2] reserved
        buf.push(0);
        // buf[3] reserved
        buf.push(0);
        // buf[4..8]
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // buf[8..24]
        buf.extend_from_slice(&client_addr.octets());
        // buf[24..]
        opcode_data.encode_into(&mut buf);
        for option in options {
            option.encode_into(&mut buf);
        }

        buf
    }

    /// Create an announce request.
    pub fn announce(client_addr: Ipv6Addr) -> Request {
        Request {
            version: Version::Pcp,
            // opcode announce requires a lifetime of 0 and to ignore the lifetime on response
            lifetime_seconds: 0,
            client_addr,
            // the pcp announce opcode requests and responses have no opcode-specific payload
            opcode_data: OpcodeData::Announce,
            options: Vec::new(),
        }
    }

    /// Create a MAP request.
    ///
    /// The client address and the all-zeros form of an absent suggested
    /// external address follow the address family: an IPv4 client is encoded
    /// IPv4-mapped, and its wildcard is `::ffff:0:0` rather than `::`.
    ///
    /// Fails with [`CodecError::ConstraintViolation`] if the field invariants
    /// of [`MapData::validate`] do not hold.
    pub fn mapping(
        nonce: [u8; 12],
        protocol: MapProtocol,
        internal_port: u16,
        local_ip: IpAddr,
        external_port: Option<u16>,
        external_address: Option<IpAddr>,
        lifetime_seconds: u32,
        options: Vec<PcpOption>,
    ) -> Result<Request, CodecError> {
        let client_addr = to_pcp_addr(local_ip);
        // if the pcp client does not know the external address, or does not
        // have a preference, it must use the family's all-zeros address
        let external_address = to_pcp_addr(external_address.unwrap_or(match local_ip {
            IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }));
        let map_data = MapData {
            nonce,
            protocol,
            internal_port,
            // if the pcp client does not know the external port, or does not
            // have a preference, it must use 0.
            external_port: external_port.unwrap_or_default(),
            external_address,
        };
        map_data.validate(lifetime_seconds)?;
        Ok(Request {
            version: Version::Pcp,
            lifetime_seconds,
            client_addr,
            opcode_data: OpcodeData::MapData(map_data),
            options,
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(opcode: super::Opcode, rng: &mut R) -> Self {
        let opcode_data = OpcodeData::random(opcode, rng);
        let addr_octets: [u8; 16] = rng.gen();
        Request {
            version: Version::Pcp,
            lifetime_seconds: rng.gen(),
            client_addr: Ipv6Addr::from(addr_octets),
            opcode_data,
            options: Vec::new(),
        }
    }

    #[cfg(test)]
    #[track_caller]
    pub(crate) fn decode(buf: &[u8]) -> Self {
        let version: Version = buf[0].try_into().unwrap();
        let opcode: super::Opcode = buf[1].try_into().unwrap();
        // buf[2] reserved
        // buf[3] reserved
        let lifetime_bytes: [u8; 4] = buf[4..8].try_into().unwrap();
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

        let local_ip_bytes: [u8; 16] = buf[8..24].try_into().unwrap();
        let client_addr: Ipv6Addr = local_ip_bytes.into();

        let opcode_data = OpcodeData::decode(opcode, &buf[24..]).unwrap();
        let options = PcpOption::decode_all(&buf[24 + opcode_data.encoded_size()..]).unwrap();
        Self {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
            options,
        }
    }
}

/// Addresses in PCP are always 16 bytes, IPv4 ones in their IPv4-mapped form.
fn to_pcp_addr(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(addr) => addr.to_ipv6_mapped(),
        IpAddr::V6(addr) => addr,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    use rand::SeedableRng;

    #[test]
    fn test_encode_decode_announce_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(super::super::Opcode::Announce, &mut gen);
        let encoded = request.encode();
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_map_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(super::super::Opcode::Map, &mut gen);
        let encoded = request.encode();
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_peer_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(super::super::Opcode::Peer, &mut gen);
        let encoded = request.encode();
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_map_request_with_options_roundtrips() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(7);

        let mut request = Request::random(super::super::Opcode::Map, &mut gen);
        request.options = vec![
            PcpOption::PreferFailure,
            PcpOption::Unknown {
                code: 220,
                payload: vec![9, 9, 9],
            },
        ];
        let encoded = request.encode();
        assert_eq!(encoded.len() % 4, 0);
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_delete_encodes_to_sixty_bytes() {
        let nonce = [7u8; 12];
        let request = Request::mapping(
            nonce,
            MapProtocol::All,
            0,
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            None,
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            0,
            Vec::new(),
        )
        .unwrap();
        let encoded = request.encode();
        assert_eq!(encoded.len(), Request::MIN_SIZE + MapData::ENCODED_SIZE);
        assert_eq!(encoded.len(), 60);
        // nonce preserved
        assert_eq!(&encoded[24..36], &nonce);
    }

    #[test]
    fn test_map_all_protocols_requires_wildcard_port() {
        let err = Request::mapping(
            [0u8; 12],
            MapProtocol::All,
            5000,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            None,
            0,
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err, CodecError::ConstraintViolation("internal_port"));
    }

    #[test]
    fn test_map_wildcard_port_must_be_delete() {
        let err = Request::mapping(
            [0u8; 12],
            MapProtocol::Udp,
            0,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            None,
            7200,
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err, CodecError::ConstraintViolation("lifetime"));
    }

    #[test]
    fn test_ipv4_client_addr_is_v4_mapped() {
        let request = Request::mapping(
            [1u8; 12],
            MapProtocol::Udp,
            5000,
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 20)),
            None,
            None,
            7200,
            Vec::new(),
        )
        .unwrap();
        let encoded = request.encode();
        // bytes 8..24 are the client address, ::ffff:192.168.0.20
        assert_eq!(&encoded[8..20], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&encoded[20..24], &[192, 168, 0, 20]);
        // absent suggested external address for a v4 client is ::ffff:0:0
        assert_eq!(&encoded[44..56], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&encoded[56..60], &[0, 0, 0, 0]);
    }
}
