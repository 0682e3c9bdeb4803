//! A NAT-PMP request encoding and decoding.

use super::{MapProtocol, Opcode, Version};

/// A NAT-PMP Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Request to determine the gateway's external address.
    ExternalAddress,
    /// Request to register a mapping with the NAT-PMP server.
    Mapping {
        /// Protocol to use for this mapping.
        proto: MapProtocol,
        /// Local port to map.
        local_port: u16,
        /// Preferred external port. Zero together with a zero lifetime
        /// deletes the mapping.
        external_port: u16,
        /// Requested lifetime in seconds for the mapping.
        lifetime_seconds: u32,
    },
}

impl Request {
    /// Size of an encoded mapping [`Request`], in bytes.
    pub const MAPPING_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        2 + // local port
        2 + // external port
        4; // lifetime

    /// Encode this [`Request`].
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
            Request::Mapping {
                proto,
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = Vec::with_capacity(Self::MAPPING_SIZE);
                buf.push(Version::NatPmp.into());
                buf.push(proto.opcode().into());
                buf.push(0); // reserved
                buf.push(0); // reserved
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
        }
    }

    /// The opcode this request is sent with, used to match the response.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::ExternalAddress => Opcode::DetermineExternalAddress,
            Request::Mapping { proto, .. } => proto.opcode(),
        }
    }

    #[cfg(test)]
    fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        match opcode {
            Opcode::DetermineExternalAddress => Request::ExternalAddress,
            Opcode::MapUdp => Request::Mapping {
                proto: MapProtocol::Udp,
                local_port: rng.gen(),
                external_port: rng.gen(),
                lifetime_seconds: rng.gen(),
            },
            Opcode::MapTcp => Request::Mapping {
                proto: MapProtocol::Tcp,
                local_port: rng.gen(),
                external_port: rng.gen(),
                lifetime_seconds: rng.gen(),
            },
        }
    }

    #[cfg(test)]
    #[track_caller]
    fn decode(buf: &[u8]) -> Self {
        let _version: Version = buf[0].try_into().unwrap();
        let opcode: Opcode = buf[1].try_into().unwrap();
        // check if this is a mapping request, or an external address request
        match opcode {
            Opcode::DetermineExternalAddress => Request::ExternalAddress,
            Opcode::MapUdp | Opcode::MapTcp => {
                // buf[2] reserved
                // buf[3] reserved

                let local_port_bytes = buf[4..6].try_into().expect("slice has the right size");
                let local_port = u16::from_be_bytes(local_port_bytes);

                let external_port_bytes = buf[6..8].try_into().expect("slice has the right size");
                let external_port = u16::from_be_bytes(external_port_bytes);

                let lifetime_bytes: [u8; 4] = buf[8..12].try_into().unwrap();
                let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);
                Request::Mapping {
                    proto: match opcode {
                        Opcode::MapUdp => MapProtocol::Udp,
                        _ => MapProtocol::Tcp,
                    },
                    local_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn test_encode_decode_addr_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(Opcode::DetermineExternalAddress, &mut gen);
        let encoded = request.encode();
        assert_eq!(encoded.len(), 2);
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_encode_decode_map_request() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let request = Request::random(Opcode::MapUdp, &mut gen);
        let encoded = request.encode();
        assert_eq!(encoded.len(), Request::MAPPING_SIZE);
        assert_eq!(request, Request::decode(&encoded));

        let request = Request::random(Opcode::MapTcp, &mut gen);
        let encoded = request.encode();
        assert_eq!(encoded.len(), Request::MAPPING_SIZE);
        assert_eq!(request, Request::decode(&encoded));
    }

    #[test]
    fn test_map_request_layout() {
        let request = Request::Mapping {
            proto: MapProtocol::Udp,
            local_port: 5000,
            external_port: 5000,
            lifetime_seconds: 7200,
        };
        let encoded = request.encode();
        assert_eq!(
            encoded,
            [
                0, // version
                1, // opcode
                0, 0, // reserved
                0x13, 0x88, // local port 5000
                0x13, 0x88, // external port 5000
                0x00, 0x00, 0x1c, 0x20, // lifetime 7200
            ]
        );
    }
}
