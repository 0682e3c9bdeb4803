use std::net::Ipv4Addr;

use crate::CodecError;

use super::{MapProtocol, Opcode, ResultCode, Version};

/// A NAT-PMP successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Response to a [`super::Request::ExternalAddress`] request.
    PublicAddress {
        /// Seconds since the mapping table was last reset.
        epoch_time: u32,
        /// External address of the gateway.
        public_ip: Ipv4Addr,
    },
    /// Response to a [`super::Request::Mapping`] request.
    PortMap {
        /// Protocol of the mapping.
        proto: MapProtocol,
        /// Seconds since the mapping table was last reset.
        epoch_time: u32,
        /// Local port of the mapping.
        private_port: u16,
        /// External port assigned to the mapping. May differ from the
        /// suggested one.
        external_port: u16,
        /// Lifetime granted by the gateway.
        lifetime_seconds: u32,
    },
}

/// Errors that can occur when decoding a [`Response`] from a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, thiserror::Error)]
pub enum ResponseError {
    /// The buffer does not parse as a NAT-PMP response.
    #[display("{_0}")]
    Codec(CodecError),
    /// A well-formed response carrying a non-success result code.
    #[display("{_0}")]
    Code(ResultCode),
}

impl From<CodecError> for ResponseError {
    fn from(value: CodecError) -> Self {
        ResponseError::Codec(value)
    }
}

impl Response {
    /// Minimum size of an encoded [`Response`] sent by a server to this client.
    pub const MIN_SIZE: usize = // parts of a public ip response
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        4; // public ip

    /// Maximum size of an encoded [`Response`] sent by a server to this client.
    pub const MAX_SIZE: usize = // parts of a mapping response
        1 + // version
        1 + // opcode
        2 + // result code
        4 + // epoch time
        2 + // private port
        2 + // external port
        4; // lifetime

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    ///
    /// The response opcode must be the request's opcode ORd with
    /// [`Response::RESPONSE_INDICATOR`]; correlation against the outstanding
    /// request is done by the caller on the decoded variant.
    pub fn decode(buf: &[u8]) -> Result<Self, ResponseError> {
        if buf.len() < Self::MIN_SIZE {
            return Err(CodecError::Truncated.into());
        }
        if buf.len() > Self::MAX_SIZE {
            return Err(CodecError::OversizedMessage.into());
        }
        let _: Version = buf[0]
            .try_into()
            .map_err(|_| CodecError::UnsupportedVersion)?;
        let opcode = buf[1];
        if opcode & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(CodecError::Malformed.into());
        }
        let opcode: Opcode = (opcode & !Self::RESPONSE_INDICATOR)
            .try_into()
            .map_err(|_| CodecError::UnknownOpcode)?;

        let result_bytes =
            u16::from_be_bytes(buf[2..4].try_into().expect("slice has the right len"));
        let result_code: ResultCode = result_bytes
            .try_into()
            .map_err(|_| CodecError::Malformed)?;
        if result_code != ResultCode::Success {
            return Err(ResponseError::Code(result_code));
        }

        let response = match opcode {
            Opcode::DetermineExternalAddress => {
                let epoch_bytes = buf[4..8].try_into().expect("slice has the right len");
                let epoch_time = u32::from_be_bytes(epoch_bytes);
                let ip_bytes: [u8; 4] = buf[8..12].try_into().expect("slice has the right len");
                Response::PublicAddress {
                    epoch_time,
                    public_ip: ip_bytes.into(),
                }
            }
            other @ (Opcode::MapUdp | Opcode::MapTcp) => {
                if buf.len() < Self::MAX_SIZE {
                    return Err(CodecError::Truncated.into());
                }
                let proto = if other == Opcode::MapUdp {
                    MapProtocol::Udp
                } else {
                    MapProtocol::Tcp
                };

                let epoch_bytes = buf[4..8].try_into().expect("slice has the right len");
                let epoch_time = u32::from_be_bytes(epoch_bytes);

                let private_port_bytes = buf[8..10].try_into().expect("slice has the right len");
                let private_port = u16::from_be_bytes(private_port_bytes);

                let external_port_bytes = buf[10..12].try_into().expect("slice has the right len");
                let external_port = u16::from_be_bytes(external_port_bytes);

                let lifetime_bytes = buf[12..16].try_into().expect("slice has the right len");
                let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

                Response::PortMap {
                    proto,
                    epoch_time,
                    private_port,
                    external_port,
                    lifetime_seconds,
                }
            }
        };

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_map_response() {
        #[rustfmt::skip]
        let encoded = [
            0, // version
            0x81, // opcode: map udp response
            0, 0, // result code: success
            0, 0, 0x04, 0x4c, // epoch
            0x13, 0x88, // private port 5000
            0x13, 0x88, // external port 5000
            0x00, 0x00, 0x1c, 0x20, // lifetime 7200
        ];
        let response = Response::decode(&encoded).unwrap();
        assert_eq!(
            response,
            Response::PortMap {
                proto: MapProtocol::Udp,
                epoch_time: 1100,
                private_port: 5000,
                external_port: 5000,
                lifetime_seconds: 7200,
            }
        );
    }

    #[test]
    fn test_decode_public_address_response() {
        #[rustfmt::skip]
        let encoded = [
            0, // version
            0x80, // opcode: external address response
            0, 0, // result code: success
            0, 0, 0, 1, // epoch
            192, 0, 2, 7, // public ip
        ];
        let response = Response::decode(&encoded).unwrap();
        assert_eq!(
            response,
            Response::PublicAddress {
                epoch_time: 1,
                public_ip: Ipv4Addr::new(192, 0, 2, 7),
            }
        );
    }

    #[test]
    fn test_error_code_is_surfaced() {
        #[rustfmt::skip]
        let encoded = [
            0, // version
            0x81, // opcode: map udp response
            0, 2, // result code: not authorized
            0, 0, 0, 1, // epoch
            0, 0, 0, 0, 0, 0, 0, 0, // ports and lifetime zeroed
        ];
        assert_eq!(
            Response::decode(&encoded),
            Err(ResponseError::Code(ResultCode::NotAuthorizedOrRefused))
        );
    }

    #[test]
    fn test_request_packets_are_not_responses() {
        let encoded = [0u8, 1, 0, 0, 0x13, 0x88, 0x13, 0x88, 0, 0, 0x1c, 0x20];
        assert_eq!(
            Response::decode(&encoded),
            Err(ResponseError::Codec(CodecError::Malformed))
        );
    }

    #[test]
    fn test_truncated_response_is_rejected() {
        let encoded = [0u8, 0x81, 0, 0];
        assert_eq!(
            Response::decode(&encoded),
            Err(ResponseError::Codec(CodecError::Truncated))
        );
    }
}
