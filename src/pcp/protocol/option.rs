//! Encoding and decoding of PCP options.
//!
//! Options trail the opcode data. On the wire each one is a 4-byte header
//! `{code, reserved, payload length}` followed by the payload, padded so the
//! next option starts on a 4-byte boundary. See
//! [RFC 6887 section 7.3](https://datatracker.ietf.org/doc/html/rfc6887#section-7.3).

use std::net::Ipv6Addr;

use crate::CodecError;

/// Option codes from [RFC 6887 section 19.4](https://datatracker.ietf.org/doc/html/rfc6887#section-19.4).
const CODE_THIRD_PARTY: u8 = 1;
const CODE_PREFER_FAILURE: u8 = 2;
const CODE_FILTER: u8 = 3;

const HEADER_SIZE: usize = // parts
    1 + // code
    1 + // reserved
    2; // payload length

/// A PCP option.
///
/// Options with an unrecognized code are preserved verbatim so that a decoded
/// message re-encodes to the same bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcpOption {
    /// Request a mapping for another internal address than the sender's.
    ThirdParty {
        /// Internal address the mapping is requested for.
        internal_address: Ipv6Addr,
    },
    /// Ask the server to fail instead of picking different external
    /// parameters than the suggested ones.
    PreferFailure,
    /// Restrict forwarding to a remote peer prefix.
    Filter {
        /// Prefix length of the filter.
        prefix_length: u8,
        /// Remote peer port, 0 meaning all ports.
        remote_port: u16,
        /// Remote peer address.
        remote_address: Ipv6Addr,
    },
    /// An option this client does not know. Code and payload are kept as
    /// received.
    Unknown {
        /// Option code.
        code: u8,
        /// Raw payload, without padding.
        payload: Vec<u8>,
    },
}

impl PcpOption {
    fn code(&self) -> u8 {
        match self {
            PcpOption::ThirdParty { .. } => CODE_THIRD_PARTY,
            PcpOption::PreferFailure => CODE_PREFER_FAILURE,
            PcpOption::Filter { .. } => CODE_FILTER,
            PcpOption::Unknown { code, .. } => *code,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            PcpOption::ThirdParty { .. } => 16,
            PcpOption::PreferFailure => 0,
            PcpOption::Filter { .. } => 20,
            PcpOption::Unknown { payload, .. } => payload.len(),
        }
    }

    /// Encoded size, padding included.
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + pad4(self.payload_len())
    }

    /// Encode this option into the buffer, padded to a 4-byte boundary.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.code());
        buf.push(0); // reserved
        let len = self.payload_len();
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        match self {
            PcpOption::ThirdParty { internal_address } => {
                buf.extend_from_slice(&internal_address.octets());
            }
            PcpOption::PreferFailure => {}
            PcpOption::Filter {
                prefix_length,
                remote_port,
                remote_address,
            } => {
                buf.push(0); // reserved
                buf.push(*prefix_length);
                buf.extend_from_slice(&remote_port.to_be_bytes());
                buf.extend_from_slice(&remote_address.octets());
            }
            PcpOption::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        for _ in len..pad4(len) {
            buf.push(0);
        }
    }

    /// Decode every option in `buf`, which must span from the end of the
    /// opcode data to the end of the message.
    ///
    /// A malformed option terminates decoding.
    pub fn decode_all(mut buf: &[u8]) -> Result<Vec<PcpOption>, CodecError> {
        let mut options = Vec::new();
        while !buf.is_empty() {
            if buf.len() < HEADER_SIZE {
                return Err(CodecError::Malformed);
            }
            let code = buf[0];
            // buf[1] reserved
            let len = u16::from_be_bytes(buf[2..4].try_into().expect("sized")) as usize;
            let end = HEADER_SIZE + len;
            let padded_end = HEADER_SIZE + pad4(len);
            if buf.len() < padded_end {
                return Err(CodecError::Malformed);
            }
            let payload = &buf[HEADER_SIZE..end];
            let option = match code {
                CODE_THIRD_PARTY => {
                    let octets: [u8; 16] =
                        payload.try_into().map_err(|_| CodecError::Malformed)?;
                    PcpOption::ThirdParty {
                        internal_address: octets.into(),
                    }
                }
                CODE_PREFER_FAILURE => {
                    if !payload.is_empty() {
                        return Err(CodecError::Malformed);
                    }
                    PcpOption::PreferFailure
                }
                CODE_FILTER => {
                    if payload.len() != 20 {
                        return Err(CodecError::Malformed);
                    }
                    // payload[0] reserved
                    let prefix_length = payload[1];
                    let remote_port =
                        u16::from_be_bytes(payload[2..4].try_into().expect("sized"));
                    let octets: [u8; 16] = payload[4..].try_into().expect("sized");
                    PcpOption::Filter {
                        prefix_length,
                        remote_port,
                        remote_address: octets.into(),
                    }
                }
                code => PcpOption::Unknown {
                    code,
                    payload: payload.to_vec(),
                },
            };
            options.push(option);
            buf = &buf[padded_end..];
        }
        Ok(options)
    }
}

/// Round up to the next multiple of 4.
const fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_padded_to_four_bytes() {
        let option = PcpOption::Unknown {
            code: 200,
            payload: vec![1, 2, 3, 4, 5],
        };
        let mut buf = Vec::new();
        option.encode_into(&mut buf);
        assert_eq!(buf.len(), option.encoded_size());
        assert_eq!(buf.len() % 4, 0);
        // declared length is the unpadded one
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 5);
    }

    #[test]
    fn unknown_option_roundtrips() {
        let option = PcpOption::Unknown {
            code: 254,
            payload: vec![0xde, 0xad, 0xbe],
        };
        let mut buf = Vec::new();
        option.encode_into(&mut buf);
        let decoded = PcpOption::decode_all(&buf).unwrap();
        assert_eq!(decoded, vec![option]);
    }

    #[test]
    fn known_options_roundtrip() {
        let options = vec![
            PcpOption::ThirdParty {
                internal_address: Ipv6Addr::LOCALHOST,
            },
            PcpOption::PreferFailure,
            PcpOption::Filter {
                prefix_length: 128,
                remote_port: 4321,
                remote_address: Ipv6Addr::LOCALHOST,
            },
        ];
        let mut buf = Vec::new();
        for option in &options {
            option.encode_into(&mut buf);
        }
        assert_eq!(PcpOption::decode_all(&buf).unwrap(), options);
    }

    #[test]
    fn overrunning_option_is_malformed() {
        // declares an 8-byte payload but only carries 4
        let buf = [200, 0, 0, 8, 1, 2, 3, 4];
        assert_eq!(
            PcpOption::decode_all(&buf).unwrap_err(),
            CodecError::Malformed
        );
    }
}
