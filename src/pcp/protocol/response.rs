use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};

use crate::CodecError;

use super::{opcode_data::OpcodeData, option::PcpOption, Opcode, Version};

/// ResultCode in a [`Response`] when it's successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SuccessCode {
    /// Result code indicating a successful response.
    Success = 0,
}

/// ResultCode in a [`Response`], when said code is an error.
/// [`SuccessCode`] handles the success case.
///
/// Refer to [RFC 6887 Result Codes](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4)
// NOTE: docs for each variant are largely adapted from the RFC's description of each code.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Display, thiserror::Error,
)]
#[repr(u8)]
pub enum ErrorCode {
    /// The version number at the start of the PCP Request header is not recognized by the PCP
    /// server.
    #[display("sent version is not supported")]
    UnsuppVersion = 1,
    /// The requested operation is disabled for this PCP client, or the PCP client requested an
    /// operation that cannot be fulfilled by the PCP server's security policy.
    #[display("operation not authorized")]
    NotAuthorized = 2,
    /// The request could not be successfully parsed.
    #[display("could not parse the request")]
    MalformedRequest = 3,
    /// Unsupported Opcode.
    #[display("opcode is not supported")]
    UnsuppOpcode = 4,
    /// Unsupported option. This error only occurs if the option is in the mandatory-to-process
    /// range.
    #[display("option is not supported")]
    UnsuppOption = 5,
    /// Malformed option (e.g., appears too many times, invalid length).
    #[display("option could not be parsed")]
    MalformedOption = 6,
    /// The PCP server or the device it controls is experiencing a network failure of some sort
    /// (e.g., has not yet obtained an external IP address). This is a short lifetime error.
    #[display("spurious network failure")]
    NetworkFailure = 7,
    /// Request is well-formed and valid, but the server has insufficient resources to complete the
    /// requested operation at this time. This is a short lifetime error.
    #[display("not enough resources for this request")]
    NoResources = 8,
    /// Unsupported transport protocol, e.g., SCTP in a NAT that handles only UDP and TCP. This is
    /// a long lifetime error.
    #[display("unsupported protocol")]
    UnsuppProtocol = 9,
    /// This attempt to create a new mapping would exceed this subscriber's port quota. This is a
    /// short lifetime error.
    #[display("quota exceeded")]
    UserExQuota = 10,
    /// The suggested external port and/or external address cannot be provided.
    #[display("requested external address cannot be provided")]
    CannotProvideExternal = 11,
    /// The source IP address of the request packet does not match the contents of the PCP Client's
    /// IP Address field.
    #[display("sender and declared ip do not match")]
    AddressMismatch = 12,
    /// The PCP server was not able to create the filters in this request.
    #[display("excessive remote peers in filter option")]
    ExcessiveRemotePeers = 13,
}

impl ErrorCode {
    /// Whether the RFC classifies this code as a short lifetime error.
    ///
    /// For these, the response lifetime is the interval after which a retry
    /// may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkFailure | ErrorCode::NoResources | ErrorCode::UserExQuota
        )
    }
}

/// Result code of a PCP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// A success result code. See [`SuccessCode`].
    Success,
    /// An error code. See [`ErrorCode`].
    Error(ErrorCode),
}

impl TryFrom<u8> for ResultCode {
    type Error = TryFromPrimitiveError<ErrorCode>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<ErrorCode>> {
        if let Ok(SuccessCode::Success) = SuccessCode::try_from(value) {
            Ok(ResultCode::Success)
        } else {
            ErrorCode::try_from(value).map(ResultCode::Error)
        }
    }
}

impl From<ResultCode> for u8 {
    fn from(value: ResultCode) -> Self {
        match value {
            ResultCode::Success => SuccessCode::Success.into(),
            ResultCode::Error(e) => e.into(),
        }
    }
}

/// A PCP Response/Notification.
///
/// See [RFC 6887 Response Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Result code of the response.
    pub result_code: ResultCode,
    /// Lifetime in seconds that can be assumed by this response.
    ///
    /// For successful map requests, how long to assume the mapping will last.
    /// For errors, how long the same request should not be repeated.
    pub lifetime_seconds: u32,
    /// Epoch time of the server.
    ///
    /// A backwards step signals loss of mapping state on the server. See
    /// [RFC 6887 section 8.5](https://datatracker.ietf.org/doc/html/rfc6887#section-8.5).
    pub epoch_time: u32,
    /// Data of the response.
    pub data: OpcodeData,
    /// Options trailing the opcode data.
    pub options: Vec<PcpOption>,
}

impl Response {
    /// Max size of a PCP packet as indicated in
    /// [RFC 6887 Common Request and Response Header Format](https://datatracker.ietf.org/doc/html/rfc6887#section-7)
    pub const MAX_SIZE: usize = 1100;

    /// Minimum size of an encoded [`Response`] sent by a server to this client.
    pub const MIN_SIZE: usize = // parts
        1 + // version
        1 + // opcode ORd with [`Response::RESPONSE_INDICATOR`]
        1 + // reserved
        1 + // result code
        4 + // lifetime
        4 + // epoch time
        12; // reserved

    /// Indicator ORd into the [`Opcode`] to indicate a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    ///
    /// Messages shorter than the header are [`CodecError::Truncated`], longer
    /// than [`Response::MAX_SIZE`] are [`CodecError::OversizedMessage`], and
    /// since every PCP message is built of 4-byte words, a length that is not
    /// a multiple of 4 is [`CodecError::Malformed`].
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::MIN_SIZE {
            return Err(CodecError::Truncated);
        }
        if buf.len() > Self::MAX_SIZE {
            return Err(CodecError::OversizedMessage);
        }
        if buf.len() % 4 != 0 {
            return Err(CodecError::Malformed);
        }

        let _version: Version = buf[0]
            .try_into()
            .map_err(|_| CodecError::UnsupportedVersion)?;

        let opcode = buf[1];
        if opcode & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(CodecError::Malformed);
        }
        let opcode: Opcode = (opcode & !Self::RESPONSE_INDICATOR)
            .try_into()
            .map_err(|_| CodecError::UnknownOpcode)?;

        // buf[2] reserved

        let result_code: ResultCode =
            buf[3].try_into().map_err(|_| CodecError::Malformed)?;

        let lifetime_bytes = buf[4..8].try_into().expect("slice has the right len");
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

        let epoch_bytes = buf[8..12].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        // buf[12..24] reserved

        let data = OpcodeData::decode(opcode, &buf[24..])?;
        let options = PcpOption::decode_all(&buf[24 + data.encoded_size()..])?;

        Ok(Response {
            result_code,
            lifetime_seconds,
            epoch_time,
            data,
            options,
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> Self {
        let data = OpcodeData::random(opcode, rng);
        Self {
            result_code: ResultCode::Success,
            lifetime_seconds: rng.gen(),
            epoch_time: rng.gen(),
            data,
            options: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let Response {
            result_code,
            lifetime_seconds,
            epoch_time,
            data,
            options,
        } = self;
        let mut buf = Vec::with_capacity(Self::MIN_SIZE);
        // version
        buf.push(Version::Pcp.into());
        // response indicator and opcode
        let opcode: u8 = data.opcode().into();
        buf.push(Response::RESPONSE_INDICATOR | opcode);
        // reserved
        buf.push(0);
        // result code
        buf.push((*result_code).into());
        // lifetime
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // epoch
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        // reserved
        for _ in 12..Response::MIN_SIZE {
            buf.push(0)
        }
        data.encode_into(&mut buf);
        for option in options {
            option.encode_into(&mut buf);
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;

    #[test]
    fn test_decode_announce_response() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let response = Response::random(Opcode::Announce, &mut gen);
        let encoded = response.encode();
        assert_eq!(Ok(response), Response::decode(&encoded));
    }

    #[test]
    fn test_decode_map_response_roundtrips() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let mut response = Response::random(Opcode::Map, &mut gen);
        response.options = vec![PcpOption::Unknown {
            code: 222,
            payload: vec![1, 2, 3, 4, 5, 6],
        }];
        let encoded = response.encode();
        assert_eq!(Ok(response), Response::decode(&encoded));
    }

    #[test]
    fn test_decode_known_response_vector() {
        // MAP response captured from a real gateway
        let encoded = [
            2, 129, 0, 0, 0, 0, 28, 32, 0, 2, 155, 237, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 129,
            112, 9, 24, 241, 208, 251, 45, 157, 76, 10, 188, 17, 0, 0, 0, 4, 210, 4, 210, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 255, 255, 135, 180, 175, 246,
        ];
        let response = Response::decode(&encoded).unwrap();
        assert_eq!(response.result_code, ResultCode::Success);
        assert_eq!(&response.encode(), &encoded);
    }

    #[test]
    fn test_error_response_keeps_retry_after_lifetime() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let mut response = Response::random(Opcode::Map, &mut gen);
        response.result_code = ResultCode::Error(ErrorCode::NoResources);
        response.lifetime_seconds = 30;
        let decoded = Response::decode(&response.encode()).unwrap();
        assert_eq!(
            decoded.result_code,
            ResultCode::Error(ErrorCode::NoResources)
        );
        assert_eq!(decoded.lifetime_seconds, 30);
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let encoded = [2u8, 129, 0, 0, 0, 0, 28, 32];
        assert_eq!(Response::decode(&encoded), Err(CodecError::Truncated));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let encoded = vec![0u8; Response::MAX_SIZE + 4];
        assert_eq!(
            Response::decode(&encoded),
            Err(CodecError::OversizedMessage)
        );
    }

    #[test]
    fn test_unaligned_message_is_rejected() {
        let mut gen = rand_chacha::ChaCha8Rng::seed_from_u64(42);

        let mut encoded = Response::random(Opcode::Map, &mut gen).encode();
        encoded.push(0);
        assert_eq!(Response::decode(&encoded), Err(CodecError::Malformed));
    }
}
