//! The closed set of failures surfaced by this crate.
//!
//! Codec and usage errors are never retried. Transport errors considered
//! transient ([`TransportError::Timeout`], [`TransportError::Unreachable`])
//! are retried by the drivers on the protocol's schedule before being
//! surfaced. Server failures carry the protocol-native result code.

use derive_more::Display;

/// Errors returned by the mapping operations and by [`discover`].
///
/// [`discover`]: crate::discover
#[derive(Debug, Display, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// A message failed to encode or decode.
    #[display("codec: {_0}")]
    Codec(#[from] CodecError),
    /// Talking to the gateway failed.
    #[display("transport: {_0}")]
    Transport(#[from] TransportError),
    /// The gateway rejected the operation.
    #[display("server: {_0}")]
    Server(#[from] ServerFailure),
    /// A client-side precondition was violated.
    #[display("invalid argument: {_0}")]
    InvalidArgument(&'static str),
    /// Discovery finished without finding any usable gateway.
    #[display("no gateway found")]
    NoGatewayFound,
}

/// Failures while encoding or decoding a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, thiserror::Error)]
pub enum CodecError {
    /// The message does not follow the wire format.
    #[display("malformed message")]
    Malformed,
    /// The message ends before its declared or minimum length.
    #[display("truncated message")]
    Truncated,
    /// A field value violates a protocol invariant.
    #[display("constraint violation on {_0}")]
    ConstraintViolation(&'static str),
    /// The version field is not one this client speaks.
    #[display("unsupported version")]
    UnsupportedVersion,
    /// The opcode is not known.
    #[display("unknown opcode")]
    UnknownOpcode,
    /// The message exceeds the protocol's maximum size.
    #[display("oversized message")]
    OversizedMessage,
}

/// Failures of the sockets owned by the gateway multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, thiserror::Error)]
pub enum TransportError {
    /// The operation's deadline expired. Timeouts are authoritative: a reply
    /// arriving later is not consumed on behalf of the timed out operation.
    #[display("timed out")]
    Timeout,
    /// No route to the peer.
    #[display("peer unreachable")]
    Unreachable,
    /// The peer refused the connection.
    #[display("connection refused")]
    ConnectionRefused,
    /// The connection was reset or closed under us.
    #[display("connection reset")]
    ConnectionReset,
    /// The multiplexer was shut down while the operation was outstanding.
    #[display("multiplexer shut down")]
    Shutdown,
    /// The socket's send buffer is full, resubmit after a delay.
    #[display("send buffer full")]
    WouldBlock,
}

impl From<&std::io::Error> for TransportError {
    fn from(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            TimedOut => TransportError::Timeout,
            ConnectionRefused => TransportError::ConnectionRefused,
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                TransportError::ConnectionReset
            }
            _ => TransportError::Unreachable,
        }
    }
}

/// A protocol-level rejection, carrying the protocol-native result code.
#[derive(Debug, Clone, PartialEq, Eq, Display, thiserror::Error)]
pub enum ServerFailure {
    /// PCP result code, see [RFC 6887 section 7.4].
    ///
    /// [RFC 6887 section 7.4]: https://datatracker.ietf.org/doc/html/rfc6887#section-7.4
    #[display("pcp: {_0}")]
    Pcp(crate::pcp::protocol::ErrorCode),
    /// NAT-PMP result code, see [RFC 6886 section 3.5].
    ///
    /// [RFC 6886 section 3.5]: https://datatracker.ietf.org/doc/html/rfc6886#section-3.5
    #[display("nat-pmp: {_0}")]
    NatPmp(crate::nat_pmp::protocol::ResultCode),
    /// UPnP SOAP fault, code and description as reported by the gateway.
    #[display("upnp: {code} {description}")]
    Upnp {
        /// `errorCode` of the fault.
        code: u16,
        /// `errorDescription` of the fault, possibly empty.
        description: String,
    },
}
