//! Wire format of NAT-PMP requests and responses.
//!
//! Pure encode/decode. Socket handling and retransmission live in the
//! driver, [`crate::nat_pmp`].

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod request;
mod response;

pub use request::Request;
pub use response::{Response, ResponseError};

/// Port to use when acting as a server. This is the one we direct requests to.
pub const SERVER_PORT: u16 = 5351;

/// NAT-PMP Version
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    NatPmp = 0,
}

/// Opcodes of [RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // 3.2.  Determining the External Address
    DetermineExternalAddress = 0,
    // 3.3.  Requesting a Mapping
    MapUdp = 1,
    // 3.3.  Requesting a Mapping
    MapTcp = 2,
}

/// Protocol for which a port mapping is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapProtocol {
    /// UDP mapping.
    Udp,
    /// TCP mapping.
    Tcp,
}

impl MapProtocol {
    /// The map opcode carrying this protocol.
    pub fn opcode(&self) -> Opcode {
        match self {
            MapProtocol::Udp => Opcode::MapUdp,
            MapProtocol::Tcp => Opcode::MapTcp,
        }
    }
}

/// Result codes of [RFC 6886 section 3.5](https://datatracker.ietf.org/doc/html/rfc6886#section-3.5).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    IntoPrimitive,
    TryFromPrimitive,
    derive_more::Display,
    thiserror::Error,
)]
#[repr(u16)]
pub enum ResultCode {
    #[display("success")]
    Success = 0,
    #[display("unsupported version")]
    UnsupportedVersion = 1,
    /// Functionality is supported but not allowed: e.g. box supports mapping,
    /// but user has turned the feature off.
    #[display("not authorized or refused")]
    NotAuthorizedOrRefused = 2,
    /// Network failures, e.g. NAT box itself has not obtained a DHCP lease.
    #[display("network failure")]
    NetworkFailure = 3,
    /// NAT box cannot create any more mappings at this time.
    #[display("out of resources")]
    OutOfResources = 4,
    #[display("unsupported opcode")]
    UnsupportedOpcode = 5,
}
