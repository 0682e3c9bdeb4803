//! Wire format of PCP requests and responses.
//!
//! Pure encode/decode. Socket handling and retransmission live in the
//! driver, [`crate::pcp`].

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod opcode_data;
mod option;
mod request;
mod response;

pub use opcode_data::{MapData, MapProtocol, OpcodeData, PeerData};
pub use option::PcpOption;
pub use request::Request;
pub use response::{ErrorCode, Response, ResultCode};

/// Port to direct requests to. IANA reassigned the NAT-PMP port to PCP when
/// the protocol was revised, so both versions listen on the same one. See
/// <https://datatracker.ietf.org/doc/html/rfc6887#section-19>
pub const SERVER_PORT: u16 = 5351;

/// PCP Version
///
/// See [RFC 6887 Version Negotiation](https://datatracker.ietf.org/doc/html/rfc6887#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    // Version 2
    Pcp = 2,
}

/// Opcode as defined in [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19)
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Announce Opcode.
    ///
    /// Used by the server to announce changes to clients. These include restarts
    /// (indicating loss of state) and changes to mappings and external ip addresses.
    ///
    /// See [RFC 6887 ANNOUNCE Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-14.1)
    Announce = 0,
    /// Map Opcode.
    ///
    /// Used to deal with endpoint-independent mappings.
    ///
    /// See [RFC 6887 MAP Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-11)
    Map = 1,
    /// Peer Opcode.
    ///
    /// Used to deal with endpoint-dependent mappings towards a specific remote
    /// peer. Decoded for completeness, the drivers only issue ANNOUNCE and MAP.
    ///
    /// See [RFC 6887 PEER Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-12)
    Peer = 2,
}
