//! Encoding and decoding of the data associated with an [`Opcode`].

use std::net::Ipv6Addr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::CodecError;

use super::Opcode;

/// Data associated to an [`Opcode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpcodeData {
    /// Data for an [`Opcode::Announce`] request.
    Announce,
    /// Data for an [`Opcode::Map`] request.
    MapData(MapData),
    /// Data for an [`Opcode::Peer`] request.
    PeerData(PeerData),
}

/// [`OpcodeData`] associated to a [`Opcode::Map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapData {
    /// Nonce of the request. Used to verify responses in the client side, and
    /// modifications in the server side.
    pub nonce: [u8; 12],
    /// Protocol for which the mapping is being requested.
    pub protocol: MapProtocol,
    /// Internal port for the mapping.
    pub internal_port: u16,
    /// Suggested external port for the mapping.
    pub external_port: u16,
    /// Suggested external ip for the mapping.
    ///
    /// All zeros is `::ffff:0:0` when asking for an IPv4 address and `::` for
    /// IPv6.
    pub external_address: Ipv6Addr,
}

/// [`OpcodeData`] associated to a [`Opcode::Peer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData {
    /// Nonce of the request.
    pub nonce: [u8; 12],
    /// Protocol of the mapping.
    pub protocol: MapProtocol,
    /// Internal port of the mapping.
    pub internal_port: u16,
    /// Suggested external port of the mapping.
    pub external_port: u16,
    /// Suggested external ip of the mapping.
    pub external_address: Ipv6Addr,
    /// Remote peer port.
    pub remote_port: u16,
    /// Remote peer address.
    pub remote_address: Ipv6Addr,
}

/// Protocol for which a port mapping is requested.
// NOTE: technically any IANA protocol is allowed, these are the ones the
// mapping semantics of this crate cover. Zero means 'all protocols'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MapProtocol {
    /// All protocols, only valid for delete requests.
    All = 0,
    Tcp = 6,
    Udp = 17,
}

impl MapData {
    /// Size of the opcode-specific data of a [`Opcode::Map`] request.
    pub const ENCODED_SIZE: usize = // parts
        12 + // nonce
        1 + // protocol
        3 + // reserved
        2 + // internal port
        2 + // external port
        16; // external address

    /// Checks the field invariants of [RFC 6887 section 11.1].
    ///
    /// The lifetime comes from the common header and is part of the
    /// constraints: all-protocols requires an all-ports mapping, and an
    /// all-ports mapping is only valid as a delete.
    ///
    /// [RFC 6887 section 11.1]: https://datatracker.ietf.org/doc/html/rfc6887#section-11.1
    pub fn validate(&self, lifetime_seconds: u32) -> Result<(), CodecError> {
        if self.protocol == MapProtocol::All && self.internal_port != 0 {
            return Err(CodecError::ConstraintViolation("internal_port"));
        }
        if self.internal_port == 0 && lifetime_seconds != 0 {
            return Err(CodecError::ConstraintViolation("lifetime"));
        }
        Ok(())
    }

    /// Encode this [`MapData`].
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let MapData {
            nonce,
            protocol,
            internal_port,
            external_port,
            external_address,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0..12].copy_from_slice(nonce);
        buf[12] = (*protocol).into();
        // buf[13..16] reserved
        buf[16..18].copy_from_slice(&internal_port.to_be_bytes());
        buf[18..20].copy_from_slice(&external_port.to_be_bytes());
        buf[20..].copy_from_slice(&external_address.octets());

        buf
    }

    /// Decode a [`MapData`].
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(CodecError::Truncated);
        }

        let nonce = buf[..12].try_into().expect("slice has the right size");

        let protocol = buf[12].try_into().map_err(|_| CodecError::Malformed)?;

        // buf[13..16] reserved

        let internal_port_bytes = buf[16..18].try_into().expect("slice has the right size");
        let internal_port = u16::from_be_bytes(internal_port_bytes);

        let external_port_bytes = buf[18..20].try_into().expect("slice has the right size");
        let external_port = u16::from_be_bytes(external_port_bytes);

        let external_addr_bytes: [u8; 16] = buf[20..Self::ENCODED_SIZE]
            .try_into()
            .expect("buffer size was verified");
        let external_address = Ipv6Addr::from(external_addr_bytes);

        Ok(MapData {
            nonce,
            protocol,
            internal_port,
            external_port,
            external_address,
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(rng: &mut R) -> MapData {
        let octets: [u8; 16] = rng.gen();
        MapData {
            nonce: rng.gen(),
            protocol: MapProtocol::Udp,
            internal_port: rng.gen_range(1..=u16::MAX),
            external_port: rng.gen(),
            external_address: octets.into(),
        }
    }
}

impl PeerData {
    /// Size of the opcode-specific data of a [`Opcode::Peer`] request.
    pub const ENCODED_SIZE: usize = // parts
        12 + // nonce
        1 + // protocol
        3 + // reserved
        2 + // internal port
        2 + // external port
        16 + // external address
        2 + // remote port
        2 + // reserved
        16; // remote address

    /// Encode this [`PeerData`].
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let PeerData {
            nonce,
            protocol,
            internal_port,
            external_port,
            external_address,
            remote_port,
            remote_address,
        } = self;
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0..12].copy_from_slice(nonce);
        buf[12] = (*protocol).into();
        // buf[13..16] reserved
        buf[16..18].copy_from_slice(&internal_port.to_be_bytes());
        buf[18..20].copy_from_slice(&external_port.to_be_bytes());
        buf[20..36].copy_from_slice(&external_address.octets());
        buf[36..38].copy_from_slice(&remote_port.to_be_bytes());
        // buf[38..40] reserved
        buf[40..].copy_from_slice(&remote_address.octets());

        buf
    }

    /// Decode a [`PeerData`].
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(CodecError::Truncated);
        }

        let nonce = buf[..12].try_into().expect("slice has the right size");
        let protocol = buf[12].try_into().map_err(|_| CodecError::Malformed)?;
        // buf[13..16] reserved
        let internal_port = u16::from_be_bytes(buf[16..18].try_into().expect("sized"));
        let external_port = u16::from_be_bytes(buf[18..20].try_into().expect("sized"));
        let external_addr_bytes: [u8; 16] = buf[20..36].try_into().expect("sized");
        let remote_port = u16::from_be_bytes(buf[36..38].try_into().expect("sized"));
        // buf[38..40] reserved
        let remote_addr_bytes: [u8; 16] = buf[40..Self::ENCODED_SIZE].try_into().expect("sized");

        Ok(PeerData {
            nonce,
            protocol,
            internal_port,
            external_port,
            external_address: external_addr_bytes.into(),
            remote_port,
            remote_address: remote_addr_bytes.into(),
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(rng: &mut R) -> PeerData {
        let external: [u8; 16] = rng.gen();
        let remote: [u8; 16] = rng.gen();
        PeerData {
            nonce: rng.gen(),
            protocol: MapProtocol::Tcp,
            internal_port: rng.gen_range(1..=u16::MAX),
            external_port: rng.gen(),
            external_address: external.into(),
            remote_port: rng.gen(),
            remote_address: remote.into(),
        }
    }
}

impl OpcodeData {
    /// Get the associated [`Opcode`].
    pub fn opcode(&self) -> Opcode {
        match self {
            OpcodeData::Announce => Opcode::Announce,
            OpcodeData::MapData(_) => Opcode::Map,
            OpcodeData::PeerData(_) => Opcode::Peer,
        }
    }

    /// Encode this [`OpcodeData`] into the buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            OpcodeData::Announce => {}
            OpcodeData::MapData(map_data) => buf.extend_from_slice(&map_data.encode()),
            OpcodeData::PeerData(peer_data) => buf.extend_from_slice(&peer_data.encode()),
        }
    }

    /// Exact size an encoded [`OpcodeData`] will have.
    pub const fn encoded_size(&self) -> usize {
        match self {
            OpcodeData::Announce => 0,
            OpcodeData::MapData(_) => MapData::ENCODED_SIZE,
            OpcodeData::PeerData(_) => PeerData::ENCODED_SIZE,
        }
    }

    /// Decode the [`OpcodeData`] expected for a given [`Opcode`].
    pub fn decode(opcode: Opcode, buf: &[u8]) -> Result<Self, CodecError> {
        match opcode {
            Opcode::Announce => Ok(OpcodeData::Announce),
            Opcode::Map => MapData::decode(buf).map(OpcodeData::MapData),
            Opcode::Peer => PeerData::decode(buf).map(OpcodeData::PeerData),
        }
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(opcode: Opcode, rng: &mut R) -> OpcodeData {
        match opcode {
            Opcode::Announce => OpcodeData::Announce,
            Opcode::Map => OpcodeData::MapData(MapData::random(rng)),
            Opcode::Peer => OpcodeData::PeerData(PeerData::random(rng)),
        }
    }
}
