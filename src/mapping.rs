//! A port mapping created with one of the supported protocols.

use std::{net::IpAddr, num::NonZeroU16, time::Duration};

use derive_more::Display;

use crate::{
    error::Error,
    nat_pmp::NatPmpMapper,
    pcp::PcpMapper,
    upnp::{UpnpFirewallMapper, UpnpPortMapper},
};

/// Transport protocol of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PortType {
    /// A TCP port.
    #[display("TCP")]
    Tcp,
    /// A UDP port.
    #[display("UDP")]
    Udp,
}

/// Identifies the protocol a [`MappedPort`] was created with, so refresh and
/// unmap route back to the driver owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProtocolTag {
    /// Created over NAT-PMP.
    #[display("NAT-PMP")]
    NatPmp,
    /// Created over PCP.
    #[display("PCP")]
    Pcp,
    /// Created through a UPnP-IGD WAN connection service.
    #[display("UPnP-IGD")]
    UpnpPortMapping,
    /// Created through a UPnP-IGD IPv6 firewall service. No NAT occurs, the
    /// external address is the client's own.
    #[display("UPnP-IGD-firewall")]
    UpnpFirewall,
}

/// An active mapping obtained from a gateway.
///
/// Owned by the caller; pass it back to the [`Mapper`] that created it to
/// refresh or release it.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{port_type} {internal_port} -> {external_address}:{external_port} ({protocol}, {lifetime_seconds}s)")]
pub struct MappedPort {
    /// Transport protocol of the mapping.
    pub port_type: PortType,
    /// The local port traffic is forwarded to.
    pub internal_port: NonZeroU16,
    /// The port the gateway forwards from. May differ from the suggestion
    /// the mapping was requested with.
    pub external_port: u16,
    /// The publicly visible address of the mapping.
    pub external_address: IpAddr,
    /// Lifetime granted by the gateway.
    pub lifetime_seconds: u32,
    /// The protocol that owns this mapping.
    pub protocol: ProtocolTag,
}

impl MappedPort {
    /// Half the granted lifetime. A mapping should be refreshed when this
    /// much of its life has passed.
    pub fn half_lifetime(&self) -> Duration {
        Duration::from_secs((self.lifetime_seconds / 2).into())
    }
}

/// A mapper discovered on the local network.
///
/// All variants expose the same operations; the protocol details differ per
/// driver.
#[derive(Debug, Clone, Display)]
pub enum Mapper {
    /// A NAT-PMP gateway.
    #[display("{_0}")]
    NatPmp(NatPmpMapper),
    /// A PCP gateway.
    #[display("{_0}")]
    Pcp(PcpMapper),
    /// A UPnP-IGD WAN connection service.
    #[display("{_0}")]
    UpnpPort(UpnpPortMapper),
    /// A UPnP-IGD IPv6 firewall control service.
    #[display("{_0}")]
    UpnpFirewall(UpnpFirewallMapper),
}

impl Mapper {
    /// The protocol this mapper speaks.
    pub fn protocol(&self) -> ProtocolTag {
        match self {
            Mapper::NatPmp(_) => ProtocolTag::NatPmp,
            Mapper::Pcp(_) => ProtocolTag::Pcp,
            Mapper::UpnpPort(_) => ProtocolTag::UpnpPortMapping,
            Mapper::UpnpFirewall(_) => ProtocolTag::UpnpFirewall,
        }
    }

    /// Requests a mapping of `internal_port`.
    ///
    /// `external_port_hint` is a suggestion; the gateway may assign a
    /// different external port. The granted lifetime in the returned
    /// [`MappedPort`] may also differ from the requested one.
    pub async fn map_port(
        &self,
        port_type: PortType,
        internal_port: NonZeroU16,
        external_port_hint: Option<NonZeroU16>,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        match self {
            Mapper::NatPmp(mapper) => {
                mapper
                    .map(port_type, internal_port, external_port_hint, lifetime_seconds)
                    .await
            }
            Mapper::Pcp(mapper) => {
                mapper
                    .map(port_type, internal_port, external_port_hint, lifetime_seconds)
                    .await
            }
            Mapper::UpnpPort(mapper) => {
                mapper
                    .map(port_type, internal_port, external_port_hint, lifetime_seconds)
                    .await
            }
            Mapper::UpnpFirewall(mapper) => {
                mapper.map(port_type, internal_port, lifetime_seconds).await
            }
        }
    }

    /// Extends the lifetime of a mapping previously created by this mapper.
    pub async fn refresh_port(
        &self,
        port: &MappedPort,
        lifetime_seconds: u32,
    ) -> Result<MappedPort, Error> {
        self.check_ownership(port)?;
        match self {
            Mapper::NatPmp(mapper) => mapper.refresh(port, lifetime_seconds).await,
            Mapper::Pcp(mapper) => mapper.refresh(port, lifetime_seconds).await,
            Mapper::UpnpPort(mapper) => mapper.refresh(port, lifetime_seconds).await,
            Mapper::UpnpFirewall(mapper) => mapper.refresh(port, lifetime_seconds).await,
        }
    }

    /// Releases a mapping previously created by this mapper.
    pub async fn unmap_port(&self, port: &MappedPort) -> Result<(), Error> {
        self.check_ownership(port)?;
        match self {
            Mapper::NatPmp(mapper) => mapper.unmap(port).await,
            Mapper::Pcp(mapper) => mapper.unmap(port).await,
            Mapper::UpnpPort(mapper) => mapper.unmap(port).await,
            Mapper::UpnpFirewall(mapper) => mapper.unmap(port).await,
        }
    }

    fn check_ownership(&self, port: &MappedPort) -> Result<(), Error> {
        if port.protocol != self.protocol() {
            return Err(Error::InvalidArgument("protocol"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_lifetime() {
        let port = MappedPort {
            port_type: PortType::Udp,
            internal_port: NonZeroU16::new(5000).unwrap(),
            external_port: 5000,
            external_address: IpAddr::from([203, 0, 113, 1]),
            lifetime_seconds: 7200,
            protocol: ProtocolTag::Pcp,
        };
        assert_eq!(port.half_lifetime(), Duration::from_secs(3600));
    }
}
