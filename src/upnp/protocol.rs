//! Text wire formats of UPnP-IGD: SSDP datagrams, HTTP/SOAP control
//! requests and the XML device descriptor.
//!
//! Pure encode/decode. Socket handling lives in the driver,
//! [`crate::upnp`].

pub mod descriptor;
pub mod soap;
pub mod ssdp;

/// Service types this client recognizes in a device descriptor.
pub const WAN_IP_CONNECTION_1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
pub const WAN_IP_CONNECTION_2: &str = "urn:schemas-upnp-org:service:WANIPConnection:2";
pub const WAN_PPP_CONNECTION_1: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";
pub const WAN_IPV6_FIREWALL_CONTROL_1: &str =
    "urn:schemas-upnp-org:service:WANIPv6FirewallControl:1";
