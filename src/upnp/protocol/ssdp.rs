//! SSDP search datagrams.
//!
//! Discovery sends `M-SEARCH` requests to the well-known multicast group and
//! parses the HTTP/1.1-style datagrams gateways answer with. See the UPnP
//! Device Architecture 1.1, section 1.3.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use derive_more::Display;

use crate::CodecError;

/// IPv4 group SSDP searches are sent to.
pub const MULTICAST_ADDR_V4: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

/// IPv6 link-local group SSDP searches are sent to.
pub const MULTICAST_ADDR_V6: SocketAddrV6 = SocketAddrV6::new(
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc),
    1900,
    0,
    0,
);

/// Search targets this client queries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SearchTarget {
    /// Any root device.
    #[display("upnp:rootdevice")]
    RootDevice,
    /// Gateways exposing a `WANIPConnection:1` service.
    #[display("urn:schemas-upnp-org:service:WANIPConnection:1")]
    WanIpConnection1,
    /// Gateways exposing a `WANIPConnection:2` service.
    #[display("urn:schemas-upnp-org:service:WANIPConnection:2")]
    WanIpConnection2,
}

impl SearchTarget {
    /// The targets searched during discovery.
    pub const ALL: [SearchTarget; 3] = [
        SearchTarget::RootDevice,
        SearchTarget::WanIpConnection1,
        SearchTarget::WanIpConnection2,
    ];
}

/// An `M-SEARCH` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Group the datagram is sent to, echoed in the `HOST` header.
    pub host: SocketAddr,
    /// What to search for.
    pub target: SearchTarget,
    /// Seconds responders may spread their replies over.
    pub mx: u8,
}

impl SearchRequest {
    /// Creates a search request. `mx` must be in `1..=5`.
    pub fn new(host: SocketAddr, target: SearchTarget, mx: u8) -> Result<Self, CodecError> {
        if !(1..=5).contains(&mx) {
            return Err(CodecError::ConstraintViolation("mx"));
        }
        Ok(SearchRequest { host, target, mx })
    }

    /// Encode this request.
    ///
    /// The quotes around `ssdp:discover` are required by the UDA; several
    /// gateways drop the datagram without them.
    pub fn encode(&self) -> Vec<u8> {
        format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: {}\r\n\
             ST: {}\r\n\
             \r\n",
            self.host, self.mx, self.target,
        )
        .into_bytes()
    }
}

/// A parsed `M-SEARCH` response datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Where the responder's device descriptor can be fetched.
    pub location: String,
    /// Search target the responder matched.
    pub st: Option<String>,
    /// Unique service name of the responder.
    pub usn: Option<String>,
    /// Self-description of the responder's stack.
    pub server: Option<String>,
}

impl SearchResponse {
    /// Decode a response datagram.
    ///
    /// Header names are matched case-insensitively. `LOCATION` is required,
    /// everything else is kept if present.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(buf).map_err(|_| CodecError::Malformed)?;
        let mut lines = text.split("\r\n");

        let status = lines.next().ok_or(CodecError::Malformed)?;
        let mut status_parts = status.split_whitespace();
        if status_parts.next() != Some("HTTP/1.1") {
            return Err(CodecError::Malformed);
        }
        if status_parts.next() != Some("200") {
            return Err(CodecError::Malformed);
        }

        let mut location = None;
        let mut st = None;
        let mut usn = None;
        let mut server = None;
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let store = |slot: &mut Option<String>| {
                if slot.is_none() {
                    *slot = Some(value.to_string());
                }
            };
            if name.eq_ignore_ascii_case("location") {
                store(&mut location);
            } else if name.eq_ignore_ascii_case("st") {
                store(&mut st);
            } else if name.eq_ignore_ascii_case("usn") {
                store(&mut usn);
            } else if name.eq_ignore_ascii_case("server") {
                store(&mut server);
            }
        }

        let location = location.ok_or(CodecError::Malformed)?;
        Ok(SearchResponse {
            location,
            st,
            usn,
            server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_request_bytes() {
        let request = SearchRequest::new(
            SocketAddr::V4(MULTICAST_ADDR_V4),
            SearchTarget::RootDevice,
            3,
        )
        .unwrap();
        assert_eq!(
            request.encode(),
            b"M-SEARCH * HTTP/1.1\r\n\
              HOST: 239.255.255.250:1900\r\n\
              MAN: \"ssdp:discover\"\r\n\
              MX: 3\r\n\
              ST: upnp:rootdevice\r\n\
              \r\n"
        );
    }

    #[test]
    fn test_search_request_v6_host() {
        let request = SearchRequest::new(
            SocketAddr::V6(MULTICAST_ADDR_V6),
            SearchTarget::WanIpConnection2,
            3,
        )
        .unwrap();
        let text = String::from_utf8(request.encode()).unwrap();
        assert!(text.contains("HOST: [ff02::c]:1900\r\n"));
        assert!(text.contains("ST: urn:schemas-upnp-org:service:WANIPConnection:2\r\n"));
    }

    #[test]
    fn test_mx_is_bounded() {
        let host = SocketAddr::V4(MULTICAST_ADDR_V4);
        assert_eq!(
            SearchRequest::new(host, SearchTarget::RootDevice, 0).unwrap_err(),
            CodecError::ConstraintViolation("mx")
        );
        assert_eq!(
            SearchRequest::new(host, SearchTarget::RootDevice, 6).unwrap_err(),
            CodecError::ConstraintViolation("mx")
        );
    }

    #[test]
    fn test_decode_response() {
        let datagram = b"HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age=120\r\n\
            location: http://192.168.1.1:5000/rootDesc.xml\r\n\
            SERVER: OpenWRT/21 UPnP/1.1 MiniUPnPd/2.2\r\n\
            ST: upnp:rootdevice\r\n\
            USN: uuid:0000-0000::upnp:rootdevice\r\n\
            \r\n";
        let response = SearchResponse::decode(datagram).unwrap();
        assert_eq!(response.location, "http://192.168.1.1:5000/rootDesc.xml");
        assert_eq!(response.st.as_deref(), Some("upnp:rootdevice"));
        assert_eq!(
            response.usn.as_deref(),
            Some("uuid:0000-0000::upnp:rootdevice")
        );
        assert!(response.server.as_deref().unwrap().contains("MiniUPnPd"));
    }

    #[test]
    fn test_decode_response_requires_location() {
        let datagram = b"HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\n\r\n";
        assert_eq!(
            SearchResponse::decode(datagram),
            Err(CodecError::Malformed)
        );
    }

    #[test]
    fn test_decode_rejects_non_ok() {
        let datagram = b"HTTP/1.1 404 Not Found\r\nLOCATION: http://x/\r\n\r\n";
        assert_eq!(
            SearchResponse::decode(datagram),
            Err(CodecError::Malformed)
        );
    }
}
