//! HTTP/SOAP control requests and responses.
//!
//! The request bytes are fixed down to header order and envelope
//! namespaces. Deployed gateways match on literal substrings of this
//! encoding, so none of it may be reformatted — including the SOAP 1.2
//! envelope namespace next to the 1.1-style `encodingStyle`, which is what
//! gateways in the field accept.

use std::net::IpAddr;

use xmltree::{Element, XMLNode};

use crate::CodecError;

const ENVELOPE_OPEN: &str = "<?xml version=\"1.0\"?>\
    <soap:Envelope xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope/\" \
    soap:encodingStyle=\"http://www.w3.org/2003/05/soap-encoding\">\
    <soap:Body>";
const ENVELOPE_CLOSE: &str = "</soap:Body></soap:Envelope>";

/// A SOAP action invocation: a name plus its ordered argument elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapAction {
    name: &'static str,
    arguments: Vec<(&'static str, String)>,
}

impl SoapAction {
    /// Creates an action with no arguments.
    pub fn new(name: &'static str) -> Self {
        SoapAction {
            name,
            arguments: Vec::new(),
        }
    }

    /// Appends an argument element. Order is preserved on the wire.
    pub fn argument(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.arguments.push((name, value.into()));
        self
    }

    /// The action name, as used in the `SOAPAction` header.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Renders the SOAP envelope for this action on `service_type`.
    pub fn envelope(&self, service_type: &str) -> String {
        let mut body = String::new();
        body.push_str(ENVELOPE_OPEN);
        body.push_str(&format!("<u:{} xmlns:u=\"{}\">", self.name, service_type));
        for (name, value) in &self.arguments {
            body.push_str(&format!("<{name}>{value}</{name}>"));
        }
        body.push_str(&format!("</u:{}>", self.name));
        body.push_str(ENVELOPE_CLOSE);
        body
    }

    /// Renders the full HTTP request sent over TCP to the control endpoint.
    pub fn encode_request(&self, host: &str, control_path: &str, service_type: &str) -> Vec<u8> {
        let body = self.envelope(service_type);
        format!(
            "POST {control_path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Content-Type: text/xml\r\n\
             SOAPAction: {service_type}#{action}\r\n\
             Connection: Close\r\n\
             Cache-Control: no-cache\r\n\
             Pragma: no-cache\r\n\
             Content-Length: {length}\r\n\
             \r\n\
             {body}",
            action = self.name,
            length = body.len(),
        )
        .into_bytes()
    }
}

/// Renders an address the way the IGD services expect them in argument
/// elements: dotted quad for IPv4; for IPv6 lowercase hex groups with
/// per-group leading zeros stripped and no `::` compression.
pub fn render_address(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(addr) => addr.to_string(),
        IpAddr::V6(addr) => {
            let groups = addr.segments().map(|group| format!("{group:x}"));
            groups.join(":")
        }
    }
}

/// A parsed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code of the response line.
    pub status: u16,
    headers: Vec<(String, String)>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Incrementally parse an HTTP response from the bytes received so far.
    ///
    /// Returns `Ok(None)` when more data is needed. `eof` indicates the peer
    /// closed the connection; since control requests are sent with
    /// `Connection: Close`, a body without `Content-Length` is terminated by
    /// it.
    pub fn parse(buf: &[u8], eof: bool) -> Result<Option<Self>, CodecError> {
        let Some(head_end) = find_header_end(buf) else {
            return if eof {
                Err(CodecError::Truncated)
            } else {
                Ok(None)
            };
        };
        let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| CodecError::Malformed)?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().ok_or(CodecError::Malformed)?;
        let mut parts = status_line.split_whitespace();
        if !parts
            .next()
            .map(|version| version.starts_with("HTTP/1."))
            .unwrap_or_default()
        {
            return Err(CodecError::Malformed);
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or(CodecError::Malformed)?;

        let mut headers = Vec::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let body_start = head_end + 4;
        let content_length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok());

        let body = match content_length {
            Some(length) => {
                if buf.len() < body_start + length {
                    return if eof {
                        Err(CodecError::Truncated)
                    } else {
                        Ok(None)
                    };
                }
                buf[body_start..body_start + length].to_vec()
            }
            None => {
                if !eof {
                    return Ok(None);
                }
                buf[body_start..].to_vec()
            }
        };

        Ok(Some(HttpResponse {
            status,
            headers,
            body,
        }))
    }

    /// Value of the first header matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Extracts the text of the first element named `name` anywhere in a SOAP
/// response body, namespaces ignored.
pub fn response_argument(body: &[u8], name: &str) -> Result<Option<String>, CodecError> {
    let root = Element::parse(body).map_err(|_| CodecError::Malformed)?;
    Ok(find_element(&root, name).map(element_text))
}

/// A SOAP/UPnP fault carried in an error response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// `errorCode` reported by the gateway.
    pub code: u16,
    /// `errorDescription` reported by the gateway, possibly empty.
    pub description: String,
}

impl Fault {
    /// Parses the `UPnPError` block of an error response body, if any.
    pub fn parse(body: &[u8]) -> Option<Fault> {
        let root = Element::parse(body).ok()?;
        let error = find_element(&root, "UPnPError")?;
        let code = find_element(error, "errorCode")?;
        let code = element_text(code).trim().parse().ok()?;
        let description = find_element(error, "errorDescription")
            .map(element_text)
            .unwrap_or_default();
        Some(Fault { code, description })
    }
}

fn find_element<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    if element.name == name {
        return Some(element);
    }
    element
        .children
        .iter()
        .filter_map(XMLNode::as_element)
        .find_map(|child| find_element(child, name))
}

fn element_text(element: &Element) -> String {
    element.get_text().unwrap_or_default().into_owned()
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_get_external_ip_address_request_bytes() {
        let request = SoapAction::new("GetExternalIPAddress").encode_request(
            "fake",
            "/controllink",
            "service:type",
        );
        assert_eq!(
            text(request),
            "POST /controllink HTTP/1.1\r\n\
             Host: fake\r\n\
             Content-Type: text/xml\r\n\
             SOAPAction: service:type#GetExternalIPAddress\r\n\
             Connection: Close\r\n\
             Cache-Control: no-cache\r\n\
             Pragma: no-cache\r\n\
             Content-Length: 262\r\n\
             \r\n\
             <?xml version=\"1.0\"?>\
             <soap:Envelope xmlns:soap=\"http://www.w3.org/2003/05/soap-envelope/\" \
             soap:encodingStyle=\"http://www.w3.org/2003/05/soap-encoding\">\
             <soap:Body>\
             <u:GetExternalIPAddress xmlns:u=\"service:type\">\
             </u:GetExternalIPAddress>\
             </soap:Body>\
             </soap:Envelope>"
        );
    }

    #[test]
    fn test_delete_port_mapping_request_bytes() {
        let request = SoapAction::new("DeletePortMapping")
            .argument(
                "NewRemoteHost",
                render_address(Ipv4Addr::new(1, 2, 3, 4).into()),
            )
            .argument("NewExternalPort", "15")
            .argument("NewProtocol", "TCP")
            .encode_request("fake", "/controllink", "service:type");
        let request = text(request);
        assert!(request.starts_with("POST /controllink HTTP/1.1\r\n"));
        assert!(request.contains("Content-Length: 361\r\n"));
        assert!(request.contains(
            "<u:DeletePortMapping xmlns:u=\"service:type\">\
             <NewRemoteHost>1.2.3.4</NewRemoteHost>\
             <NewExternalPort>15</NewExternalPort>\
             <NewProtocol>TCP</NewProtocol>\
             </u:DeletePortMapping>"
        ));
    }

    #[test]
    fn test_delete_port_mapping_request_bytes_ipv6() {
        let addr = Ipv6Addr::from([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
            0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
        ]);
        let request = SoapAction::new("DeletePortMapping")
            .argument("NewRemoteHost", render_address(addr.into()))
            .argument("NewExternalPort", "20000")
            .argument("NewProtocol", "UDP")
            .encode_request("fake", "/controllink", "service:type");
        let request = text(request);
        assert!(request.contains("Content-Length: 388\r\n"));
        assert!(request.contains(
            "<NewRemoteHost>102:304:506:708:90a:b0c:d0e:f10</NewRemoteHost>\
             <NewExternalPort>20000</NewExternalPort>\
             <NewProtocol>UDP</NewProtocol>"
        ));
    }

    #[test]
    fn test_delete_port_mapping_renders_wildcard_remote_host() {
        let request = SoapAction::new("DeletePortMapping")
            .argument("NewRemoteHost", "")
            .argument("NewExternalPort", "15")
            .argument("NewProtocol", "TCP")
            .encode_request("fake", "/controllink", "service:type");
        let request = text(request);
        assert!(request.contains("Content-Length: 354\r\n"));
        assert!(request.contains("<NewRemoteHost></NewRemoteHost>"));
    }

    #[test]
    fn test_add_port_mapping_request_bytes() {
        let request = SoapAction::new("AddPortMapping")
            .argument(
                "NewRemoteHost",
                render_address(Ipv4Addr::new(1, 2, 3, 4).into()),
            )
            .argument("NewExternalPort", "15")
            .argument("NewProtocol", "TCP")
            .argument("NewInternalPort", "12345")
            .argument(
                "NewInternalClient",
                render_address(Ipv4Addr::new(5, 6, 7, 8).into()),
            )
            .argument("NewEnabled", "1")
            .argument("NewPortMappingDescription", "desc")
            .argument("NewLeaseDuration", "1000")
            .encode_request("fake", "/controllink", "service:type");
        let request = text(request);
        assert!(request.contains("SOAPAction: service:type#AddPortMapping\r\n"));
        assert!(request.contains("Content-Length: 567\r\n"));
        assert!(request.contains(
            "<NewRemoteHost>1.2.3.4</NewRemoteHost>\
             <NewExternalPort>15</NewExternalPort>\
             <NewProtocol>TCP</NewProtocol>\
             <NewInternalPort>12345</NewInternalPort>\
             <NewInternalClient>5.6.7.8</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>desc</NewPortMappingDescription>\
             <NewLeaseDuration>1000</NewLeaseDuration>"
        ));
    }

    #[test]
    fn test_ipv6_addresses_render_without_compression() {
        let addr = Ipv6Addr::from([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, //
            0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
        ]);
        assert_eq!(
            render_address(addr.into()),
            "102:304:506:708:90a:b0c:d0e:f10"
        );
        // a zero group stays a zero group instead of `::`
        assert_eq!(
            render_address(Ipv6Addr::LOCALHOST.into()),
            "0:0:0:0:0:0:0:1"
        );
    }

    #[test]
    fn test_http_response_parses_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: 5\r\n\r\nhello";
        let response = HttpResponse::parse(raw, false).unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/xml"));
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_http_response_waits_for_full_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhell";
        assert_eq!(HttpResponse::parse(raw, false).unwrap(), None);
        assert_eq!(
            HttpResponse::parse(raw, true).unwrap_err(),
            CodecError::Truncated
        );
    }

    #[test]
    fn test_http_response_body_ends_at_eof_without_length() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\n\r\n<fault/>";
        assert_eq!(HttpResponse::parse(raw, false).unwrap(), None);
        let response = HttpResponse::parse(raw, true).unwrap().unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body, b"<fault/>");
    }

    #[test]
    fn test_response_argument_is_found_through_namespaces() {
        let body = br#"<?xml version="1.0"?>
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body>
                <u:GetExternalIPAddressResponse xmlns:u="service:type">
                  <NewExternalIPAddress>203.0.113.9</NewExternalIPAddress>
                </u:GetExternalIPAddressResponse>
              </s:Body>
            </s:Envelope>"#;
        assert_eq!(
            response_argument(body, "NewExternalIPAddress").unwrap(),
            Some("203.0.113.9".to_string())
        );
        assert_eq!(response_argument(body, "NewReservedPort").unwrap(), None);
    }

    #[test]
    fn test_fault_parses() {
        let body = br#"<?xml version="1.0"?>
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body>
                <s:Fault>
                  <detail>
                    <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
                      <errorCode>718</errorCode>
                      <errorDescription>ConflictInMappingEntry</errorDescription>
                    </UPnPError>
                  </detail>
                </s:Fault>
              </s:Body>
            </s:Envelope>"#;
        let fault = Fault::parse(body).unwrap();
        assert_eq!(fault.code, 718);
        assert_eq!(fault.description, "ConflictInMappingEntry");
    }
}
