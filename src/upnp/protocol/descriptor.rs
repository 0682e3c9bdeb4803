//! UPnP device descriptor parsing.
//!
//! The descriptor is the XML document a gateway serves at the `LOCATION`
//! advertised over SSDP. Devices nest through `deviceList` elements, each
//! carrying a `serviceList`; the tree is walked recursively and unknown
//! elements are ignored.

use xmltree::{Element, XMLNode};

use crate::CodecError;

/// A parsed device descriptor: every service found anywhere in the device
/// tree, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Services of the root device and all embedded devices.
    pub services: Vec<ServiceDescriptor>,
}

/// One `service` entry of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Fully qualified service type, e.g.
    /// `urn:schemas-upnp-org:service:WANIPConnection:1`.
    pub service_type: String,
    /// Path (or absolute URL) of the control endpoint.
    pub control_url: String,
    /// Path of the service description document.
    pub scpd_url: String,
    /// Path of the eventing endpoint.
    pub event_sub_url: String,
}

impl DeviceDescriptor {
    /// Parse a descriptor document.
    ///
    /// Elements are matched by local name so descriptors declaring the UPnP
    /// namespace on any ancestor parse the same. A service missing its type
    /// or control URL is skipped.
    pub fn parse(xml: &[u8]) -> Result<Self, CodecError> {
        let root = Element::parse(xml).map_err(|_| CodecError::Malformed)?;
        let mut services = Vec::new();
        if root.name == "device" {
            collect_services(&root, &mut services);
        } else {
            for device in children_named(&root, "device") {
                collect_services(device, &mut services);
            }
        }
        Ok(DeviceDescriptor { services })
    }
}

fn collect_services(device: &Element, services: &mut Vec<ServiceDescriptor>) {
    if let Some(service_list) = device.get_child("serviceList") {
        for service in children_named(service_list, "service") {
            let service_type = child_text(service, "serviceType");
            let control_url = child_text(service, "controlURL");
            let (Some(service_type), Some(control_url)) = (service_type, control_url) else {
                continue;
            };
            services.push(ServiceDescriptor {
                service_type,
                control_url,
                scpd_url: child_text(service, "SCPDURL").unwrap_or_default(),
                event_sub_url: child_text(service, "eventSubURL").unwrap_or_default(),
            });
        }
    }
    if let Some(device_list) = device.get_child("deviceList") {
        for embedded in children_named(device_list, "device") {
            collect_services(embedded, services);
        }
    }
}

fn children_named<'a>(
    element: &'a Element,
    name: &'a str,
) -> impl Iterator<Item = &'a Element> + 'a {
    element
        .children
        .iter()
        .filter_map(XMLNode::as_element)
        .filter(move |child| child.name == name)
}

fn child_text(element: &Element, name: &str) -> Option<String> {
    let child = element.get_child(name)?;
    let text = child.get_text()?.trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &[u8] = br#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>test router</friendlyName>
    <unknownVendorBlob><nested/></unknownVendorBlob>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:L3Forwarding1</serviceId>
        <controlURL>/l3f</controlURL>
        <SCPDURL>/l3f.xml</SCPDURL>
        <eventSubURL>/l3f</eventSubURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
                <controlURL>/ctl/IPConn</controlURL>
                <SCPDURL>/WANIPCn.xml</SCPDURL>
                <eventSubURL>/evt/IPConn</eventSubURL>
              </service>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPv6FirewallControl:1</serviceType>
                <controlURL>/ctl/IP6FCtl</controlURL>
              </service>
              <service>
                <serviceType>urn:schemas-upnp-org:service:Broken:1</serviceType>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

    #[test]
    fn test_parse_collects_nested_services() {
        let descriptor = DeviceDescriptor::parse(DESCRIPTOR).unwrap();
        let types: Vec<_> = descriptor
            .services
            .iter()
            .map(|service| service.service_type.as_str())
            .collect();
        assert_eq!(
            types,
            [
                "urn:schemas-upnp-org:service:Layer3Forwarding:1",
                "urn:schemas-upnp-org:service:WANIPConnection:1",
                "urn:schemas-upnp-org:service:WANIPv6FirewallControl:1",
            ]
        );
        let wanip = &descriptor.services[1];
        assert_eq!(wanip.control_url, "/ctl/IPConn");
        assert_eq!(wanip.scpd_url, "/WANIPCn.xml");
        assert_eq!(wanip.event_sub_url, "/evt/IPConn");
        // optional URLs may be absent
        assert_eq!(descriptor.services[2].scpd_url, "");
    }

    #[test]
    fn test_parse_rejects_non_xml() {
        assert_eq!(
            DeviceDescriptor::parse(b"not xml at all"),
            Err(CodecError::Malformed)
        );
    }
}
