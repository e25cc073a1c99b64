// Deserialization of usbmuxd device descriptors

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    LinkError,
    usbmuxd::{ConnectionType, UsbmuxdDevice},
};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DevicePropertiesResponse {
    pub connection_type: String,
    pub network_address: Option<plist::Data>,
    pub serial_number: String,
    #[serde(rename = "ProductID")]
    pub product_id: Option<u32>,
    #[serde(rename = "LocationID")]
    pub location_id: Option<u32>,
    pub connection_speed: Option<u64>,
}

fn ipv6_at(addr: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// Decodes the raw `sockaddr` usbmuxd reports for network devices
fn parse_network_address(addr: &[u8]) -> Result<ConnectionType, LinkError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(LinkError::UnexpectedResponse);
    }
    Ok(match addr[0] {
        // sockaddr_in
        0x02 => ConnectionType::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        // sockaddr_in6 without a length byte
        0x1E if addr.len() >= 24 => ConnectionType::Network(IpAddr::V6(ipv6_at(addr, 8))),
        // BSD sockaddr_in6: length then family
        0x1C if addr.len() >= 24 && addr[1] == 0x1E => {
            ConnectionType::Network(IpAddr::V6(ipv6_at(addr, 8)))
        }
        other => {
            warn!("Unknown address family: {other:02X}");
            ConnectionType::Unknown(format!("Network {other:02X}"))
        }
    })
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = LinkError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "Network" => match dev.properties.network_address {
                Some(addr) => parse_network_address(&Into::<Vec<u8>>::into(addr))?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(LinkError::UnexpectedResponse);
                }
            },
            "USB" => ConnectionType::Usb,
            _ => ConnectionType::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
            product_id: dev.properties.product_id,
            location_id: dev.properties.location_id,
            connection_speed: dev.properties.connection_speed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_and_ipv6_sockaddrs() {
        let v4 = [0x02, 0, 0, 0, 192, 168, 1, 20];
        assert_eq!(
            parse_network_address(&v4).unwrap(),
            ConnectionType::Network("192.168.1.20".parse().unwrap())
        );

        let mut v6 = vec![0x1C, 0x1E, 0, 0, 0, 0, 0, 0];
        v6.extend_from_slice(&"fe80::1".parse::<Ipv6Addr>().unwrap().octets());
        v6.extend_from_slice(&[0; 4]);
        assert_eq!(
            parse_network_address(&v6).unwrap(),
            ConnectionType::Network("fe80::1".parse().unwrap())
        );

        assert!(parse_network_address(&[0x02, 0]).is_err());
    }
}
