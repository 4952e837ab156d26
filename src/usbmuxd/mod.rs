// Jackson Coxson

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{ReadWrite, RemoteXpcError};

mod raw_packet;

/// How the muxer reaches a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device advertised by usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    pub udid: String,
    pub device_id: u32,
    pub product_id: Option<u32>,
}

#[derive(Deserialize)]
struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    device_list: Vec<DeviceListResponse>,
}

#[derive(Deserialize)]
struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    device_id: u32,
    #[serde(rename = "Properties")]
    properties: DevicePropertiesResponse,
}

#[derive(Deserialize)]
struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    connection_type: String,
    #[serde(rename = "NetworkAddress")]
    network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    serial_number: String,
    #[serde(rename = "ProductID")]
    product_id: Option<u32>,
}

/// A connection to the usbmuxd socket
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

impl std::fmt::Debug for UsbmuxdConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbmuxdConnection")
            .field("tag", &self.tag)
            .finish()
    }
}

impl UsbmuxdConnection {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    /// Connects to the muxer at its conventional location
    pub async fn default() -> Result<Self, RemoteXpcError> {
        #[cfg(target_os = "windows")]
        let socket = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, Self::DEFAULT_PORT))
            .await?;

        #[cfg(not(target_os = "windows"))]
        let socket = tokio::net::UnixStream::connect(Self::SOCKET_FILE).await?;

        Ok(Self {
            socket: Box::new(socket),
            tag: 0,
        })
    }

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    /// Lists the devices the muxer knows about
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), "remotexpc".into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res = plist::to_value(&res)?;
        let res: ListDevicesResponse = plist::from_value(&res)?;

        let mut devs = Vec::new();
        for dev in res.device_list {
            let connection_type = match dev.properties.connection_type.as_str() {
                "Network" => match dev.properties.network_address {
                    Some(addr) => Connection::Network(parse_sockaddr(&Into::<Vec<u8>>::into(addr))?),
                    None => return Err(RemoteXpcError::UnexpectedResponse),
                },
                "USB" => Connection::Usb,
                _ => Connection::Unknown(dev.properties.connection_type),
            };
            devs.push(UsbmuxdDevice {
                connection_type,
                udid: dev.properties.serial_number,
                device_id: dev.device_id,
                product_id: dev.properties.product_id,
            });
        }

        Ok(devs)
    }

    /// Fetches a device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, RemoteXpcError> {
        self.get_devices()
            .await?
            .into_iter()
            .find(|d| d.udid == udid)
            .ok_or(RemoteXpcError::DeviceNotFound)
    }

    pub async fn get_buid(&mut self) -> Result<String, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Reads the muxer's cached pair record for a device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<Vec<u8>, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => Ok(d.clone()),
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Asks the muxer to connect to a port on the device, turning this
    /// socket into a passthrough stream
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
    ) -> Result<Box<dyn ReadWrite>, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        // the muxer expects the port in network byte order
        req.insert("PortNumber".into(), (port.to_be() as u32).into());
        self.write_plist(req).await?;

        match self.read_plist().await?.get("Number") {
            Some(plist::Value::Integer(i)) => match i.as_unsigned() {
                Some(0) => Ok(self.socket),
                Some(2) => Err(RemoteXpcError::UsbBadDevice),
                Some(3) => Err(RemoteXpcError::UsbConnectionRefused),
                Some(6) => Err(RemoteXpcError::UsbBadVersion),
                _ => Err(RemoteXpcError::UsbBadCommand),
            },
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), RemoteXpcError> {
        let raw = raw_packet::RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        );
        let raw: Vec<u8> = raw.into();
        self.socket.write_all(&raw).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, RemoteXpcError> {
        let mut header_buffer = [0; 16];
        self.socket.read_exact(&mut header_buffer).await?;

        let packet_size = u32::from_le_bytes(header_buffer[..4].try_into().unwrap()) - 16;
        debug!("Reading {packet_size} bytes from muxer");

        let mut body_buffer = vec![0; packet_size as usize];
        self.socket.read_exact(&mut body_buffer).await?;

        Ok(plist::from_bytes(&body_buffer)?)
    }
}

/// Decodes the sockaddr blob usbmuxd reports for network devices
fn parse_sockaddr(addr: &[u8]) -> Result<IpAddr, RemoteXpcError> {
    if addr.len() < 8 {
        return Err(RemoteXpcError::UnexpectedResponse);
    }
    match addr[0] {
        0x02 => Ok(IpAddr::V4(Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7]))),
        0x1E => {
            if addr.len() < 24 {
                return Err(RemoteXpcError::UnexpectedResponse);
            }
            Ok(IpAddr::V6(Ipv6Addr::new(
                u16::from_le_bytes([addr[8], addr[9]]),
                u16::from_le_bytes([addr[10], addr[11]]),
                u16::from_le_bytes([addr[12], addr[13]]),
                u16::from_le_bytes([addr[14], addr[15]]),
                u16::from_le_bytes([addr[16], addr[17]]),
                u16::from_le_bytes([addr[18], addr[19]]),
                u16::from_le_bytes([addr[20], addr[21]]),
                u16::from_le_bytes([addr[22], addr[23]]),
            )))
        }
        _ => Err(RemoteXpcError::UnexpectedResponse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_sockaddr_parses() {
        let mut addr = vec![0x02, 0x00, 0x00, 0x00, 192, 168, 1, 17];
        addr.extend([0u8; 8]);
        assert_eq!(
            parse_sockaddr(&addr).unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 17))
        );
    }

    #[test]
    fn short_sockaddr_is_rejected() {
        assert!(parse_sockaddr(&[0x02, 0x00]).is_err());
    }
}
