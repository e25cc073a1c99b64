//! usbmuxd client
//!
//! Every request opens its own socket to the daemon, the daemon is shared by
//! every client on the host. Requests carry a tag counting up from 1 and the
//! daemon answers with the same tag.

use std::{
    fmt::Display,
    net::{AddrParseError, IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    Connection, DeviceSocket, LinkError, host::Device, pairing_file::PairingFile,
    provider::UsbmuxdProvider, usbmuxd::des::DeviceListResponse,
};

mod des;
mod raw_packet;

use raw_packet::{HEADER_LEN, PacketHeader, RawPacket};

/// Environment variable overriding the daemon address
pub const USBMUXD_ADDR_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

/// How a device is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device descriptor as usbmuxd reports it
#[derive(Debug, Clone, PartialEq)]
pub struct UsbmuxdDevice {
    pub connection_type: ConnectionType,
    pub udid: String,
    /// Transport id, reassigned on every attach
    pub device_id: u32,
    pub product_id: Option<u32>,
    pub location_id: Option<u32>,
    pub connection_speed: Option<u64>,
}

/// Devices in the order usbmuxd listed them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceList(pub Vec<UsbmuxdDevice>);

impl Display for DeviceList {
    /// One UDID per line
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for dev in &self.0 {
            writeln!(f, "{}", dev.udid)?;
        }
        Ok(())
    }
}

impl IntoIterator for DeviceList {
    type Item = UsbmuxdDevice;
    type IntoIter = std::vec::IntoIter<UsbmuxdDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Events yielded by [`UsbmuxdConnection::listen`]
#[derive(Debug, Clone, PartialEq)]
pub enum UsbmuxdListenEvent {
    Attached(UsbmuxdDevice),
    /// Carries the transport id of the detached device
    Detached(u32),
    /// A pair record was saved for the transport id
    Paired(u32),
}

/// Where the daemon listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// Opens a fresh socket to the daemon
    pub async fn to_socket(&self) -> Result<DeviceSocket, LinkError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Opens a fresh connection to the daemon
    pub async fn connect(&self) -> Result<UsbmuxdConnection, LinkError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket))
    }

    /// Parses an address: anything with a colon is `host:port`, anything
    /// else a unix socket path
    pub fn parse(var: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if !var.contains(':') {
            return Ok(Self::UnixSocket(var.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(USBMUXD_ADDR_ENV) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Swaps a port into the byte order `Connect` expects, whatever the host
/// order
pub fn network_port(port: u16) -> u16 {
    port.swap_bytes()
}

/// One open socket to the daemon
pub struct UsbmuxdConnection {
    socket: DeviceSocket,
    tag: u32,
    prog_name: String,
}

impl std::fmt::Debug for UsbmuxdConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbmuxdConnection")
            .field("tag", &self.tag)
            .finish()
    }
}

impl UsbmuxdConnection {
    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    pub fn new(socket: DeviceSocket) -> Self {
        Self {
            socket,
            tag: 0,
            prog_name: "ioslink".to_string(),
        }
    }

    /// Sets the `ProgName` sent with requests
    pub fn with_prog_name(mut self, name: impl Into<String>) -> Self {
        self.prog_name = name.into();
        self
    }

    /// Lists attached devices
    pub async fn get_devices(&mut self) -> Result<DeviceList, LinkError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ProgName".into(), self.prog_name.clone().into());
        req.insert(
            "ClientVersionString".into(),
            concat!("ioslink-", env!("CARGO_PKG_VERSION")).into(),
        );
        let res = self.request(req).await?;

        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;
        let devs = res
            .device_list
            .into_iter()
            .filter_map(|x| match UsbmuxdDevice::try_from(x) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("Skipping malformed device entry: {e}");
                    None
                }
            })
            .collect();
        Ok(DeviceList(devs))
    }

    /// Finds an attached device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, LinkError> {
        self.get_devices()
            .await?
            .into_iter()
            .find(|x| x.udid == udid)
            .ok_or(LinkError::DeviceNotFound)
    }

    /// Reads the pair record usbmuxd stores for `udid`
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, LinkError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        let res = self.request(req).await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => {
                if let Err(e) = check_result(&res) {
                    debug!("ReadPairRecord failed: {e}");
                }
                Err(LinkError::NotPaired(format!(
                    "{udid}: usbmuxd has no pair record, run `ioslink pair`"
                )))
            }
        }
    }

    /// Reads the host's system BUID
    pub async fn get_buid(&mut self) -> Result<String, LinkError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        let mut res = self.request(req).await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(LinkError::UnexpectedResponse),
        }
    }

    /// Stores a pair record in usbmuxd
    pub async fn save_pair_record(
        &mut self,
        device_id: u32,
        udid: &str,
        record: &PairingFile,
    ) -> Result<(), LinkError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "SavePairRecord".into());
        req.insert("PairRecordData".into(), plist::Value::Data(record.serialize()?));
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PairRecordID".into(), udid.into());
        let res = self.request(req).await?;
        check_result(&res)
    }

    /// Connects to a device port; the socket then carries the device's bytes
    /// and the mux framing is gone for good
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Connection, LinkError> {
        debug!("Connecting to device {device_id} on port {port}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), network_port(port).into());
        let res = self.request(req).await?;
        check_result(&res)?;
        Ok(Connection::new(self.socket, label))
    }

    /// Subscribes to attach and detach events
    pub async fn listen<'a>(
        &'a mut self,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<UsbmuxdListenEvent, LinkError>> + Send + 'a>>, LinkError>
    {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        req.insert("ProgName".into(), self.prog_name.clone().into());
        let res = self.request(req).await?;
        check_result(&res)?;

        let stream = futures::stream::try_unfold(self, |conn| async move {
            loop {
                let (_, msg) = conn.read_plist().await?;
                if let Some(event) = parse_listen_event(msg) {
                    return Ok(Some((event, conn)));
                }
            }
        });
        Ok(Box::pin(stream))
    }

    /// Sends one request and reads the reply carrying the same tag
    async fn request(&mut self, req: plist::Dictionary) -> Result<plist::Dictionary, LinkError> {
        self.tag = self.tag.wrapping_add(1);
        let tag = self.tag;
        self.write_plist(req, tag).await?;
        let (reply_tag, res) = self.read_plist().await?;
        if reply_tag != tag {
            return Err(LinkError::MuxProtocol(format!(
                "reply tag {reply_tag} does not match request tag {tag}"
            )));
        }
        Ok(res)
    }

    async fn write_plist(&mut self, req: plist::Dictionary, tag: u32) -> Result<(), LinkError> {
        debug!("Sending to muxer: {}", crate::pretty_print_dictionary(&req));
        let raw = RawPacket::new(req, Self::XML_PLIST_VERSION, Self::PLIST_MESSAGE_TYPE, tag)
            .serialize()?;
        self.socket.write_all(&raw).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<(u32, plist::Dictionary), LinkError> {
        let mut header_buffer = [0; HEADER_LEN];
        self.socket.read_exact(&mut header_buffer).await?;
        let header = PacketHeader::parse(
            &header_buffer,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
        )?;

        let mut body_buffer = vec![0; header.body_len()];
        self.socket.read_exact(&mut body_buffer).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                LinkError::MuxProtocol("truncated frame".into())
            } else {
                e.into()
            }
        })?;

        let res: plist::Dictionary = plist::from_bytes(&body_buffer)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));
        Ok((header.tag, res))
    }
}

/// Maps a `Result` reply to success or the typed failure
fn check_result(res: &plist::Dictionary) -> Result<(), LinkError> {
    match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
        Some(0) => Ok(()),
        Some(1) => Err(LinkError::UsbBadCommand),
        Some(2) => Err(LinkError::UsbBadDevice),
        Some(3) => Err(LinkError::UsbConnectionRefused),
        Some(6) => Err(LinkError::UsbBadVersion),
        Some(n) => Err(LinkError::MuxCommandFailed(n)),
        None => Err(LinkError::UnexpectedResponse),
    }
}

fn parse_listen_event(msg: plist::Dictionary) -> Option<UsbmuxdListenEvent> {
    let device_id = msg
        .get("DeviceID")
        .and_then(|v| v.as_unsigned_integer())
        .map(|id| id as u32);
    match msg.get("MessageType").and_then(|x| x.as_string()) {
        Some("Attached") => {
            match plist::from_value::<DeviceListResponse>(&plist::Value::Dictionary(msg))
                .map_err(LinkError::from)
                .and_then(UsbmuxdDevice::try_from)
            {
                Ok(dev) => Some(UsbmuxdListenEvent::Attached(dev)),
                Err(e) => {
                    warn!("Malformed Attached event: {e}");
                    None
                }
            }
        }
        Some("Detached") => device_id.map(UsbmuxdListenEvent::Detached),
        Some("Paired") => device_id.map(UsbmuxdListenEvent::Paired),
        other => {
            warn!("Unexpected message during listen: {other:?}");
            None
        }
    }
}

impl UsbmuxdDevice {
    /// A provider that reaches this device through usbmuxd
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }

    /// The host-side context for this device
    pub fn to_device(&self) -> Device {
        Device::new(self.udid.clone(), self.device_id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::DuplexStream;

    /// Reads one request on the daemon side of a fake usbmuxd
    pub(crate) async fn read_request(s: &mut DuplexStream) -> (u32, plist::Dictionary) {
        let mut header = [0u8; HEADER_LEN];
        s.read_exact(&mut header).await.unwrap();
        let header = PacketHeader::parse(&header, 1, 8).unwrap();
        let mut body = vec![0; header.body_len()];
        s.read_exact(&mut body).await.unwrap();
        (header.tag, plist::from_bytes(&body).unwrap())
    }

    pub(crate) async fn write_reply(s: &mut DuplexStream, tag: u32, reply: plist::Dictionary) {
        let raw = RawPacket::new(reply, 1, 8, tag).serialize().unwrap();
        s.write_all(&raw).await.unwrap();
    }

    fn result(number: u64) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), "Result".into());
        d.insert("Number".into(), number.into());
        d
    }

    fn attached(udid: &str, device_id: u32) -> plist::Dictionary {
        let mut props = plist::Dictionary::new();
        props.insert("ConnectionType".into(), "USB".into());
        props.insert("SerialNumber".into(), udid.into());
        props.insert("ProductID".into(), 4776u64.into());
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), "Attached".into());
        d.insert("DeviceID".into(), device_id.into());
        d.insert("Properties".into(), plist::Value::Dictionary(props));
        d
    }

    fn device_list(udids: &[&str]) -> plist::Dictionary {
        let list = udids
            .iter()
            .enumerate()
            .map(|(i, u)| plist::Value::Dictionary(attached(u, 5 + i as u32)))
            .collect();
        let mut d = plist::Dictionary::new();
        d.insert("DeviceList".into(), plist::Value::Array(list));
        d
    }

    #[tokio::test]
    async fn lists_one_device() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let (tag, req) = read_request(&mut daemon).await;
            assert_eq!(req.get("MessageType").unwrap().as_string(), Some("ListDevices"));
            write_reply(&mut daemon, tag, device_list(&["udid0"])).await;
        });

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        let devices = conn.get_devices().await.unwrap();
        assert_eq!(devices.0.len(), 1);
        assert_eq!(devices.0[0].device_id, 5);
        assert_eq!(devices.0[0].connection_type, ConnectionType::Usb);
        assert_eq!(devices.to_string(), "udid0\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn lists_two_devices_in_order() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let (tag, _) = read_request(&mut daemon).await;
            write_reply(&mut daemon, tag, device_list(&["udid0", "udid1"])).await;
        });

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        let devices = conn.get_devices().await.unwrap();
        assert_eq!(devices.to_string(), "udid0\nudid1\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tags_count_up_from_one() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let (tag, _) = read_request(&mut daemon).await;
                seen.push(tag);
                let mut reply = plist::Dictionary::new();
                reply.insert("BUID".into(), "buid".into());
                write_reply(&mut daemon, tag, reply).await;
            }
            seen
        });

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        for _ in 0..3 {
            assert_eq!(conn.get_buid().await.unwrap(), "buid");
        }
        assert_eq!(server.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn mismatched_tag_is_a_protocol_error() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (tag, _) = read_request(&mut daemon).await;
            write_reply(&mut daemon, tag + 7, result(0)).await;
        });

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        assert!(matches!(
            conn.get_buid().await,
            Err(LinkError::MuxProtocol(_))
        ));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (tag, _) = read_request(&mut daemon).await;
            let raw = RawPacket::new(result(0), 0, 8, tag).serialize().unwrap();
            daemon.write_all(&raw).await.unwrap();
        });

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        assert!(matches!(
            conn.get_buid().await,
            Err(LinkError::MuxProtocol(_))
        ));
    }

    #[tokio::test]
    async fn connect_sends_network_order_port_and_maps_failures() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            let (tag, req) = read_request(&mut daemon).await;
            assert_eq!(
                req.get("PortNumber").unwrap().as_unsigned_integer(),
                Some(u64::from(62078u16.swap_bytes()))
            );
            write_reply(&mut daemon, tag, result(3)).await;
        });

        let conn = UsbmuxdConnection::new(Box::new(client));
        assert!(matches!(
            conn.connect_to_device(5, 62078, "test").await,
            Err(LinkError::UsbConnectionRefused)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_failure_number_is_kept() {
        assert!(matches!(
            check_result(&result(42)),
            Err(LinkError::MuxCommandFailed(42))
        ));
        assert!(check_result(&result(0)).is_ok());
    }

    #[tokio::test]
    async fn listen_yields_events() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (tag, req) = read_request(&mut daemon).await;
            assert_eq!(req.get("MessageType").unwrap().as_string(), Some("Listen"));
            write_reply(&mut daemon, tag, result(0)).await;

            write_reply(&mut daemon, 0, attached("udid0", 9)).await;
            let mut junk = plist::Dictionary::new();
            junk.insert("MessageType".into(), "Something".into());
            write_reply(&mut daemon, 0, junk).await;
            let mut paired = plist::Dictionary::new();
            paired.insert("MessageType".into(), "Paired".into());
            paired.insert("DeviceID".into(), 9u64.into());
            write_reply(&mut daemon, 0, paired).await;
            let mut detached = plist::Dictionary::new();
            detached.insert("MessageType".into(), "Detached".into());
            detached.insert("DeviceID".into(), 9u64.into());
            write_reply(&mut daemon, 0, detached).await;
        });

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        let mut events = conn.listen().await.unwrap();
        match events.next().await.unwrap().unwrap() {
            UsbmuxdListenEvent::Attached(d) => {
                assert_eq!(d.udid, "udid0");
                assert_eq!(d.device_id, 9);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            UsbmuxdListenEvent::Paired(9)
        );
        assert_eq!(
            events.next().await.unwrap().unwrap(),
            UsbmuxdListenEvent::Detached(9)
        );
    }

    #[test]
    fn ports_are_always_swapped() {
        assert_eq!(network_port(62078), 0x7EF2);
        assert_eq!(network_port(0x0102), 0x0201);
    }

    /// A daemon keeping saved pair records in memory
    #[cfg(feature = "pair")]
    async fn pair_record_store(mut daemon: DuplexStream, requests: usize) {
        let mut store = std::collections::HashMap::<String, Vec<u8>>::new();
        for _ in 0..requests {
            let (tag, req) = read_request(&mut daemon).await;
            let id = req
                .get("PairRecordID")
                .and_then(|v| v.as_string())
                .unwrap()
                .to_string();
            match req.get("MessageType").and_then(|v| v.as_string()) {
                Some("SavePairRecord") => {
                    let data = req.get("PairRecordData").and_then(|v| v.as_data()).unwrap();
                    store.insert(id, data.to_vec());
                    write_reply(&mut daemon, tag, result(0)).await;
                }
                Some("ReadPairRecord") => match store.get(&id) {
                    Some(data) => {
                        let mut reply = plist::Dictionary::new();
                        reply.insert("PairRecordData".into(), plist::Value::Data(data.clone()));
                        write_reply(&mut daemon, tag, reply).await;
                    }
                    None => write_reply(&mut daemon, tag, result(2)).await,
                },
                other => panic!("unexpected request {other:?}"),
            }
        }
    }

    #[cfg(feature = "pair")]
    #[tokio::test]
    async fn saved_pair_record_reads_back_unchanged() {
        let (client, daemon) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(pair_record_store(daemon, 3));
        let mut record = crate::pairing_file::tests::minted_pairing_file();
        record.udid = Some("udid0".into());

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        conn.save_pair_record(5, "udid0", &record).await.unwrap();
        let read = conn.get_pair_record("udid0").await.unwrap();
        assert_eq!(read.host_certificate, record.host_certificate);
        assert_eq!(read.host_private_key, record.host_private_key);
        assert_eq!(read.root_certificate, record.root_certificate);
        assert_eq!(read.device_certificate, record.device_certificate);
        assert_eq!(read.host_id, record.host_id);
        assert_eq!(read.system_buid, record.system_buid);
        assert_eq!(read, record);

        assert!(matches!(
            conn.get_pair_record("udid1").await,
            Err(LinkError::NotPaired(_))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reply_without_record_data_is_not_paired() {
        let (client, mut daemon) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (tag, _) = read_request(&mut daemon).await;
            write_reply(&mut daemon, tag, result(0)).await;
        });

        let mut conn = UsbmuxdConnection::new(Box::new(client));
        assert!(matches!(
            conn.get_pair_record("udid0").await,
            Err(LinkError::NotPaired(_))
        ));
    }

    #[test]
    fn parses_socket_addresses() {
        assert_eq!(
            UsbmuxdAddr::parse("127.0.0.1:27015").unwrap(),
            UsbmuxdAddr::TcpSocket("127.0.0.1:27015".parse().unwrap())
        );
        #[cfg(unix)]
        assert_eq!(
            UsbmuxdAddr::parse("/tmp/usbmuxd").unwrap(),
            UsbmuxdAddr::UnixSocket("/tmp/usbmuxd".into())
        );
    }
}
