//! Ways of reaching a device port
//!
//! Services never reuse the Lockdown connection: every port is opened through
//! a provider, which hands out a fresh [`Connection`] per call.

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
};

use tokio::net::TcpStream;
use tracing::debug;

use crate::{Connection, LinkError, pairing_file::PairingFile};

#[cfg(feature = "usbmuxd")]
use crate::{host::Host, usbmuxd::UsbmuxdAddr};

/// Boxed future returned by providers
pub type ProviderFuture<T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send>>;

/// Opens connections to one device
pub trait DeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    /// Opens a fresh connection to `port` on the device
    fn connect(&self, port: u16) -> ProviderFuture<Connection>;

    /// Label sent with every request
    fn label(&self) -> &str;

    fn udid(&self) -> &str;

    /// The classic pair record for this device
    fn get_pairing_file(&self) -> ProviderFuture<PairingFile>;
}

/// Reaches a device over plain TCP, e.g. on the network or through a tunnel
#[derive(Debug, Clone)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub udid: String,
    pub pairing_file: PairingFile,
    pub label: String,
}

impl DeviceProvider for TcpProvider {
    fn connect(&self, port: u16) -> ProviderFuture<Connection> {
        let addr = self.addr;
        let label = self.label.clone();
        Box::pin(async move {
            let socket_addr = SocketAddr::new(addr, port);
            debug!("Connecting to {socket_addr}");
            let stream = TcpStream::connect(socket_addr).await?;
            Ok(Connection::new(Box::new(stream), label))
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        &self.udid
    }

    fn get_pairing_file(&self) -> ProviderFuture<PairingFile> {
        let pairing_file = self.pairing_file.clone();
        Box::pin(async move { Ok(pairing_file) })
    }
}

/// Reaches a device through usbmuxd, one fresh daemon socket per call
#[cfg(feature = "usbmuxd")]
#[derive(Debug, Clone)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

#[cfg(feature = "usbmuxd")]
impl UsbmuxdProvider {
    /// Builds a provider from the host context
    pub fn from_host(host: &Host, udid: impl Into<String>, device_id: u32) -> Self {
        Self {
            addr: host.usbmuxd.clone(),
            udid: udid.into(),
            device_id,
            label: host.label.clone(),
        }
    }

    /// Reads the record from usbmuxd, falling back to the host's mirror
    pub async fn get_pairing_file_or_mirror(&self, host: &Host) -> Result<PairingFile, LinkError> {
        match self.get_pairing_file().await {
            Ok(p) => Ok(p),
            Err(e) => {
                debug!("usbmuxd has no record for {} ({e}), trying mirror", self.udid);
                host.read_mirrored_pair_record_async(&self.udid).await
            }
        }
    }
}

#[cfg(feature = "usbmuxd")]
impl DeviceProvider for UsbmuxdProvider {
    fn connect(&self, port: u16) -> ProviderFuture<Connection> {
        let addr = self.addr.clone();
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect().await?.with_prog_name(label.clone());
            usbmuxd.connect_to_device(device_id, port, label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        &self.udid
    }

    fn get_pairing_file(&self) -> ProviderFuture<PairingFile> {
        let addr = self.addr.clone();
        let udid = self.udid.clone();

        Box::pin(async move {
            let mut usbmuxd = addr.connect().await?;
            usbmuxd.get_pair_record(&udid).await
        })
    }
}
