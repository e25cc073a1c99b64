//! iOS 17+ tunnels
//!
//! A tunnel is a packet link to the device plus a data plane on the host.
//! The link is QUIC or TLS-PSK after remote pairing, or the Lockdown
//! CoreDeviceProxy stream on iOS 17.4 and later. The data plane is a kernel
//! TUN interface or the crate's userspace TCP stack behind a loopback
//! listener.

use std::{
    net::{IpAddr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use rsa::{RsaPublicKey, pkcs8::EncodePublicKey};
use tokio::{net::TcpStream, sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    Connection, LinkError, ca,
    host::{Capabilities, Device, Host, TunnelInfo},
    lockdown::LockdownClient,
    provider::DeviceProvider,
    remote_pairing::{
        DevicePairRecord, PairOutcome, RemotePairingClient, RpPairingSocketProvider, SelfIdentity,
        TransportProtocol, UNTRUSTED_TUNNEL_SERVICE,
    },
    rsd::RsdHandshake,
    xpc::RemoteXpcClient,
};

pub mod cdtunnel;
pub mod link;
pub mod lockdown_proxy;
pub mod quic;
#[cfg(feature = "openssl")]
pub mod tls_psk;
pub mod tun;
#[cfg(feature = "tunnel_tcp_stack")]
pub mod userspace;

pub use cdtunnel::{ClientParameters, TunnelParameters};
pub use link::{PacketLink, StreamLink};
pub use tun::{InterfaceHook, NoHook};

/// Upper bound on bringing a tunnel up for a device
pub const INLINE_TUNNEL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    /// An OS TUN interface, needs privileges
    Kernel,
    /// The userspace stack behind a loopback listener
    #[default]
    Userspace,
}

/// Where host traffic enters the tunnel
#[derive(Debug)]
pub enum DataPlane {
    Kernel {
        interface: String,
    },
    #[cfg(feature = "tunnel_tcp_stack")]
    Userspace {
        handle: crate::tcp::AdapterHandle,
        /// Loopback address taking `addr(16) | port(u32 LE)` prefixed
        /// connections
        listener: SocketAddr,
    },
}

/// A running tunnel. Dropping it tears down the data plane and the link.
#[derive(Debug)]
pub struct Tunnel {
    pub parameters: TunnelParameters,
    pub plane: DataPlane,
    device_ip: Ipv6Addr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    quic: Option<quinn::Connection>,
}

impl Tunnel {
    /// Puts a data plane on an established link
    pub async fn start_with_link(
        link: Box<dyn PacketLink>,
        parameters: TunnelParameters,
        mode: TunnelMode,
        hook: &dyn InterfaceHook,
    ) -> Result<Self, LinkError> {
        let device_ip: Ipv6Addr = parameters.server_address.parse()?;
        let (shutdown, stop) = watch::channel(false);

        let (plane, tasks) = match mode {
            TunnelMode::Kernel => {
                let tun = tun::KernelTun::create(&parameters, hook)?;
                let interface = tun.name().to_string();
                (DataPlane::Kernel { interface }, tun.spawn_pumps(link, stop))
            }
            #[cfg(feature = "tunnel_tcp_stack")]
            TunnelMode::Userspace => {
                let handle = userspace::start_stack(link, &parameters)?;
                let (listener, task) =
                    userspace::serve_listener(handle.clone(), device_ip, stop).await?;
                (DataPlane::Userspace { handle, listener }, vec![task])
            }
            #[cfg(not(feature = "tunnel_tcp_stack"))]
            TunnelMode::Userspace => {
                return Err(LinkError::TunnelSetupFailed(
                    "userspace tunnels need the tunnel_tcp_stack feature".into(),
                ));
            }
        };

        info!(
            "Tunnel to {device_ip} up, RSD on port {}",
            parameters.server_rsd_port
        );
        Ok(Self {
            parameters,
            plane,
            device_ip,
            shutdown,
            tasks,
            quic: None,
        })
    }

    /// Creates a tunnel listener over an encrypted pairing session and dials
    /// it. `device_addr` is where the pairing session reached the device;
    /// only its port is replaced.
    pub async fn start_remote_pairing<R: RpPairingSocketProvider>(
        client: &mut RemotePairingClient<R>,
        device_addr: SocketAddr,
        protocol: TransportProtocol,
        mode: TunnelMode,
        hook: &dyn InterfaceHook,
    ) -> Result<Self, LinkError> {
        let key = ca::generate_rsa_key()?;
        let spki = RsaPublicKey::from(&key)
            .to_public_key_der()
            .map_err(|e| LinkError::CertificateGeneration(e.to_string()))?;
        let listener = client.create_listener(spki.as_bytes(), protocol).await?;
        let mut addr = device_addr;
        addr.set_port(listener.port);

        match protocol {
            TransportProtocol::Quic => {
                let tunnel = quic::QuicTunnel::connect(addr, &key).await?;
                let (link, parameters) = tunnel.into_link();
                let connection = link.connection().clone();
                let mut tunnel =
                    Self::start_with_link(Box::new(link), parameters, mode, hook).await?;
                tunnel.quic = Some(connection);
                Ok(tunnel)
            }
            #[cfg(feature = "openssl")]
            TransportProtocol::Tcp => {
                let psk = client
                    .session_key()
                    .ok_or(LinkError::NoEstablishedConnection)?;
                let (link, parameters) = tls_psk::connect(addr, psk).await?;
                Self::start_with_link(Box::new(link), parameters, mode, hook).await
            }
            #[cfg(not(feature = "openssl"))]
            TransportProtocol::Tcp => Err(LinkError::TunnelSetupFailed(
                "TCP tunnels need the openssl feature for TLS-PSK".into(),
            )),
        }
    }

    /// Brings a tunnel up the way the device's iOS version allows: the
    /// Lockdown CoreDeviceProxy on 17.4 and later, remote pairing on 17.0 to
    /// 17.3. The latter dials RSD at `rsd_addr`, which the caller must have
    /// discovered, and carries the link over `protocol`.
    pub async fn start_for_device(
        host: &Host,
        provider: &dyn DeviceProvider,
        device: &mut Device,
        rsd_addr: Option<SocketAddr>,
        protocol: TransportProtocol,
        mode: TunnelMode,
        hook: &dyn InterfaceHook,
    ) -> Result<Self, LinkError> {
        let started = tokio::time::timeout(
            INLINE_TUNNEL_TIMEOUT,
            Self::start_for_device_inner(host, provider, device, rsd_addr, protocol, mode, hook),
        )
        .await
        .map_err(|_| {
            LinkError::TunnelSetupFailed(format!(
                "no tunnel to {} within {INLINE_TUNNEL_TIMEOUT:?}",
                device.udid
            ))
        })??;
        device.tunnel = Some(started.info());
        Ok(started)
    }

    async fn start_for_device_inner(
        host: &Host,
        provider: &dyn DeviceProvider,
        device: &mut Device,
        rsd_addr: Option<SocketAddr>,
        protocol: TransportProtocol,
        mode: TunnelMode,
        hook: &dyn InterfaceHook,
    ) -> Result<Self, LinkError> {
        let version = match device.product_version {
            Some(v) => v,
            None => {
                let v = LockdownClient::connect(provider)
                    .await?
                    .product_version()
                    .await?;
                device.product_version = Some(v);
                v
            }
        };
        let caps = Capabilities::from(version);
        if !caps.supports_rsd {
            return Err(LinkError::TunnelSetupFailed(format!(
                "iOS {version} predates tunnels"
            )));
        }

        if caps.userspace_tun {
            debug!("iOS {version}, using the Lockdown CoreDeviceProxy");
            let proxy = lockdown_proxy::CoreDeviceProxy::connect(provider).await?;
            let (link, parameters) = proxy.into_link();
            return Self::start_with_link(Box::new(link), parameters, mode, hook).await;
        }

        let rsd_addr = rsd_addr.ok_or_else(|| {
            LinkError::TunnelSetupFailed(format!(
                "iOS {version} tunnels go through remote pairing, the device's RSD address is needed"
            ))
        })?;
        debug!("iOS {version}, remote pairing through RSD at {rsd_addr}");
        let handshake = RsdHandshake::new(TcpStream::connect(rsd_addr).await?).await?;
        let mut addr = rsd_addr;
        addr.set_port(handshake.services.require_port(UNTRUSTED_TUNNEL_SERVICE)?);

        let mut xpc = RemoteXpcClient::new(TcpStream::connect(addr).await?).await?;
        xpc.do_handshake().await?;

        let dir = host.remote_pair_dir();
        let (identity, known) = {
            let _lock = host.lock_udid_async(&device.udid).await?;
            let identity = SelfIdentity::load_or_create(&dir, &host.label).await?;
            (identity, DevicePairRecord::load(&dir, &device.udid).await?)
        };
        let mut client = RemotePairingClient::new(xpc, identity);
        if let PairOutcome::Paired(record) = client.connect(known.as_ref(), &device.udid).await? {
            let _lock = host.lock_udid_async(&device.udid).await?;
            record
                .write_to_file(DevicePairRecord::path(&dir, &device.udid))
                .await?;
            info!("Saved remote pair record for {}", device.udid);
        }

        Self::start_remote_pairing(&mut client, addr, protocol, mode, hook).await
    }

    /// The device's tunnel address and RSD port
    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            address: IpAddr::V6(self.device_ip),
            rsd_port: self.parameters.server_rsd_port,
        }
    }

    /// The loopback listener of a userspace tunnel
    pub fn listener(&self) -> Option<SocketAddr> {
        match &self.plane {
            #[cfg(feature = "tunnel_tcp_stack")]
            DataPlane::Userspace { listener, .. } => Some(*listener),
            DataPlane::Kernel { .. } => None,
        }
    }

    /// Opens `port` on the device through whichever data plane is up
    pub async fn connect(&self, port: u16, label: &str) -> Result<Connection, LinkError> {
        match &self.plane {
            #[cfg(feature = "tunnel_tcp_stack")]
            DataPlane::Userspace { handle, .. } => handle.connect_service(port, label).await,
            DataPlane::Kernel { .. } => {
                let stream = TcpStream::connect((self.device_ip, port)).await?;
                Ok(Connection::new(Box::new(stream), label))
            }
        }
    }

    /// Reads the device's service directory through the tunnel
    pub async fn rsd(&self) -> Result<RsdHandshake, LinkError> {
        let port = self.parameters.server_rsd_port;
        match &self.plane {
            #[cfg(feature = "tunnel_tcp_stack")]
            DataPlane::Userspace { handle, .. } => RsdHandshake::new(handle.connect(port).await?).await,
            DataPlane::Kernel { .. } => {
                RsdHandshake::new(TcpStream::connect((self.device_ip, port)).await?).await
            }
        }
    }

    /// Stops every task and closes the link
    pub async fn close(mut self) {
        self.shutdown.send_replace(true);
        if let Some(c) = self.quic.take() {
            quic::close(&c);
        }
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Tunnel task failed: {e}");
            }
        }
        info!("Tunnel to {} closed", self.device_ip);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(c) = self.quic.take() {
            quic::close(&c);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(all(test, feature = "tunnel_tcp_stack"))]
mod tests {
    use super::*;
    use crate::tcp::{
        adapter::tests::{DEVICE, HOST, link_pair},
        handle::tests::upper_echo_device,
    };

    fn parameters() -> TunnelParameters {
        TunnelParameters {
            client_parameters: ClientParameters {
                mtu: 1280,
                address: HOST.to_string(),
                netmask: "ffff:ffff:ffff:ffff::".into(),
            },
            server_address: DEVICE.to_string(),
            server_rsd_port: 58783,
            response_type: None,
        }
    }

    #[tokio::test]
    async fn userspace_tunnel_serves_connections() {
        let (host, device) = link_pair();
        tokio::spawn(upper_echo_device(device.rx, device.tx));

        let tunnel = Tunnel::start_with_link(
            Box::new(host),
            parameters(),
            TunnelMode::Userspace,
            &NoHook,
        )
        .await
        .unwrap();
        assert_eq!(
            tunnel.info(),
            TunnelInfo {
                address: IpAddr::V6(DEVICE),
                rsd_port: 58783
            }
        );
        assert!(tunnel.listener().is_some());

        let mut conn = tunnel.connect(7, "test").await.unwrap();
        conn.send_raw(b"ping").await.unwrap();
        assert_eq!(conn.read_raw(4).await.unwrap(), b"PING");

        let listener = tunnel.listener().unwrap();
        tunnel.close().await;
        assert!(TcpStream::connect(listener).await.is_err());
    }

    #[tokio::test]
    async fn bad_parameters_are_rejected() {
        let (host, _device) = link_pair();
        let mut params = parameters();
        params.server_address = "not an address".into();
        let res =
            Tunnel::start_with_link(Box::new(host), params, TunnelMode::Userspace, &NoHook).await;
        assert!(matches!(res, Err(LinkError::AddrParseError(_))));
    }
}
