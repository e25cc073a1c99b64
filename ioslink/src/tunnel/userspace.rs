//! Userspace data plane
//!
//! The tunnel's packets feed the crate's own TCP stack. Local programs reach
//! the device through a loopback listener: each connection first names its
//! destination as 16 bytes of IPv6 address and a little-endian `u32` port,
//! then carries raw bytes both ways.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    LinkError,
    tcp::{Adapter, AdapterHandle},
    tunnel::{cdtunnel::TunnelParameters, link::PacketLink},
};

/// Starts the stack over `link` with the addresses from `parameters`
pub fn start_stack(
    link: Box<dyn PacketLink>,
    parameters: &TunnelParameters,
) -> Result<AdapterHandle, LinkError> {
    let host_ip: Ipv6Addr = parameters.client_parameters.address.parse()?;
    let device_ip: Ipv6Addr = parameters.server_address.parse()?;
    let (rx, tx) = link.split();
    let adapter = Adapter::new(tx, host_ip, device_ip, parameters.client_parameters.mtu)?;
    info!("Userspace stack at {host_ip} reaching {device_ip}");
    Ok(AdapterHandle::new(adapter, rx))
}

/// Reads the destination header and bridges one local connection
async fn bridge(
    mut local: TcpStream,
    handle: AdapterHandle,
    device_ip: Ipv6Addr,
) -> Result<(), LinkError> {
    let mut addr = [0u8; 16];
    local.read_exact(&mut addr).await?;
    let port = local.read_u32_le().await?;
    let target = Ipv6Addr::from(addr);
    if target != device_ip {
        warn!("Refusing connection to {target}, the tunnel only reaches {device_ip}");
        return Err(LinkError::TunnelSetupFailed(format!("{target} is not on the tunnel")));
    }
    let port = u16::try_from(port)
        .map_err(|_| LinkError::Decode(format!("port {port} out of range")))?;

    let mut remote = handle.connect(port).await?;
    debug!("Bridging local connection to device port {port}");
    let (up, down) = tokio::io::copy_bidirectional(&mut local, &mut remote).await?;
    debug!("Device port {port} done, {up} bytes up and {down} down");
    Ok(())
}

/// Serves local connections until `shutdown` flips. Returns the listener's
/// address and the accept task.
pub async fn serve_listener(
    handle: AdapterHandle,
    device_ip: Ipv6Addr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, JoinHandle<()>), LinkError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    info!("Userspace tunnel listening on {addr}");

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    debug!("Tunnel connection from {peer}");
                    let handle = handle.clone();
                    let mut stop = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            r = bridge(stream, handle, device_ip) => {
                                if let Err(e) = r {
                                    debug!("Tunnel connection from {peer} ended: {e}");
                                }
                            }
                            _ = stop.changed() => {}
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Userspace listener stopped");
    });
    Ok((addr, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::{
        adapter::tests::{DEVICE, HOST, link_pair},
        handle::tests::upper_echo_device,
    };
    use crate::tunnel::cdtunnel::ClientParameters;
    use tokio::io::AsyncWriteExt;

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
    async fn loopback_listener_bridges_to_device_port() {
        let (host, device) = link_pair();
        tokio::spawn(upper_echo_device(device.rx, device.tx));
        let handle = start_stack(Box::new(host), &parameters()).unwrap();
        let (_stop_tx, stop) = watch::channel(false);
        let (addr, _task) = serve_listener(handle, DEVICE, stop).await.unwrap();

        let mut local = TcpStream::connect(addr).await.unwrap();
        local.write_all(&DEVICE.octets()).await.unwrap();
        local.write_all(&7u32.to_le_bytes()).await.unwrap();
        local.write_all(b"through the tunnel").await.unwrap();

        let mut buf = [0u8; 18];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"THROUGH THE TUNNEL");

        local.shutdown().await.unwrap();
        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn foreign_destinations_are_dropped() {
        let (host, device) = link_pair();
        tokio::spawn(upper_echo_device(device.rx, device.tx));
        let handle = start_stack(Box::new(host), &parameters()).unwrap();
        let (_stop_tx, stop) = watch::channel(false);
        let (addr, _task) = serve_listener(handle, DEVICE, stop).await.unwrap();

        let mut local = TcpStream::connect(addr).await.unwrap();
        local.write_all(&Ipv6Addr::LOCALHOST.octets()).await.unwrap();
        local.write_all(&7u32.to_le_bytes()).await.unwrap();
        let mut rest = Vec::new();
        local.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
