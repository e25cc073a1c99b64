//! Kernel TUN data plane
//!
//! Brings up an OS interface with the tunnel's addresses and pumps packets
//! between it and the link, one task per direction. Creating the interface
//! needs privileges; without them the userspace stack is the way in.

use std::{fmt::Debug, net::Ipv6Addr, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info};
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::{
    LinkError,
    tunnel::{cdtunnel::TunnelParameters, link::PacketLink},
};

/// Whatever the OS needs beyond the interface itself, e.g. routes or
/// firewall rules on platforms where creating the adapter is not enough
pub trait InterfaceHook: Send + Sync + Debug {
    fn configure(&self, interface: &str, parameters: &TunnelParameters) -> Result<(), LinkError>;
}

/// Leaves the interface as created
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHook;

impl InterfaceHook for NoHook {
    fn configure(&self, _interface: &str, _parameters: &TunnelParameters) -> Result<(), LinkError> {
        Ok(())
    }
}

/// `ffff:ffff:ffff:ffff::` to 64
pub fn netmask_prefix(netmask: &str) -> Result<u8, LinkError> {
    let mask: Ipv6Addr = netmask
        .parse()
        .map_err(|_| LinkError::LinkFailure(format!("bad netmask `{netmask}`")))?;
    let bits = u128::from(mask);
    if bits.leading_ones() != bits.count_ones() {
        return Err(LinkError::LinkFailure(format!(
            "netmask `{netmask}` is not contiguous"
        )));
    }
    Ok(bits.count_ones() as u8)
}

pub struct KernelTun {
    device: Arc<AsyncDevice>,
    name: String,
    mtu: u16,
}

impl Debug for KernelTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelTun")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .finish()
    }
}

impl KernelTun {
    /// Creates the interface for `parameters` and runs `hook` on it
    pub fn create(parameters: &TunnelParameters, hook: &dyn InterfaceHook) -> Result<Self, LinkError> {
        let client = &parameters.client_parameters;
        let address: Ipv6Addr = client.address.parse()?;
        let prefix = netmask_prefix(&client.netmask)?;

        let device = DeviceBuilder::new()
            .ipv6(address, prefix)
            .mtu(client.mtu)
            .build_async()
            .map_err(|e| LinkError::LinkFailure(format!("creating TUN interface: {e}")))?;
        let name = device
            .name()
            .map_err(|e| LinkError::LinkFailure(format!("reading TUN name: {e}")))?;

        hook.configure(&name, parameters)?;
        info!("TUN interface {name} up with {address}/{prefix}");
        Ok(Self {
            device: Arc::new(device),
            name,
            mtu: client.mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Moves packets both ways until either side fails or `shutdown` flips
    pub fn spawn_pumps(
        self,
        link: Box<dyn PacketLink>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let (mut rx, mut tx) = link.split();

        let device = self.device.clone();
        let mut stop = shutdown.clone();
        let inbound = tokio::spawn(async move {
            loop {
                tokio::select! {
                    packet = rx.recv_packet() => {
                        let packet = match packet {
                            Ok(p) => p,
                            Err(LinkError::TunnelClosed) => {
                                info!("Tunnel closed by the device");
                                break;
                            }
                            Err(e) => {
                                error!("Tunnel read failed: {e}");
                                break;
                            }
                        };
                        if let Err(e) = device.send(&packet).await {
                            error!("TUN write failed: {e}");
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("Device to TUN pump finished");
        });

        let device = self.device;
        let mut stop = shutdown;
        let mut buf = vec![0u8; self.mtu as usize + 4];
        let outbound = tokio::spawn(async move {
            loop {
                tokio::select! {
                    n = device.recv(&mut buf) => {
                        let n = match n {
                            Ok(n) => n,
                            Err(e) => {
                                error!("TUN read failed: {e}");
                                break;
                            }
                        };
                        if let Err(e) = tx.send_packet(&buf[..n]).await {
                            error!("Tunnel write failed: {e}");
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("TUN to device pump finished");
        });

        vec![inbound, outbound]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmask_prefixes() {
        assert_eq!(netmask_prefix("ffff:ffff:ffff:ffff::").unwrap(), 64);
        assert_eq!(netmask_prefix("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff").unwrap(), 128);
        assert!(matches!(
            netmask_prefix("ffff::ffff"),
            Err(LinkError::LinkFailure(_))
        ));
        assert!(matches!(netmask_prefix("nope"), Err(LinkError::LinkFailure(_))));
    }

    #[test]
    fn kernel_tun_can_be_logged_and_moved() {
        fn loggable<T: Debug + Send + Sync>() {}
        loggable::<KernelTun>();
    }
}
