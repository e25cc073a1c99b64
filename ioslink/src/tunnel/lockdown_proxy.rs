//! CoreDeviceProxy: a tunnel handed out by Lockdown on iOS 17.4 and later,
//! without any remote pairing

use tracing::info;

use crate::{
    DeviceSocket, LinkError, lockdown, provider::DeviceProvider,
    tunnel::{cdtunnel, cdtunnel::TunnelParameters, link::StreamLink},
};

pub const SERVICE_NAME: &str = "com.apple.internal.devicecompute.CoreDeviceProxy";
pub const DEFAULT_MTU: u32 = 16000;

#[derive(Debug)]
pub struct CoreDeviceProxy {
    socket: DeviceSocket,
    pub parameters: TunnelParameters,
}

impl CoreDeviceProxy {
    /// Starts the service through Lockdown and asks it for tunnel parameters
    pub async fn connect(provider: &dyn DeviceProvider) -> Result<Self, LinkError> {
        let connection = lockdown::start_service(provider, SERVICE_NAME).await?;
        let proxy = Self::new(connection.into_inner()?).await?;
        info!(
            "CoreDeviceProxy for {} assigned {}",
            provider.udid(),
            proxy.parameters.client_parameters.address
        );
        Ok(proxy)
    }

    /// Runs the parameter exchange on an already started service stream
    pub async fn new(mut socket: DeviceSocket) -> Result<Self, LinkError> {
        let parameters = cdtunnel::exchange(&mut socket, DEFAULT_MTU).await?;
        Ok(Self { socket, parameters })
    }

    /// The rest of the stream carries IPv6 packets back to back
    pub fn into_link(self) -> (StreamLink<DeviceSocket>, TunnelParameters) {
        (StreamLink::new(self.socket), self.parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::packets::{Ipv6Packet, ProtocolNumber};
    use crate::tunnel::{cdtunnel::tests::serve_handshake, link::PacketLink};
    use std::net::Ipv6Addr;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn parameters_then_packets() {
        let (host, mut device) = tokio::io::duplex(1 << 16);
        let device_task = tokio::spawn(async move {
            let mtu = serve_handshake(&mut device).await;
            let packet = Ipv6Packet::create(
                "fd35:d15d:9fc2::1".parse().unwrap(),
                "fd35:d15d:9fc2::2".parse().unwrap(),
                ProtocolNumber::Tcp,
                64,
                &[0u8; 20],
            );
            device.write_all(&packet).await.unwrap();
            (mtu, packet, device)
        });

        let proxy = CoreDeviceProxy::new(Box::new(host)).await.unwrap();
        assert_eq!(proxy.parameters.server_rsd_port, 58783);
        let (link, params) = proxy.into_link();
        assert_eq!(
            params.client_parameters.address.parse::<Ipv6Addr>().unwrap(),
            "fd35:d15d:9fc2::2".parse::<Ipv6Addr>().unwrap()
        );

        let (mut rx, _tx) = Box::new(link).split();
        let (mtu, packet, _device) = device_task.await.unwrap();
        assert_eq!(mtu, DEFAULT_MTU as u64);
        assert_eq!(rx.recv_packet().await.unwrap(), packet);
    }
}
