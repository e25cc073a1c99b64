//! The QUIC tunnel of remote pairing
//!
//! IPv6 packets ride in QUIC datagrams. The one bidirectional stream carries
//! the CDTunnel exchange and is then kept open for the life of the tunnel.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use quinn::{
    ClientConfig, Connection, ConnectionError, Endpoint, RecvStream, SendDatagramError,
    SendStream, TransportConfig, VarInt, crypto::rustls::QuicClientConfig,
};
use rsa::{RsaPrivateKey, pkcs8::EncodePrivateKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info, warn};
use x509_cert::der::Encode;

use crate::{
    LinkError, ca, ensure_crypto_provider,
    sni::NoServerNameVerification,
    tunnel::{
        cdtunnel::{self, TunnelParameters},
        link::{BoxedPacketRead, BoxedPacketWrite, LinkFuture, PacketLink, PacketRead, PacketWrite},
    },
};

pub const ALPN: &[u8] = b"RemotePairingTunnelProtocol";
pub const QUIC_MTU: u32 = 1280;
pub const KEEP_ALIVE: Duration = Duration::from_secs(1);
/// Name the device never checks, the listener key was pinned already
const SERVER_NAME: &str = "device";

fn cert_error(e: impl std::fmt::Display) -> LinkError {
    LinkError::CertificateGeneration(e.to_string())
}

/// TLS 1.3 with a certificate minted from the listener key, ALPN set and
/// the device's certificate accepted as is
pub fn client_config(key: &RsaPrivateKey) -> Result<ClientConfig, LinkError> {
    ensure_crypto_provider();

    let cert = CertificateDer::from(ca::self_signed_sha256(key)?.to_der().map_err(cert_error)?);
    let key_der = key.to_pkcs8_der().map_err(cert_error)?;
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.as_bytes().to_vec()));

    let mut tls = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoServerNameVerification))
        .with_client_auth_cert(vec![cert], key_der)?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|e| LinkError::TunnelSetupFailed(format!("QUIC crypto config: {e}")))?;
    let mut config = ClientConfig::new(Arc::new(crypto));
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

fn connection_lost(e: ConnectionError) -> LinkError {
    match e {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed
        | ConnectionError::Reset
        | ConnectionError::TimedOut => {
            debug!("QUIC tunnel ended: {e}");
            LinkError::TunnelClosed
        }
        e => LinkError::QuicConnection(e),
    }
}

/// An established QUIC tunnel
#[derive(Debug)]
pub struct QuicTunnel {
    endpoint: Endpoint,
    connection: Connection,
    control: (SendStream, RecvStream),
    pub parameters: TunnelParameters,
}

impl QuicTunnel {
    /// Dials the device's tunnel listener at `addr` and runs the parameter
    /// exchange
    pub async fn connect(addr: SocketAddr, key: &RsaPrivateKey) -> Result<Self, LinkError> {
        let config = client_config(key)?;
        let bind: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let endpoint = Endpoint::client(bind)?;

        debug!("Dialing QUIC tunnel at {addr}");
        let connection = endpoint.connect_with(config, addr, SERVER_NAME)?.await?;

        // opens the datagram path before anything else
        connection
            .send_datagram(Bytes::from_static(&[0]))
            .map_err(|e| LinkError::TunnelSetupFailed(format!("opening datagram: {e}")))?;

        let (mut send, mut recv) = connection.open_bi().await?;
        cdtunnel::send_request(&mut send, QUIC_MTU).await?;
        let parameters = cdtunnel::read_parameters(&mut recv).await?;
        info!(
            "QUIC tunnel up, host {} device {}",
            parameters.client_parameters.address, parameters.server_address
        );

        Ok(Self {
            endpoint,
            connection,
            control: (send, recv),
            parameters,
        })
    }

    pub fn into_link(self) -> (QuicLink, TunnelParameters) {
        (
            QuicLink {
                endpoint: self.endpoint,
                connection: self.connection,
                control: self.control,
            },
            self.parameters,
        )
    }
}

/// One IPv6 packet per QUIC datagram
#[derive(Debug)]
pub struct QuicLink {
    endpoint: Endpoint,
    connection: Connection,
    control: (SendStream, RecvStream),
}

impl QuicLink {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

/// Keeps the endpoint and control stream alive as long as packets are read
#[derive(Debug)]
struct QuicReadHalf {
    connection: Connection,
    _endpoint: Endpoint,
    _control: (SendStream, RecvStream),
}

#[derive(Debug)]
struct QuicWriteHalf {
    connection: Connection,
}

impl PacketRead for QuicReadHalf {
    fn recv_packet(&mut self) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let datagram = self
                .connection
                .read_datagram()
                .await
                .map_err(connection_lost)?;
            Ok(datagram.to_vec())
        })
    }
}

impl PacketWrite for QuicWriteHalf {
    fn send_packet<'a>(&'a mut self, packet: &'a [u8]) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            match self
                .connection
                .send_datagram(Bytes::copy_from_slice(packet))
            {
                Ok(()) => Ok(()),
                Err(SendDatagramError::ConnectionLost(e)) => Err(connection_lost(e)),
                Err(SendDatagramError::TooLarge) => {
                    // what IP would do with it too
                    warn!("Dropping {} byte packet, too large for a datagram", packet.len());
                    Ok(())
                }
                Err(e) => Err(LinkError::TunnelSetupFailed(format!("QUIC datagrams: {e}"))),
            }
        })
    }
}

impl PacketLink for QuicLink {
    fn split(self: Box<Self>) -> (BoxedPacketRead, BoxedPacketWrite) {
        let QuicLink {
            endpoint,
            connection,
            control,
        } = *self;
        (
            Box::new(QuicReadHalf {
                connection: connection.clone(),
                _endpoint: endpoint,
                _control: control,
            }),
            Box::new(QuicWriteHalf { connection }),
        )
    }
}

/// Closes a tunnel connection with the no-error code
pub fn close(connection: &Connection) {
    connection.close(VarInt::from_u32(0), b"");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::cdtunnel::tests::PARAMETERS;
    use quinn::{ServerConfig, crypto::rustls::QuicServerConfig};

    fn device_endpoint() -> Endpoint {
        ensure_crypto_provider();
        let key = ca::generate_rsa_key().unwrap();
        let cert = CertificateDer::from(ca::self_signed_sha256(&key).unwrap().to_der().unwrap());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key.to_pkcs8_der().unwrap().as_bytes().to_vec(),
        ));
        let mut tls = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(vec![cert], key_der)
            .unwrap();
        tls.alpn_protocols = vec![ALPN.to_vec()];
        let config =
            ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(tls).unwrap()));
        Endpoint::server(config, (Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    #[tokio::test]
    async fn quic_tunnel_exchange_and_datagrams() {
        let device = device_endpoint();
        let addr = device.local_addr().unwrap();

        let device_task = tokio::spawn(async move {
            let conn = device.accept().await.unwrap().await.unwrap();
            assert_eq!(conn.read_datagram().await.unwrap().as_ref(), &[0]);

            let (mut send, mut recv) = conn.accept_bi().await.unwrap();
            let req: serde_json::Value =
                serde_json::from_slice(&cdtunnel::read_frame(&mut recv).await.unwrap()).unwrap();
            assert_eq!(req["mtu"], 1280);
            send.write_all(&cdtunnel::encode(PARAMETERS.as_bytes()).unwrap())
                .await
                .unwrap();

            let packet = conn.read_datagram().await.unwrap();
            conn.send_datagram(packet).unwrap();
            // hold the connection until the host closes it
            let _ = conn.closed().await;
        });

        let key = ca::generate_rsa_key().unwrap();
        let tunnel = QuicTunnel::connect(addr, &key).await.unwrap();
        assert_eq!(tunnel.parameters.server_rsd_port, 58783);

        let (link, _) = tunnel.into_link();
        let connection = link.connection().clone();
        let (mut rx, mut tx) = Box::new(link).split();
        tx.send_packet(b"\x60echo").await.unwrap();
        assert_eq!(rx.recv_packet().await.unwrap(), b"\x60echo");

        close(&connection);
        assert!(matches!(rx.recv_packet().await, Err(LinkError::TunnelClosed)));
        device_task.await.unwrap();
    }
}
