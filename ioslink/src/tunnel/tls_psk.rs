//! The TCP tunnel of remote pairing: TLS 1.2 with the pairing session key as
//! the pre-shared key, then the CDTunnel exchange and IPv6 packets on the
//! stream. rustls has no PSK cipher suites, so this one goes through openssl.

use std::{net::SocketAddr, pin::Pin};

use openssl::{
    error::ErrorStack,
    ssl::{Ssl, SslConnector, SslMethod, SslVerifyMode, SslVersion},
};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::{debug, info};

use crate::{
    LinkError,
    tunnel::{
        cdtunnel::{self, TunnelParameters},
        link::StreamLink,
    },
};

pub const TCP_MTU: u32 = 16000;

fn handshake_error(e: impl std::fmt::Display) -> LinkError {
    LinkError::HandshakeFailure(format!("TLS-PSK: {e}"))
}

/// A client session that only offers PSK suites keyed with `psk`
pub fn client_ssl(psk: &[u8]) -> Result<Ssl, LinkError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(handshake_error)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(handshake_error)?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .map_err(handshake_error)?;
    builder.set_cipher_list("PSK").map_err(handshake_error)?;
    builder.set_verify(SslVerifyMode::NONE);

    let psk = psk.to_vec();
    builder.set_psk_client_callback(move |_ssl, _hint, identity, out| {
        if identity.is_empty() || out.len() < psk.len() {
            return Err(ErrorStack::get());
        }
        // empty identity, NUL terminated
        identity[0] = 0;
        out[..psk.len()].copy_from_slice(&psk);
        Ok(psk.len())
    });

    builder
        .build()
        .configure()
        .map_err(handshake_error)?
        .use_server_name_indication(false)
        .verify_hostname(false)
        .into_ssl("device")
        .map_err(handshake_error)
}

/// Dials the device's TCP tunnel listener and runs the parameter exchange
pub async fn connect(
    addr: SocketAddr,
    psk: &[u8],
) -> Result<(StreamLink<SslStream<TcpStream>>, TunnelParameters), LinkError> {
    debug!("Dialing TLS-PSK tunnel at {addr}");
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;

    let mut stream = SslStream::new(client_ssl(psk)?, tcp).map_err(handshake_error)?;
    Pin::new(&mut stream)
        .connect()
        .await
        .map_err(handshake_error)?;

    let parameters = cdtunnel::exchange(&mut stream, TCP_MTU).await?;
    info!(
        "TCP tunnel up, host {} device {}",
        parameters.client_parameters.address, parameters.server_address
    );
    Ok((StreamLink::new(stream), parameters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::cdtunnel::tests::serve_handshake;
    use openssl::ssl::SslContext;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn psk_handshake_then_parameters() {
        const KEY: [u8; 32] = [0x42; 32];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device_task = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ctx = SslContext::builder(SslMethod::tls_server()).unwrap();
            ctx.set_cipher_list("PSK").unwrap();
            ctx.set_psk_server_callback(|_ssl, _identity, out| {
                out[..KEY.len()].copy_from_slice(&KEY);
                Ok(KEY.len())
            });
            let ssl = Ssl::new(&ctx.build()).unwrap();
            let mut stream = SslStream::new(ssl, tcp).unwrap();
            Pin::new(&mut stream).accept().await.unwrap();
            serve_handshake(&mut stream).await
        });

        let (_link, params) = connect(addr, &KEY).await.unwrap();
        assert_eq!(params.server_rsd_port, 58783);
        assert_eq!(device_task.await.unwrap(), TCP_MTU as u64);
    }
}
