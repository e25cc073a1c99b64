//! The CDTunnel parameter exchange
//!
//! The first thing on a fresh tunnel stream: the host asks for parameters with
//! its MTU, the device answers with the addresses of both ends.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::LinkError;

pub const MAGIC: &[u8] = b"CDTunnel";

#[derive(Serialize)]
struct HandshakeRequest {
    #[serde(rename = "type")]
    packet_type: &'static str,
    mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientParameters {
    #[serde(alias = "Mtu")]
    pub mtu: u16,
    #[serde(alias = "Address")]
    pub address: String,
    #[serde(alias = "Netmask")]
    pub netmask: String,
}

/// What the device hands back: our side of the link and where RSD listens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelParameters {
    #[serde(rename = "clientParameters", alias = "ClientParameters")]
    pub client_parameters: ClientParameters,
    #[serde(rename = "serverAddress", alias = "ServerAddress")]
    pub server_address: String,
    #[serde(rename = "serverRSDPort", alias = "ServerRSDPort")]
    pub server_rsd_port: u16,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
}

/// Frames `body` as `CDTunnel | len:u16 BE | body`
pub fn encode(body: &[u8]) -> Result<Vec<u8>, LinkError> {
    let len = u16::try_from(body.len())
        .map_err(|_| LinkError::Decode(format!("{} byte CDTunnel body", body.len())))?;
    let mut packet = Vec::with_capacity(MAGIC.len() + 2 + body.len());
    packet.extend_from_slice(MAGIC);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(body);
    Ok(packet)
}

/// Reads one framed body
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, LinkError> {
    let mut header = [0u8; 10];
    stream.read_exact(&mut header).await?;
    if &header[..MAGIC.len()] != MAGIC {
        warn!("Bad CDTunnel magic: {:02x?}", &header[..MAGIC.len()]);
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&header[..8]);
        return Err(LinkError::BadMagic(u64::from_be_bytes(magic)));
    }
    let len = u16::from_be_bytes([header[8], header[9]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Sends `clientHandshakeRequest` announcing `mtu`
pub async fn send_request<W: AsyncWrite + Unpin>(writer: &mut W, mtu: u32) -> Result<(), LinkError> {
    let req = serde_json::to_vec(&HandshakeRequest {
        packet_type: "clientHandshakeRequest",
        mtu,
    })?;
    writer.write_all(&encode(&req)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the device's answer to [`send_request`]
pub async fn read_parameters<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<TunnelParameters, LinkError> {
    let body = read_frame(reader).await?;
    let params: TunnelParameters = serde_json::from_slice(&body).map_err(|e| {
        LinkError::Decode(format!(
            "tunnel parameters {}: {e}",
            String::from_utf8_lossy(&body)
        ))
    })?;
    debug!("Tunnel parameters: {params:?}");
    Ok(params)
}

/// Both halves of the exchange on one stream
pub async fn exchange<S>(stream: &mut S, mtu: u32) -> Result<TunnelParameters, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_request(stream, mtu).await?;
    read_parameters(stream).await
}
