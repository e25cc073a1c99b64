//! Carriers of the tunnel's IPv6 packets
//!
//! QUIC moves one packet per datagram. The lockdown proxy and the TLS-PSK
//! tunnel move packets back to back on a byte stream, delimited only by the
//! payload length in each IPv6 header.

use std::{fmt::Debug, pin::Pin};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{trace, warn};

use crate::{
    LinkError,
    tcp::packets::{IPV6_HEADER_LEN, ipv6_packet_len},
};

pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

/// The receiving half of a packet link
pub trait PacketRead: Send + Debug {
    /// Next whole IP packet, [`LinkError::TunnelClosed`] once the peer is gone
    fn recv_packet(&mut self) -> LinkFuture<'_, Vec<u8>>;
}

/// The sending half of a packet link
pub trait PacketWrite: Send + Debug {
    fn send_packet<'a>(&'a mut self, packet: &'a [u8]) -> LinkFuture<'a, ()>;
}

pub type BoxedPacketRead = Box<dyn PacketRead>;
pub type BoxedPacketWrite = Box<dyn PacketWrite>;

/// Something IPv6 packets can be exchanged over, split so both directions
/// can be pumped by separate tasks
pub trait PacketLink: Send + Debug {
    fn split(self: Box<Self>) -> (BoxedPacketRead, BoxedPacketWrite);
}

fn closed_on_eof(e: std::io::Error) -> LinkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        LinkError::TunnelClosed
    } else {
        LinkError::Socket(e)
    }
}

/// IPv6 packets back to back on a byte stream
#[derive(Debug)]
pub struct StreamLink<S> {
    stream: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static> StreamLink<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Reads one IPv6 packet off a stream
pub async fn read_framed_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, LinkError> {
    let mut header = [0u8; IPV6_HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(closed_on_eof)?;
    let Some(len) = ipv6_packet_len(&header) else {
        warn!("Stream tunnel lost framing: {:02x?}", &header[..8]);
        return Err(LinkError::Decode(format!(
            "IP version {} on a stream tunnel",
            header[0] >> 4
        )));
    };

    let mut packet = vec![0u8; len];
    packet[..IPV6_HEADER_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut packet[IPV6_HEADER_LEN..])
        .await
        .map_err(closed_on_eof)?;
    trace!("Read {len} byte packet from stream");
    Ok(packet)
}

#[derive(Debug)]
struct StreamReadHalf<S>(ReadHalf<S>);

#[derive(Debug)]
struct StreamWriteHalf<S>(WriteHalf<S>);

impl<S: AsyncRead + AsyncWrite + Send + Debug> PacketRead for StreamReadHalf<S> {
    fn recv_packet(&mut self) -> LinkFuture<'_, Vec<u8>> {
        Box::pin(read_framed_packet(&mut self.0))
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Debug> PacketWrite for StreamWriteHalf<S> {
    fn send_packet<'a>(&'a mut self, packet: &'a [u8]) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            self.0.write_all(packet).await.map_err(closed_on_eof)?;
            self.0.flush().await?;
            Ok(())
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static> PacketLink for StreamLink<S> {
    fn split(self: Box<Self>) -> (BoxedPacketRead, BoxedPacketWrite) {
        let (r, w) = tokio::io::split(self.stream);
        (Box::new(StreamReadHalf(r)), Box::new(StreamWriteHalf(w)))
    }
}
