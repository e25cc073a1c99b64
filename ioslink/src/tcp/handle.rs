// The adapter lives in one task and streams talk to it over channels. A
// stream can then be boxed into a `Connection`, moved between tasks and
// outlive whatever opened it, which a `&mut Adapter` borrow would not allow.

use std::{collections::HashMap, io, path::PathBuf, sync::Mutex, task::Poll, time::Duration};

use crossfire::{AsyncRx, MTx, Tx, mpsc, spsc, stream::AsyncStream};
use futures::{StreamExt, stream::FuturesUnordered};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::oneshot,
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::{
    Connection, LinkError,
    tcp::adapter::{Adapter, ConnectionStatus, RETRANSMIT_TIMEOUT},
    tunnel::link::BoxedPacketRead,
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

type StreamRx = AsyncRx<Result<Vec<u8>, io::Error>>;
type ConnectToPortRes = oneshot::Sender<Result<(u16, StreamRx), io::Error>>;

enum HandleMessage {
    /// Answered once the handshake finishes
    ConnectToPort {
        target: u16,
        res: ConnectToPortRes,
    },
    Close {
        host_port: u16,
    },
    Send {
        host_port: u16,
        data: Vec<u8>,
        res: oneshot::Sender<Result<(), io::Error>>,
    },
    Pcap {
        path: PathBuf,
        res: oneshot::Sender<Result<(), io::Error>>,
    },
}

fn adapter_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NetworkUnreachable, "adapter closed")
}

/// A cloneable handle to an [`Adapter`] running in its own task.
///
/// The task stops when the link fails or the last handle and stream are
/// dropped.
#[derive(Debug, Clone)]
pub struct AdapterHandle {
    sender: MTx<HandleMessage>,
}

/// Streams waiting on a connection and connections waiting on a handshake
#[derive(Default)]
struct Routes {
    streams: HashMap<u16, Tx<Result<Vec<u8>, io::Error>>>,
    connecting: HashMap<u16, ConnectToPortRes>,
}

impl Routes {
    /// Moves received bytes and state changes from the adapter to the streams
    async fn dispatch(&mut self, adapter: &mut Adapter) {
        let resolved: Vec<u16> = self
            .connecting
            .iter()
            .filter(|(hp, res)| {
                res.is_closed()
                    || !matches!(adapter.get_status(**hp), Ok(ConnectionStatus::Connecting))
            })
            .map(|(hp, _)| *hp)
            .collect();
        for hp in resolved {
            let Some(res) = self.connecting.remove(&hp) else {
                continue;
            };
            match adapter.get_status(hp) {
                Ok(ConnectionStatus::Connected) => {
                    let (ptx, prx) = spsc::unbounded_async();
                    if res.send(Ok((hp, prx))).is_ok() {
                        self.streams.insert(hp, ptx);
                        continue;
                    }
                    // the caller gave up
                    adapter.close(hp).await.ok();
                }
                Ok(ConnectionStatus::Error(kind)) => {
                    res.send(Err(kind.into())).ok();
                    adapter.forget(hp);
                }
                Ok(_) => {
                    adapter.forget(hp);
                }
                Err(e) => {
                    res.send(Err(e)).ok();
                }
            }
        }

        let mut finished = Vec::new();
        for (&hp, tx) in &self.streams {
            match adapter.uncache_all(hp) {
                Ok(buf) if !buf.is_empty() => {
                    if tx.send(Ok(buf)).is_err() {
                        finished.push(hp);
                        continue;
                    }
                }
                Ok(_) => {}
                // state already gone, the stream sees EOF
                Err(_) => {
                    finished.push(hp);
                    continue;
                }
            }
            match adapter.get_status(hp) {
                Ok(ConnectionStatus::Error(io::ErrorKind::UnexpectedEof))
                | Ok(ConnectionStatus::Closed) => finished.push(hp),
                Ok(ConnectionStatus::Error(kind)) => {
                    tx.send(Err(kind.into())).ok();
                    finished.push(hp);
                }
                _ => {}
            }
        }
        for hp in finished {
            self.streams.remove(&hp);
            adapter.close(hp).await.ok();
        }
    }

    fn fail_all(&mut self, kind: io::ErrorKind) {
        for (_, tx) in self.streams.drain() {
            tx.send(Err(kind.into())).ok();
        }
        for (_, res) in self.connecting.drain() {
            res.send(Err(kind.into())).ok();
        }
    }
}

impl AdapterHandle {
    /// Starts the adapter task. Inbound packets are read from `link`.
    pub fn new(mut adapter: Adapter, mut link: BoxedPacketRead) -> Self {
        let (tx, rx) = mpsc::unbounded_async();
        let (packet_tx, mut packet_rx) = tokio::sync::mpsc::channel(64);

        let reader = tokio::spawn(async move {
            loop {
                let packet = link.recv_packet().await;
                let failed = packet.is_err();
                if packet_tx.send(packet).await.is_err() || failed {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut routes = Routes::default();
            let mut tick = tokio::time::interval(RETRANSMIT_TIMEOUT / 4);

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Ok(msg) = msg else {
                            break;
                        };
                        match msg {
                            HandleMessage::ConnectToPort { target, res } => {
                                match adapter.connect(target).await {
                                    Ok(hp) => {
                                        routes.connecting.insert(hp, res);
                                    }
                                    Err(e) => {
                                        res.send(Err(e)).ok();
                                    }
                                }
                            }
                            HandleMessage::Close { host_port } => {
                                // the stream keeps receiving until the device finishes
                                adapter.close(host_port).await.ok();
                            }
                            HandleMessage::Send { host_port, data, res } => {
                                let response = match adapter.queue_send(&data, host_port) {
                                    Ok(()) => adapter.write_buffer_flush().await,
                                    Err(e) => Err(e),
                                };
                                res.send(response).ok();
                            }
                            HandleMessage::Pcap { path, res } => {
                                res.send(adapter.pcap(path).await).ok();
                            }
                        }
                    }

                    packet = packet_rx.recv() => {
                        let packet: Result<Vec<u8>, LinkError> = match packet {
                            Some(p) => p,
                            None => Err(LinkError::TunnelClosed),
                        };
                        let handled = match packet {
                            Ok(p) => match adapter.handle_packet(&p).await {
                                Ok(()) => adapter.write_buffer_flush().await,
                                Err(e) => Err(e),
                            },
                            Err(e) => {
                                debug!("Packet link ended: {e}");
                                Err(crate::tcp::adapter::link_io_error(e))
                            }
                        };
                        if let Err(e) = handled {
                            warn!("Userspace stack stopping: {e}");
                            routes.fail_all(e.kind());
                            break;
                        }
                        routes.dispatch(&mut adapter).await;
                    }

                    _ = tick.tick() => {
                        if let Err(e) = adapter.retransmit().await {
                            warn!("Userspace stack stopping: {e}");
                            routes.fail_all(e.kind());
                            break;
                        }
                        routes.dispatch(&mut adapter).await;
                    }
                }
            }
            reader.abort();
            trace!("Adapter task finished");
        });

        Self { sender: tx }
    }

    /// Opens a TCP connection to `port` on the device
    pub async fn connect(&self, port: u16) -> Result<StreamHandle, io::Error> {
        let (res_tx, res_rx) = oneshot::channel();
        self.sender
            .send(HandleMessage::ConnectToPort {
                target: port,
                res: res_tx,
            })
            .map_err(|_| adapter_closed())?;

        match timeout(CONNECT_TIMEOUT, res_rx).await {
            Ok(Ok(r)) => {
                let (host_port, recv_channel) = r?;
                Ok(StreamHandle {
                    host_port,
                    recv_channel: Mutex::new(recv_channel.into_stream()),
                    send_channel: self.sender.clone(),
                    read_buffer: Vec::new(),
                    pending_writes: FuturesUnordered::new(),
                })
            }
            Ok(Err(_)) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter closed")),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("device port {port} did not answer"),
            )),
        }
    }

    /// Opens `port` and wraps it for plist or raw service traffic
    pub async fn connect_service(
        &self,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Connection, LinkError> {
        let stream = self.connect(port).await?;
        Ok(Connection::new(Box::new(stream), label))
    }

    /// Captures all tunnel traffic to a PCAP file
    pub async fn pcap(&self, path: impl Into<PathBuf>) -> Result<(), io::Error> {
        let (res_tx, res_rx) = oneshot::channel();
        self.sender
            .send(HandleMessage::Pcap {
                path: path.into(),
                res: res_tx,
            })
            .map_err(|_| adapter_closed())?;

        match res_rx.await {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter closed")),
        }
    }
}

/// One TCP connection through the userspace stack
#[derive(Debug)]
pub struct StreamHandle {
    host_port: u16,
    // only ever locked from poll_read, it makes the stream Sync
    recv_channel: Mutex<AsyncStream<Result<Vec<u8>, io::Error>>>,
    send_channel: MTx<HandleMessage>,

    read_buffer: Vec<u8>,
    pending_writes: FuturesUnordered<oneshot::Receiver<Result<(), io::Error>>>,
}

impl StreamHandle {
    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn close(&mut self) {
        let _ = self.send_channel.send(HandleMessage::Close {
            host_port: self.host_port,
        });
    }
}

impl AsyncRead for StreamHandle {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            let n = buf.remaining().min(self.read_buffer.len());
            buf.put_slice(&self.read_buffer[..n]);
            self.read_buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }

        let mut lock = self
            .recv_channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut rest = Vec::new();
        let res = match lock.poll_item(cx) {
            Poll::Pending => Poll::Pending,
            // the connection finished, nothing read means EOF
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Ready(Some(Ok(data))) => {
                let n = buf.remaining().min(data.len());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    rest = data[n..].to_vec();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(e)),
        };
        drop(lock);
        self.read_buffer.extend(rest);
        res
    }
}

impl AsyncWrite for StreamHandle {
    /// Hands the bytes to the adapter task. Errors surface on flush.
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        trace!("poll psh {}", buf.len());
        let (tx, rx) = oneshot::channel();
        self.send_channel
            .send(HandleMessage::Send {
                host_port: self.host_port,
                data: buf.to_vec(),
                res: tx,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))?;
        self.pending_writes.push(rx);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        while let Poll::Ready(maybe) = self.pending_writes.poll_next_unpin(cx) {
            match maybe {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => return Poll::Ready(Err(e)),
                Some(Err(_canceled)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "channel closed",
                    )));
                }
                None => break,
            }
        }
        if self.pending_writes.is_empty() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    /// Flushes, then sends our FIN. Reading continues until the device
    /// finishes too.
    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {
                self.close();
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tcp::{
        adapter::tests::{DEVICE, HOST, device_segment, link_pair, parse_host_segment},
        packets::TcpFlags,
    };
    use crate::tunnel::link::PacketLink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    fn ack_flags(psh: bool, fin: bool) -> TcpFlags {
        TcpFlags {
            ack: true,
            psh,
            fin,
            ..Default::default()
        }
    }

    /// Accepts one connection on port 7, upper-cases what it gets and
    /// finishes when the host does
    pub(crate) async fn upper_echo_device(mut rx: UnboundedReceiver<Vec<u8>>, tx: UnboundedSender<Vec<u8>>) {
        let mut seq = 1000u32;
        let mut ack = 0u32;
        while let Some(packet) = rx.recv().await {
            let s = parse_host_segment(&packet);
            if s.destination_port != 7 {
                tx.send(device_segment(
                    s.destination_port,
                    s.source_port,
                    0,
                    s.sequence_number.wrapping_add(1),
                    TcpFlags {
                        rst: true,
                        ack: true,
                        ..Default::default()
                    },
                    &[],
                ))
                .unwrap();
                continue;
            }
            if s.flags.syn {
                ack = s.sequence_number.wrapping_add(1);
                tx.send(device_segment(
                    7,
                    s.source_port,
                    seq,
                    ack,
                    TcpFlags {
                        syn: true,
                        ack: true,
                        ..Default::default()
                    },
                    &[],
                ))
                .unwrap();
                seq += 1;
                continue;
            }
            if !s.payload.is_empty() {
                ack = ack.wrapping_add(s.payload.len() as u32);
                let upper = s.payload.to_ascii_uppercase();
                tx.send(device_segment(7, s.source_port, seq, ack, ack_flags(true, false), &upper))
                    .unwrap();
                seq += upper.len() as u32;
            }
            if s.flags.fin {
                ack = ack.wrapping_add(1);
                tx.send(device_segment(7, s.source_port, seq, ack, ack_flags(false, true), &[]))
                    .unwrap();
                seq += 1;
            }
        }
    }

    #[tokio::test]
    async fn stream_round_trip_and_clean_close() {
        let (host, device) = link_pair();
        let (read, write) = Box::new(host).split();
        let handle = AdapterHandle::new(Adapter::new(write, HOST, DEVICE, 1280).unwrap(), read);
        tokio::spawn(upper_echo_device(device.rx, device.tx));

        let mut stream = handle.connect(7).await.unwrap();
        stream.write_all(b"hello tunnel").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO TUNNEL");

        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn refused_port_and_dead_link() {
        let (host, device) = link_pair();
        let (read, write) = Box::new(host).split();
        let handle = AdapterHandle::new(Adapter::new(write, HOST, DEVICE, 1280).unwrap(), read);
        let device_task = tokio::spawn(upper_echo_device(device.rx, device.tx));

        let err = handle.connect(8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let mut stream = handle.connect(7).await.unwrap();
        device_task.abort();
        let _ = device_task.await;

        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(handle.connect(7).await.is_err());
    }
}
