//! TCP connection state for the userspace stack.
//!
//! The adapter owns the sending half of the link and the state of every
//! connection, keyed by host port. It never reads on its own: the
//! [`AdapterHandle`](super::AdapterHandle) task feeds it inbound packets and
//! asks it to flush and retransmit.
//!
//! The stack is deliberately small. It keeps one peer address, accepts
//! segments only in order and leaves reordering to the device, which
//! retransmits whatever the duplicate ACKs tell it was missed. Host data is
//! kept until acknowledged and resent after [`RETRANSMIT_TIMEOUT`].

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::Ipv6Addr,
    path::Path,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use crate::{LinkError, tunnel::link::BoxedPacketWrite};

use super::{
    PcapWriter,
    packets::{IPV6_HEADER_LEN, Ipv6Packet, ProtocolNumber, TCP_HEADER_LEN, TcpFlags, TcpPacket},
};

pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RETRANSMITS: u32 = 8;
/// How long a connection we closed waits for the device's FIN
const CLOSE_LINGER: Duration = Duration::from_secs(5);
const WINDOW: u16 = u16::MAX - 1;
const HOP_LIMIT: u8 = 64;
/// Headers plus a little payload
pub const MIN_MTU: u16 = (IPV6_HEADER_LEN + TCP_HEADER_LEN) as u16 + 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// SYN sent, waiting for the SYN-ACK
    Connecting,
    Connected,
    /// Our FIN is out, waiting for the device's
    Closing,
    /// Both sides finished, kept until the stream drains it
    Closed,
    /// `UnexpectedEof` when the device finished the connection cleanly
    Error(io::ErrorKind),
}

#[derive(Debug)]
struct Segment {
    seq: u32,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct ConnectionState {
    peer_port: u16,
    /// Next sequence number to send
    seq: u32,
    /// Next sequence number expected from the device
    ack: u32,
    status: ConnectionStatus,
    peer_window: u16,

    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    unacked: VecDeque<Segment>,

    /// When the oldest unacknowledged thing (SYN, data or FIN) was last sent
    last_sent: Instant,
    retransmits: u32,
}

impl ConnectionState {
    fn unacked_bytes(&self) -> usize {
        self.unacked.iter().map(|s| s.payload.len()).sum()
    }

    /// Drops every segment `ack` covers
    fn acknowledge(&mut self, ack: u32) {
        let mut progressed = false;
        while let Some(front) = self.unacked.front() {
            let end = front.seq.wrapping_add(front.payload.len() as u32);
            if (ack.wrapping_sub(end) as i32) < 0 {
                break;
            }
            self.unacked.pop_front();
            progressed = true;
        }
        if progressed {
            self.retransmits = 0;
            self.last_sent = Instant::now();
        }
    }
}

pub(crate) fn link_io_error(e: LinkError) -> io::Error {
    match e {
        LinkError::Socket(e) => e,
        LinkError::TunnelClosed => io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed"),
        e => io::Error::other(e),
    }
}

#[derive(Debug)]
pub struct Adapter {
    link: BoxedPacketWrite,
    host_ip: Ipv6Addr,
    peer_ip: Ipv6Addr,
    /// Largest payload that fits one packet on the link
    mss: usize,
    states: HashMap<u16, ConnectionState>,
    pcap: Option<PcapWriter>,
}

impl Adapter {
    /// A stack at `host_ip` that can reach `peer_ip` over `link`, sized for
    /// the tunnel's `mtu`. Every packet sent fits in `mtu`.
    pub fn new(
        link: BoxedPacketWrite,
        host_ip: Ipv6Addr,
        peer_ip: Ipv6Addr,
        mtu: u16,
    ) -> Result<Self, LinkError> {
        if mtu < MIN_MTU {
            return Err(LinkError::TunnelSetupFailed(format!(
                "tunnel MTU {mtu} is below the minimum of {MIN_MTU}"
            )));
        }
        Ok(Self {
            link,
            host_ip,
            peer_ip,
            mss: mtu as usize - IPV6_HEADER_LEN - TCP_HEADER_LEN,
            states: HashMap::new(),
            pcap: None,
        })
    }

    pub fn host_ip(&self) -> Ipv6Addr {
        self.host_ip
    }

    pub fn peer_ip(&self) -> Ipv6Addr {
        self.peer_ip
    }

    /// Logs every packet from now on to a PCAP file at `path`
    pub async fn pcap(&mut self, path: impl AsRef<Path>) -> Result<(), io::Error> {
        self.pcap = Some(PcapWriter::create(path).await?);
        Ok(())
    }

    async fn log_packet(&mut self, packet: &[u8]) {
        if let Some(pcap) = &mut self.pcap {
            if let Err(e) = pcap.write_packet(packet).await {
                warn!("Stopping packet capture: {e}");
                self.pcap = None;
            }
        }
    }

    async fn transmit(&mut self, packet: Vec<u8>) -> Result<(), io::Error> {
        self.log_packet(&packet).await;
        self.link
            .send_packet(&packet)
            .await
            .map_err(link_io_error)
    }

    fn build(
        &self,
        host_port: u16,
        state: &ConnectionState,
        seq: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Vec<u8> {
        let tcp = TcpPacket::create(
            self.host_ip,
            self.peer_ip,
            host_port,
            state.peer_port,
            seq,
            state.ack,
            flags,
            WINDOW,
            payload,
        );
        Ipv6Packet::create(self.host_ip, self.peer_ip, ProtocolNumber::Tcp, HOP_LIMIT, &tcp)
    }

    fn free_port(&self) -> u16 {
        loop {
            let port: u16 = rand::random();
            if port >= 1024 && !self.states.contains_key(&port) {
                return port;
            }
        }
    }

    /// Sends a SYN to `port` and returns the host port of the new
    /// connection. It is usable once its status turns `Connected`.
    pub async fn connect(&mut self, port: u16) -> Result<u16, io::Error> {
        let host_port = self.free_port();
        let isn: u32 = rand::random();
        let state = ConnectionState {
            peer_port: port,
            seq: isn.wrapping_add(1),
            ack: 0,
            status: ConnectionStatus::Connecting,
            peer_window: 0,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            unacked: VecDeque::new(),
            last_sent: Instant::now(),
            retransmits: 0,
        };
        let syn = self.build(
            host_port,
            &state,
            isn,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            &[],
        );
        self.states.insert(host_port, state);
        debug!("Connecting host port {host_port} to device port {port}");
        self.transmit(syn).await?;
        Ok(host_port)
    }

    /// Feeds one packet read from the link
    pub async fn handle_packet(&mut self, packet: &[u8]) -> Result<(), io::Error> {
        self.log_packet(packet).await;

        let ip = match Ipv6Packet::parse(packet) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropping unparsable packet: {e}");
                return Ok(());
            }
        };
        if ip.next_header != ProtocolNumber::Tcp as u8 || ip.source != self.peer_ip {
            trace!("Ignoring {ip:?}");
            return Ok(());
        }
        let tcp = match TcpPacket::parse(&ip.payload) {
            Ok(t) => t,
            Err(e) => {
                debug!("Dropping bad TCP segment: {e}");
                return Ok(());
            }
        };
        trace!("TCP packet: {tcp:?}");

        let host_port = tcp.destination_port;
        let Some(state) = self.states.get_mut(&host_port) else {
            trace!("No connection on host port {host_port}");
            return Ok(());
        };
        if state.peer_port != tcp.source_port {
            return Ok(());
        }

        if tcp.flags.rst {
            debug!("Device reset connection on host port {host_port}");
            state.status = ConnectionStatus::Error(match state.status {
                ConnectionStatus::Connecting => io::ErrorKind::ConnectionRefused,
                _ => io::ErrorKind::ConnectionReset,
            });
            state.unacked.clear();
            state.write_buffer.clear();
            return Ok(());
        }

        let ack_flags = TcpFlags {
            ack: true,
            ..Default::default()
        };
        match state.status {
            ConnectionStatus::Connecting => {
                if !(tcp.flags.syn && tcp.flags.ack) || tcp.acknowledgment_number != state.seq {
                    debug!("Expected a SYN-ACK on host port {host_port}, got {tcp:?}");
                    return Ok(());
                }
                state.ack = tcp.sequence_number.wrapping_add(1);
                state.peer_window = tcp.window_size;
                state.status = ConnectionStatus::Connected;
                state.retransmits = 0;
                debug!("Host port {host_port} connected");
                let seq = state.seq;
                let state = &self.states[&host_port];
                let packet = self.build(host_port, state, seq, ack_flags, &[]);
                return self.transmit(packet).await;
            }
            ConnectionStatus::Error(_) | ConnectionStatus::Closed => return Ok(()),
            ConnectionStatus::Connected | ConnectionStatus::Closing => {}
        }

        if tcp.flags.syn {
            // Our ACK of the SYN-ACK got lost
            let seq = state.seq;
            let state = &self.states[&host_port];
            let packet = self.build(host_port, state, seq, ack_flags, &[]);
            return self.transmit(packet).await;
        }

        if tcp.flags.ack {
            state.acknowledge(tcp.acknowledgment_number);
            state.peer_window = tcp.window_size;
        }

        let mut reply = false;
        if !tcp.payload.is_empty() {
            if tcp.sequence_number == state.ack {
                state.read_buffer.extend_from_slice(&tcp.payload);
                state.ack = state.ack.wrapping_add(tcp.payload.len() as u32);
            } else {
                trace!(
                    "Out of order segment {} on host port {host_port}, expecting {}",
                    tcp.sequence_number, state.ack
                );
            }
            reply = true;
        }

        if tcp.flags.fin
            && tcp
                .sequence_number
                .wrapping_add(tcp.payload.len() as u32)
                == state.ack
        {
            state.ack = state.ack.wrapping_add(1);
            reply = true;
            match state.status {
                ConnectionStatus::Closing => {
                    debug!("Host port {host_port} closed");
                    state.status = ConnectionStatus::Closed;
                }
                _ => {
                    debug!("Device finished host port {host_port}");
                    state.status = ConnectionStatus::Error(io::ErrorKind::UnexpectedEof);
                }
            }
        }

        if reply {
            let seq = state.seq;
            let state = &self.states[&host_port];
            let packet = self.build(host_port, state, seq, ack_flags, &[]);
            self.transmit(packet).await?;
        }
        Ok(())
    }

    /// Queues bytes for the connection; they go out on the next flush
    pub fn queue_send(&mut self, payload: &[u8], host_port: u16) -> Result<(), io::Error> {
        let state = self
            .states
            .get_mut(&host_port)
            .ok_or(io::ErrorKind::NotConnected)?;
        match state.status {
            ConnectionStatus::Connected => {
                state.write_buffer.extend_from_slice(payload);
                Ok(())
            }
            ConnectionStatus::Error(kind) => Err(kind.into()),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Sends queued bytes, as much as the device's window allows
    pub async fn write_buffer_flush(&mut self) -> Result<(), io::Error> {
        let mut outbox = Vec::new();
        let ports: Vec<u16> = self.states.keys().copied().collect();
        for host_port in ports {
            let Some(state) = self.states.get_mut(&host_port) else {
                continue;
            };
            if state.status != ConnectionStatus::Connected || state.write_buffer.is_empty() {
                continue;
            }

            let in_flight = state.unacked_bytes();
            let mut room = (state.peer_window as usize).saturating_sub(in_flight);
            if room == 0 && in_flight == 0 {
                // A closed window still gets probed one segment at a time
                room = self.mss;
            }
            let take = room.min(state.write_buffer.len());
            if take == 0 {
                continue;
            }
            let data: Vec<u8> = state.write_buffer.drain(..take).collect();
            if state.unacked.is_empty() {
                state.last_sent = Instant::now();
            }
            for chunk in data.chunks(self.mss) {
                let seq = state.seq;
                state.seq = state.seq.wrapping_add(chunk.len() as u32);
                state.unacked.push_back(Segment {
                    seq,
                    payload: chunk.to_vec(),
                });
            }

            let state = &self.states[&host_port];
            let flags = TcpFlags {
                psh: true,
                ack: true,
                ..Default::default()
            };
            let queued = state.unacked.len() - data.len().div_ceil(self.mss);
            for segment in state.unacked.iter().skip(queued) {
                outbox.push(self.build(host_port, state, segment.seq, flags, &segment.payload));
            }
            trace!("Flushing {take} bytes on host port {host_port}");
        }

        for packet in outbox {
            self.transmit(packet).await?;
        }
        Ok(())
    }

    /// Resends whatever has waited longer than [`RETRANSMIT_TIMEOUT`] and
    /// gives up on connections that stopped answering
    pub async fn retransmit(&mut self) -> Result<(), io::Error> {
        let now = Instant::now();
        let mut outbox = Vec::new();
        let mut expired = Vec::new();

        for (&host_port, state) in self.states.iter_mut() {
            let waiting = match state.status {
                ConnectionStatus::Connecting => true,
                ConnectionStatus::Connected => !state.unacked.is_empty(),
                ConnectionStatus::Closing => {
                    if now.duration_since(state.last_sent) > CLOSE_LINGER {
                        expired.push(host_port);
                    }
                    false
                }
                ConnectionStatus::Error(_) | ConnectionStatus::Closed => false,
            };
            if !waiting || now.duration_since(state.last_sent) < RETRANSMIT_TIMEOUT {
                continue;
            }
            if state.retransmits >= MAX_RETRANSMITS {
                warn!("Host port {host_port} timed out");
                state.status = ConnectionStatus::Error(io::ErrorKind::TimedOut);
                state.unacked.clear();
                continue;
            }
            state.retransmits += 1;
            state.last_sent = now;
            outbox.push(host_port);
        }

        for host_port in expired {
            debug!("Device never finished host port {host_port}");
            self.states.remove(&host_port);
        }

        let mut packets = Vec::new();
        for host_port in outbox {
            let state = &self.states[&host_port];
            if state.status == ConnectionStatus::Connecting {
                debug!("Resending SYN on host port {host_port}");
                let syn = TcpFlags {
                    syn: true,
                    ..Default::default()
                };
                packets.push(self.build(host_port, state, state.seq.wrapping_sub(1), syn, &[]));
                continue;
            }
            let flags = TcpFlags {
                psh: true,
                ack: true,
                ..Default::default()
            };
            debug!(
                "Resending {} segments on host port {host_port}",
                state.unacked.len()
            );
            for segment in &state.unacked {
                packets.push(self.build(host_port, state, segment.seq, flags, &segment.payload));
            }
        }
        for packet in packets {
            self.transmit(packet).await?;
        }
        Ok(())
    }

    /// Closes the connection on `host_port`. Queued bytes are sent first.
    pub async fn close(&mut self, host_port: u16) -> Result<(), io::Error> {
        let Some(status) = self.states.get(&host_port).map(|s| s.status) else {
            return Ok(());
        };
        match status {
            ConnectionStatus::Connected => {
                self.write_buffer_flush().await?;
            }
            ConnectionStatus::Error(io::ErrorKind::UnexpectedEof) => {}
            ConnectionStatus::Closing => return Ok(()),
            _ => {
                self.states.remove(&host_port);
                return Ok(());
            }
        }

        let Some(state) = self.states.get_mut(&host_port) else {
            return Ok(());
        };
        let seq = state.seq;
        state.seq = state.seq.wrapping_add(1);
        state.write_buffer.clear();
        state.last_sent = Instant::now();
        let device_done = status != ConnectionStatus::Connected;
        if !device_done {
            state.status = ConnectionStatus::Closing;
        }

        let state = &self.states[&host_port];
        let fin = self.build(
            host_port,
            state,
            seq,
            TcpFlags {
                fin: true,
                ack: true,
                ..Default::default()
            },
            &[],
        );
        if device_done {
            self.states.remove(&host_port);
        }
        debug!("Closing host port {host_port}");
        self.transmit(fin).await
    }

    /// Forgets a connection without telling the device
    pub fn forget(&mut self, host_port: u16) {
        self.states.remove(&host_port);
    }

    /// Takes everything received on the connection so far
    pub fn uncache_all(&mut self, host_port: u16) -> Result<Vec<u8>, io::Error> {
        match self.states.get_mut(&host_port) {
            Some(state) => Ok(std::mem::take(&mut state.read_buffer)),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub fn get_status(&self, host_port: u16) -> Result<ConnectionStatus, io::Error> {
        self.states
            .get(&host_port)
            .map(|s| s.status)
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}
