// Just enough IPv6 and TCP to talk to the device's stack through the tunnel

use std::net::Ipv6Addr;

use tracing::debug;

use crate::LinkError;

pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolNumber {
    Tcp = 6,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub next_header: u8,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub payload: Vec<u8>,
}

/// Length of the whole packet whose fixed header starts `header`, or `None`
/// if it is not an IPv6 header
pub fn ipv6_packet_len(header: &[u8; IPV6_HEADER_LEN]) -> Option<usize> {
    if header[0] >> 4 != 6 {
        return None;
    }
    Some(IPV6_HEADER_LEN + u16::from_be_bytes([header[4], header[5]]) as usize)
}

impl Ipv6Packet {
    pub fn parse(packet: &[u8]) -> Result<Self, LinkError> {
        if packet.len() < IPV6_HEADER_LEN {
            return Err(LinkError::IncompleteFrame {
                needed: IPV6_HEADER_LEN,
                got: packet.len(),
            });
        }
        let version = packet[0] >> 4;
        if version != 6 {
            debug!("Dropping a version {version} IP packet");
            return Err(LinkError::Decode(format!("IP version {version}")));
        }

        let payload_length = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        let total = IPV6_HEADER_LEN + payload_length;
        if packet.len() < total {
            return Err(LinkError::IncompleteFrame {
                needed: total,
                got: packet.len(),
            });
        }

        let mut source = [0u8; 16];
        source.copy_from_slice(&packet[8..24]);
        let mut destination = [0u8; 16];
        destination.copy_from_slice(&packet[24..40]);

        Ok(Self {
            traffic_class: ((packet[0] & 0x0F) << 4) | (packet[1] >> 4),
            flow_label: ((packet[1] as u32 & 0x0F) << 16)
                | ((packet[2] as u32) << 8)
                | packet[3] as u32,
            next_header: packet[6],
            hop_limit: packet[7],
            source: Ipv6Addr::from(source),
            destination: Ipv6Addr::from(destination),
            payload: packet[IPV6_HEADER_LEN..total].to_vec(),
        })
    }

    pub fn create(
        source: Ipv6Addr,
        destination: Ipv6Addr,
        next_header: ProtocolNumber,
        hop_limit: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut packet = Vec::with_capacity(IPV6_HEADER_LEN + payload.len());
        // version 6, traffic class and flow label zero
        packet.extend_from_slice(&[6 << 4, 0, 0, 0]);
        packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        packet.push(next_header as u8);
        packet.push(hop_limit);
        packet.extend_from_slice(&source.octets());
        packet.extend_from_slice(&destination.octets());
        packet.extend_from_slice(payload);
        packet
    }
}

impl std::fmt::Debug for Ipv6Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipv6Packet")
            .field("next_header", &self.next_header)
            .field("hop_limit", &self.hop_limit)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("payload len", &self.payload.len())
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags {
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl TcpFlags {
    pub fn from_byte(flags: u8) -> Self {
        Self {
            urg: (flags & 0b0010_0000) != 0,
            ack: (flags & 0b0001_0000) != 0,
            psh: (flags & 0b0000_1000) != 0,
            rst: (flags & 0b0000_0100) != 0,
            syn: (flags & 0b0000_0010) != 0,
            fin: (flags & 0b0000_0001) != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        for (set, bit) in [
            (self.urg, 0b0010_0000),
            (self.ack, 0b0001_0000),
            (self.psh, 0b0000_1000),
            (self.rst, 0b0000_0100),
            (self.syn, 0b0000_0010),
            (self.fin, 0b0000_0001),
        ] {
            if set {
                flags |= bit;
            }
        }
        flags
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TcpPacket {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    pub fn parse(packet: &[u8]) -> Result<Self, LinkError> {
        if packet.len() < TCP_HEADER_LEN {
            debug!("Got a truncated TCP header");
            return Err(LinkError::IncompleteFrame {
                needed: TCP_HEADER_LEN,
                got: packet.len(),
            });
        }

        // Options are skipped, the device never needs an answer to them
        let data_offset = ((packet[12] >> 4) as usize * 4).max(TCP_HEADER_LEN);
        let payload = packet.get(data_offset..).unwrap_or_default().to_vec();

        Ok(Self {
            source_port: u16::from_be_bytes([packet[0], packet[1]]),
            destination_port: u16::from_be_bytes([packet[2], packet[3]]),
            sequence_number: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            acknowledgment_number: u32::from_be_bytes([
                packet[8], packet[9], packet[10], packet[11],
            ]),
            flags: TcpFlags::from_byte(packet[13]),
            window_size: u16::from_be_bytes([packet[14], packet[15]]),
            checksum: u16::from_be_bytes([packet[16], packet[17]]),
            payload,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        source_ip: Ipv6Addr,
        destination_ip: Ipv6Addr,
        source_port: u16,
        destination_port: u16,
        sequence_number: u32,
        acknowledgment_number: u32,
        flags: TcpFlags,
        window_size: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let data_offset = (TCP_HEADER_LEN / 4) as u8;
        let mut packet = Vec::with_capacity(TCP_HEADER_LEN + payload.len());

        packet.extend_from_slice(&source_port.to_be_bytes());
        packet.extend_from_slice(&destination_port.to_be_bytes());
        packet.extend_from_slice(&sequence_number.to_be_bytes());
        packet.extend_from_slice(&acknowledgment_number.to_be_bytes());
        packet.push(data_offset << 4);
        packet.push(flags.to_byte());
        packet.extend_from_slice(&window_size.to_be_bytes());
        packet.extend_from_slice(&[0, 0]); // checksum
        packet.extend_from_slice(&[0, 0]); // urgent pointer
        packet.extend_from_slice(payload);

        let checksum = !pseudo_header_sum(&source_ip, &destination_ip, &packet);
        packet[16..18].copy_from_slice(&checksum.to_be_bytes());
        packet
    }

    /// Whether `segment` carries a valid checksum for the address pair
    pub fn checksum_valid(source_ip: &Ipv6Addr, destination_ip: &Ipv6Addr, segment: &[u8]) -> bool {
        pseudo_header_sum(source_ip, destination_ip, segment) == 0xFFFF
    }
}

/// One's complement sum of the IPv6 pseudo header and `segment`
fn pseudo_header_sum(source: &Ipv6Addr, destination: &Ipv6Addr, segment: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in source.octets().chunks(2).chain(destination.octets().chunks(2)) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    let len = segment.len() as u32;
    sum += (len >> 16) + (len & 0xFFFF);
    sum += ProtocolNumber::Tcp as u32;

    for chunk in segment.chunks(2) {
        let word = match chunk {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => u16::from_be_bytes([*a, 0]),
            _ => 0,
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

impl std::fmt::Debug for TcpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPacket")
            .field("source_port", &self.source_port)
            .field("destination_port", &self.destination_port)
            .field("sequence_number", &self.sequence_number)
            .field("acknowledgment_number", &self.acknowledgment_number)
            .field("flags", &self.flags)
            .field("window_size", &self.window_size)
            .field("payload len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: Ipv6Addr = Ipv6Addr::new(0xfd12, 0x3456, 0x789a, 0, 0, 0, 0, 1);
    const DEVICE: Ipv6Addr = Ipv6Addr::new(0xfd12, 0x3456, 0x789a, 0, 0, 0, 0, 2);

    #[test]
    fn tcp_in_ipv6() {
        let flags = TcpFlags {
            psh: true,
            ack: true,
            ..Default::default()
        };
        let segment = TcpPacket::create(HOST, DEVICE, 1234, 58783, 420, 6969, flags, 5555, b"hello");
        assert!(TcpPacket::checksum_valid(&HOST, &DEVICE, &segment));
        assert!(!TcpPacket::checksum_valid(&DEVICE, &DEVICE, &segment));

        let ip = Ipv6Packet::create(HOST, DEVICE, ProtocolNumber::Tcp, 64, &segment);
        let mut header = [0u8; IPV6_HEADER_LEN];
        header.copy_from_slice(&ip[..IPV6_HEADER_LEN]);
        assert_eq!(ipv6_packet_len(&header), Some(ip.len()));

        let parsed = Ipv6Packet::parse(&ip).unwrap();
        assert_eq!(parsed.source, HOST);
        assert_eq!(parsed.destination, DEVICE);
        assert_eq!(parsed.next_header, 6);
        assert_eq!(parsed.hop_limit, 64);

        let tcp = TcpPacket::parse(&parsed.payload).unwrap();
        assert_eq!(tcp.source_port, 1234);
        assert_eq!(tcp.destination_port, 58783);
        assert_eq!(tcp.sequence_number, 420);
        assert_eq!(tcp.acknowledgment_number, 6969);
        assert_eq!(tcp.flags, flags);
        assert_eq!(tcp.window_size, 5555);
        assert_eq!(tcp.payload, b"hello");
    }

    #[test]
    fn odd_length_segments_checksum() {
        let segment = TcpPacket::create(HOST, DEVICE, 1, 2, 3, 4, TcpFlags::default(), 0, b"abc");
        assert!(TcpPacket::checksum_valid(&HOST, &DEVICE, &segment));
    }

    #[test]
    fn truncated_and_foreign_packets() {
        let ip = Ipv6Packet::create(HOST, DEVICE, ProtocolNumber::Tcp, 64, &[0; 30]);
        assert!(matches!(
            Ipv6Packet::parse(&ip[..50]),
            Err(LinkError::IncompleteFrame { needed: 70, got: 50 })
        ));

        let mut v4 = ip.clone();
        v4[0] = 0x45;
        assert!(matches!(Ipv6Packet::parse(&v4), Err(LinkError::Decode(_))));
        let mut header = [0u8; IPV6_HEADER_LEN];
        header.copy_from_slice(&v4[..IPV6_HEADER_LEN]);
        assert_eq!(ipv6_packet_len(&header), None);
    }

    #[test]
    fn flags_byte() {
        let all = TcpFlags {
            urg: true,
            ack: true,
            psh: true,
            rst: true,
            syn: true,
            fin: true,
        };
        assert_eq!(all.to_byte(), 0x3F);
        assert_eq!(TcpFlags::from_byte(0x12), TcpFlags {
            syn: true,
            ack: true,
            ..Default::default()
        });
    }
}
