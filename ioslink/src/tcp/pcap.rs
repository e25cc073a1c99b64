//! libpcap capture of tunnel traffic

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::io::AsyncWriteExt;
use tracing::trace;

/// Raw IP, no link-layer header
/// https://www.tcpdump.org/linktypes.html
pub const LINKTYPE_RAW: u32 = 101;

/// Writes every packet the stack sees to a libpcap file
#[derive(Debug)]
pub struct PcapWriter {
    file: tokio::fs::File,
}

impl PcapWriter {
    /// Creates `path` and writes the global header
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let mut file = tokio::fs::File::create(path).await?;

        // https://wiki.wireshark.org/Development/LibpcapFileFormat
        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&0xa1b2c3d4_u32.to_le_bytes()); // magic
        header.extend_from_slice(&2_u16.to_le_bytes()); // major version
        header.extend_from_slice(&4_u16.to_le_bytes()); // minor
        header.extend_from_slice(&0_i32.to_le_bytes()); // timezone
        header.extend_from_slice(&0_u32.to_le_bytes()); // accuracy
        header.extend_from_slice(&(u16::MAX as u32).to_le_bytes()); // snaplen
        header.extend_from_slice(&LINKTYPE_RAW.to_le_bytes());
        file.write_all(&header).await?;

        Ok(Self { file })
    }

    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), std::io::Error> {
        trace!("Logging {} byte packet", packet.len());
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let mut record = Vec::with_capacity(16 + packet.len());
        record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
        record.extend_from_slice(&now.subsec_micros().to_le_bytes());
        record.extend_from_slice(&(packet.len() as u32).to_le_bytes());
        record.extend_from_slice(&(packet.len() as u32).to_le_bytes());
        record.extend_from_slice(packet);
        self.file.write_all(&record).await?;
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pcap_records_raw_ip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.pcap");
        let mut pcap = PcapWriter::create(&path).await.unwrap();
        pcap.write_packet(&[0x60, 0, 0, 0]).await.unwrap();
        drop(pcap);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &0xa1b2c3d4_u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &101_u32.to_le_bytes());
        // record header: ts_sec, ts_usec, incl_len, orig_len
        assert_eq!(&bytes[32..36], &4_u32.to_le_bytes());
        assert_eq!(&bytes[36..40], &4_u32.to_le_bytes());
        assert_eq!(&bytes[40..], &[0x60, 0, 0, 0]);
    }
}
