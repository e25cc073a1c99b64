//! The 16 byte usbmuxd header and the plist it frames

use tracing::warn;

use crate::LinkError;

pub const HEADER_LEN: usize = 16;

/// A usbmuxd frame: `(length, version, message, tag)` little-endian, then an
/// XML plist. `length` counts the header too.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

/// Just the header, read before the body length is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl RawPacket {
    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            size: 0,
            version,
            message,
            tag,
            plist,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, LinkError> {
        let body = crate::util::plist_to_xml_bytes(&plist::Value::Dictionary(self.plist.clone()))?;
        let size = (HEADER_LEN + body.len()) as u32;

        let mut res = Vec::with_capacity(size as usize);
        res.extend_from_slice(&size.to_le_bytes());
        res.extend_from_slice(&self.version.to_le_bytes());
        res.extend_from_slice(&self.message.to_le_bytes());
        res.extend_from_slice(&self.tag.to_le_bytes());
        res.extend_from_slice(&body);
        Ok(res)
    }
}

impl PacketHeader {
    /// Parses and sanity checks a header
    pub fn parse(buf: &[u8; HEADER_LEN], version: u32, message: u32) -> Result<Self, LinkError> {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let header = Self {
            size: word(0),
            version: word(4),
            message: word(8),
            tag: word(12),
        };
        if (header.size as usize) < HEADER_LEN {
            warn!("usbmuxd header claims {} bytes", header.size);
            return Err(LinkError::MuxProtocol(format!(
                "frame length {} is shorter than its header",
                header.size
            )));
        }
        if header.version != version || header.message != message {
            return Err(LinkError::MuxProtocol(format!(
                "unexpected version {} / message {}",
                header.version, header.message
            )));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_LEN
    }
}
