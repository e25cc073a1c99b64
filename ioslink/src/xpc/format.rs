//! RemoteXPC wire objects
//!
//! A message is a 24 byte little-endian wrapper (magic, flags, body length,
//! message id) around an optional object payload. Objects are tagged with a
//! 32 bit type and padded to four bytes.

use std::{
    io::{BufRead, Cursor, Read},
    ops::{BitOr, BitOrAssign},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::LinkError;

const MESSAGE_MAGIC: u32 = 0x29b00b92;
const OBJECT_MAGIC: u32 = 0x42133742;
const OBJECT_VERSION: u32 = 0x00000005;
const MESSAGE_HEADER_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XpcFlags(pub u32);

impl XpcFlags {
    pub const ALWAYS_SET: Self = Self(0x0000_0001);
    pub const DATA: Self = Self(0x0000_0100);
    pub const WANTING_REPLY: Self = Self(0x0001_0000);
    pub const INIT_HANDSHAKE: Self = Self(0x0040_0000);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for XpcFlags {
    type Output = XpcFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        XpcFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for XpcFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XpcType {
    Bool = 0x0000_2000,
    Int64 = 0x0000_3000,
    UInt64 = 0x0000_4000,
    Double = 0x0000_5000,
    Date = 0x0000_7000,
    Data = 0x0000_8000,
    String = 0x0000_9000,
    Uuid = 0x0000_a000,
    Array = 0x0000_e000,
    Dictionary = 0x0000_f000,
    FileTransfer = 0x0001_a000,
}

impl TryFrom<u32> for XpcType {
    type Error = LinkError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0000_2000 => Self::Bool,
            0x0000_3000 => Self::Int64,
            0x0000_4000 => Self::UInt64,
            0x0000_5000 => Self::Double,
            0x0000_7000 => Self::Date,
            0x0000_8000 => Self::Data,
            0x0000_9000 => Self::String,
            0x0000_a000 => Self::Uuid,
            0x0000_e000 => Self::Array,
            0x0000_f000 => Self::Dictionary,
            0x0001_a000 => Self::FileTransfer,
            _ => return Err(LinkError::UnknownXpcType(value)),
        })
    }
}

pub type Dictionary = IndexMap<String, XpcObject>;

#[derive(Debug, Clone, PartialEq)]
pub enum XpcObject {
    Bool(bool),
    Dictionary(Dictionary),
    Array(Vec<XpcObject>),
    Double(f64),
    Int64(i64),
    UInt64(u64),
    Date(SystemTime),
    String(String),
    Data(Vec<u8>),
    Uuid(uuid::Uuid),
    FileTransfer { msg_id: u64, data: Box<XpcObject> },
}

impl From<plist::Value> for XpcObject {
    fn from(value: plist::Value) -> Self {
        match value {
            plist::Value::Array(v) => XpcObject::Array(v.into_iter().map(Into::into).collect()),
            plist::Value::Dictionary(v) => {
                XpcObject::Dictionary(v.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            plist::Value::Boolean(v) => XpcObject::Bool(v),
            plist::Value::Data(v) => XpcObject::Data(v),
            plist::Value::Date(d) => XpcObject::Date(d.into()),
            plist::Value::Real(f) => XpcObject::Double(f),
            plist::Value::Integer(v) => match v.as_signed() {
                Some(i) => XpcObject::Int64(i),
                None => XpcObject::UInt64(v.as_unsigned().unwrap_or_default()),
            },
            plist::Value::String(v) => XpcObject::String(v),
            plist::Value::Uid(u) => XpcObject::UInt64(u.get()),
            _ => {
                warn!("Unsupported plist value in XPC conversion");
                XpcObject::Dictionary(Dictionary::new())
            }
        }
    }
}

impl From<Dictionary> for XpcObject {
    fn from(value: Dictionary) -> Self {
        XpcObject::Dictionary(value)
    }
}

impl XpcObject {
    pub fn to_plist(&self) -> plist::Value {
        match self {
            Self::Bool(v) => plist::Value::Boolean(*v),
            Self::Uuid(uuid) => plist::Value::String(uuid.to_string()),
            Self::Double(f) => plist::Value::Real(*f),
            Self::UInt64(v) => plist::Value::Integer((*v).into()),
            Self::Int64(v) => plist::Value::Integer((*v).into()),
            Self::Date(d) => plist::Value::Date((*d).into()),
            Self::String(v) => plist::Value::String(v.clone()),
            Self::Data(v) => plist::Value::Data(v.clone()),
            Self::Array(v) => plist::Value::Array(v.iter().map(|i| i.to_plist()).collect()),
            Self::Dictionary(v) => plist::Value::Dictionary(
                v.iter().map(|(k, v)| (k.clone(), v.to_plist())).collect(),
            ),
            Self::FileTransfer { msg_id, data } => {
                let mut d = plist::Dictionary::new();
                d.insert("msg_id".into(), (*msg_id).into());
                d.insert("data".into(), data.to_plist());
                plist::Value::Dictionary(d)
            }
        }
    }

    /// Encodes the object with its magic and version preamble
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OBJECT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&OBJECT_VERSION.to_le_bytes());
        self.encode_object(&mut buf);
        buf
    }

    fn encode_object(&self, buf: &mut Vec<u8>) {
        let put_type = |buf: &mut Vec<u8>, t: XpcType| buf.extend_from_slice(&(t as u32).to_le_bytes());
        match self {
            XpcObject::Bool(val) => {
                put_type(buf, XpcType::Bool);
                buf.extend_from_slice(&[*val as u8, 0, 0, 0]);
            }
            XpcObject::Dictionary(dict) => {
                put_type(buf, XpcType::Dictionary);
                let mut content = Vec::new();
                content.extend_from_slice(&(dict.len() as u32).to_le_bytes());
                for (k, v) in dict {
                    write_cstring(&mut content, k);
                    v.encode_object(&mut content);
                }
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(&content);
            }
            XpcObject::Array(items) => {
                put_type(buf, XpcType::Array);
                let mut content = Vec::new();
                content.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode_object(&mut content);
                }
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(&content);
            }
            XpcObject::Double(f) => {
                put_type(buf, XpcType::Double);
                buf.extend_from_slice(&f.to_le_bytes());
            }
            XpcObject::Int64(num) => {
                put_type(buf, XpcType::Int64);
                buf.extend_from_slice(&num.to_le_bytes());
            }
            XpcObject::UInt64(num) => {
                put_type(buf, XpcType::UInt64);
                buf.extend_from_slice(&num.to_le_bytes());
            }
            XpcObject::Date(date) => {
                put_type(buf, XpcType::Date);
                let nanos = date
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;
                buf.extend_from_slice(&nanos.to_le_bytes());
            }
            XpcObject::String(s) => {
                put_type(buf, XpcType::String);
                buf.extend_from_slice(&((s.len() + 1) as u32).to_le_bytes());
                write_cstring(buf, s);
            }
            XpcObject::Data(data) => {
                put_type(buf, XpcType::Data);
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
                buf.resize(buf.len() + padding(data.len()), 0);
            }
            XpcObject::Uuid(uuid) => {
                put_type(buf, XpcType::Uuid);
                buf.extend_from_slice(uuid.as_bytes());
            }
            XpcObject::FileTransfer { msg_id, data } => {
                put_type(buf, XpcType::FileTransfer);
                buf.extend_from_slice(&msg_id.to_le_bytes());
                data.encode_object(buf);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LinkError> {
        if buf.len() < 8 {
            return Err(LinkError::IncompleteFrame {
                needed: 8,
                got: buf.len(),
            });
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != OBJECT_MAGIC {
            warn!("Invalid magic for XPC object");
            return Err(LinkError::BadMagic(magic as u64));
        }
        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != OBJECT_VERSION {
            warn!("Unexpected XPC object version {version}");
            return Err(LinkError::UnexpectedXpcVersion);
        }
        Self::decode_object(&mut Cursor::new(&buf[8..])).map_err(|e| match e {
            LinkError::Socket(_) => LinkError::MalformedXpc,
            e => e,
        })
    }

    fn decode_object(cursor: &mut Cursor<&[u8]>) -> Result<Self, LinkError> {
        let xpc_type: XpcType = read_u32(cursor)?.try_into()?;
        Ok(match xpc_type {
            XpcType::Dictionary => {
                let _len = read_u32(cursor)?;
                let entries = read_u32(cursor)?;
                let mut ret = IndexMap::new();
                for _ in 0..entries {
                    let key = read_cstring(cursor)?;
                    ret.insert(key, Self::decode_object(cursor)?);
                }
                XpcObject::Dictionary(ret)
            }
            XpcType::Array => {
                let _len = read_u32(cursor)?;
                let entries = read_u32(cursor)?;
                let mut ret = Vec::new();
                for _ in 0..entries {
                    ret.push(Self::decode_object(cursor)?);
                }
                XpcObject::Array(ret)
            }
            XpcType::Double => XpcObject::Double(f64::from_le_bytes(read_8(cursor)?)),
            XpcType::Int64 => XpcObject::Int64(i64::from_le_bytes(read_8(cursor)?)),
            XpcType::UInt64 => XpcObject::UInt64(u64::from_le_bytes(read_8(cursor)?)),
            XpcType::Date => XpcObject::Date(
                UNIX_EPOCH + Duration::from_nanos(u64::from_le_bytes(read_8(cursor)?)),
            ),
            XpcType::String => {
                // The length counts the terminating NUL
                let _len = read_u32(cursor)?;
                XpcObject::String(read_cstring(cursor)?)
            }
            XpcType::Bool => {
                let mut b = [0u8; 4];
                cursor.read_exact(&mut b)?;
                XpcObject::Bool(b[0] != 0)
            }
            XpcType::Data => {
                let len = read_u32(cursor)? as usize;
                let mut data = vec![0; len];
                cursor.read_exact(&mut data)?;
                cursor.consume(padding(len));
                XpcObject::Data(data)
            }
            XpcType::Uuid => {
                let mut data = [0u8; 16];
                cursor.read_exact(&mut data)?;
                XpcObject::Uuid(uuid::Uuid::from_bytes(data))
            }
            XpcType::FileTransfer => {
                let msg_id = u64::from_le_bytes(read_8(cursor)?);
                XpcObject::FileTransfer {
                    msg_id,
                    data: Box::new(Self::decode_object(cursor)?),
                }
            }
        })
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            XpcObject::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Self>> {
        match self {
            XpcObject::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            XpcObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XpcObject::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            XpcObject::Data(d) => Some(d),
            _ => None,
        }
    }

    /// Integers, accepting the decimal strings some services use
    pub fn as_signed_integer(&self) -> Option<i64> {
        match self {
            XpcObject::String(s) => s.parse().ok(),
            XpcObject::Int64(v) => Some(*v),
            XpcObject::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_unsigned_integer(&self) -> Option<u64> {
        match self {
            XpcObject::String(s) => s.parse().ok(),
            XpcObject::UInt64(v) => Some(*v),
            XpcObject::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf.resize(buf.len() + padding(s.len() + 1), 0);
}

fn read_cstring(cursor: &mut Cursor<&[u8]>) -> Result<String, LinkError> {
    let mut raw = Vec::new();
    cursor.read_until(0, &mut raw)?;
    if raw.pop() != Some(0) {
        return Err(LinkError::InvalidCString);
    }
    let len = raw.len();
    let s = String::from_utf8(raw).map_err(|_| LinkError::InvalidCString)?;
    cursor.consume(padding(len + 1));
    Ok(s)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, LinkError> {
    let mut b = [0u8; 4];
    cursor.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_8(cursor: &mut Cursor<&[u8]>) -> Result<[u8; 8], LinkError> {
    let mut b = [0u8; 8];
    cursor.read_exact(&mut b)?;
    Ok(b)
}

/// One RemoteXPC message
#[derive(Debug, Clone, PartialEq)]
pub struct XpcMessage {
    pub flags: XpcFlags,
    pub message: Option<XpcObject>,
    pub message_id: u64,
}

impl XpcMessage {
    pub fn new(flags: XpcFlags, message: Option<XpcObject>, message_id: u64) -> Self {
        Self {
            flags,
            message,
            message_id,
        }
    }

    /// Decodes a complete message. A buffer shorter than the advertised body
    /// yields [`LinkError::IncompleteFrame`] so callers can read more.
    pub fn decode(data: &[u8]) -> Result<Self, LinkError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(LinkError::IncompleteFrame {
                needed: MESSAGE_HEADER_LEN,
                got: data.len(),
            });
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MESSAGE_MAGIC {
            warn!("XPC message magic is invalid");
            return Err(LinkError::MalformedXpc);
        }
        let flags = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let mut len = [0u8; 8];
        len.copy_from_slice(&data[8..16]);
        let body_len = u64::from_le_bytes(len) as usize;
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[16..24]);
        let message_id = u64::from_le_bytes(id);

        let needed = MESSAGE_HEADER_LEN + body_len;
        if data.len() < needed {
            return Err(LinkError::IncompleteFrame {
                needed,
                got: data.len(),
            });
        }

        let res = Self {
            flags: XpcFlags(flags),
            message: if body_len > 0 {
                Some(XpcObject::decode(&data[MESSAGE_HEADER_LEN..needed])?)
            } else {
                None
            },
            message_id,
        };
        debug!("Decoded XPC message {:?} id {message_id}", res.flags);
        Ok(res)
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.message.as_ref().map(|m| m.encode()).unwrap_or_default();
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + body.len());
        out.extend_from_slice(&MESSAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.flags.0.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services_message() -> XpcObject {
        let mut props = Dictionary::new();
        props.insert("UsesRemoteXPC".into(), XpcObject::Bool(true));
        props.insert(
            "Features".into(),
            XpcObject::Array(vec![XpcObject::String("com.apple.dt.profile".into())]),
        );
        props.insert("ServiceVersion".into(), XpcObject::Int64(1));
        let mut service = Dictionary::new();
        service.insert("Port".into(), XpcObject::String("49152".into()));
        service.insert("Entitlement".into(), XpcObject::String("AppleInternal".into()));
        service.insert("Properties".into(), XpcObject::Dictionary(props));
        let mut services = Dictionary::new();
        services.insert("com.apple.instruments.dtservicehub".into(), service.into());
        let mut root = Dictionary::new();
        root.insert("MessageType".into(), XpcObject::String("Handshake".into()));
        root.insert("Services".into(), services.into());
        root.insert("Key".into(), XpcObject::Data(vec![1, 2, 3, 4, 5]));
        root.insert("UUID".into(), XpcObject::Uuid(uuid::Uuid::from_bytes([7; 16])));
        root.insert("Big".into(), XpcObject::UInt64(u64::MAX));
        root.into()
    }

    #[test]
    fn message_survives_the_wire() {
        let msg = XpcMessage::new(
            XpcFlags::ALWAYS_SET | XpcFlags::DATA,
            Some(services_message()),
            7,
        );
        let bytes = msg.encode();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(XpcMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn short_buffer_asks_for_more() {
        let bytes = XpcMessage::new(XpcFlags::ALWAYS_SET, Some(services_message()), 1).encode();
        assert!(matches!(
            XpcMessage::decode(&bytes[..bytes.len() - 4]),
            Err(LinkError::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn empty_message_has_no_body() {
        let bytes = XpcMessage::new(XpcFlags(0x201), None, 0).encode();
        assert_eq!(bytes.len(), 24);
        let decoded = XpcMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.flags, XpcFlags(0x201));
        assert!(decoded.message.is_none());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = XpcObject::Bool(true).encode();
        bytes[8..12].copy_from_slice(&0x1234u32.to_le_bytes());
        assert!(matches!(
            XpcObject::decode(&bytes),
            Err(LinkError::UnknownXpcType(0x1234))
        ));
    }

    #[test]
    fn converts_to_plist() {
        let v = services_message().to_plist();
        let port = v
            .as_dictionary()
            .and_then(|d| d.get("Services"))
            .and_then(|s| s.as_dictionary())
            .and_then(|s| s.get("com.apple.instruments.dtservicehub"))
            .and_then(|s| s.as_dictionary())
            .and_then(|s| s.get("Port"))
            .and_then(|p| p.as_string());
        assert_eq!(port, Some("49152"));
    }
}
