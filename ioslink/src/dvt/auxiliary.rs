//! The auxiliary block of a DTX message
//!
//! Method arguments travel here rather than in the payload. The block is a
//! 16-byte header followed by `(key, value)` entries whose keys are always
//! the null marker, so in practice it is an ordered argument list.

use plist::Value;

use crate::LinkError;

const TYPE_NULL: u32 = 0x0a;
const TYPE_STRING: u32 = 0x01;
const TYPE_BYTES: u32 = 0x02;
const TYPE_U32: u32 = 0x03;
const TYPE_I64: u32 = 0x06;

/// Buffer size hint written in the aux header, devices ignore it
const BUFFER_SIZE: u32 = 0x1f0;
pub const AUX_HEADER_LEN: usize = 16;

/// One typed argument
#[derive(Clone, PartialEq)]
pub enum AuxValue {
    String(String),
    /// Raw bytes, usually an NSKeyedArchiver object
    Bytes(Vec<u8>),
    U32(u32),
    I64(i64),
}

impl AuxValue {
    /// Archives `v` with NSKeyedArchiver
    pub fn archived(v: impl Into<Value>) -> Result<Self, LinkError> {
        Ok(Self::Bytes(archive(v.into())?))
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            Self::U32(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Decodes an archived argument
    pub fn unarchive(&self) -> Result<Value, LinkError> {
        match self {
            Self::Bytes(b) => Ok(ns_keyed_archive::decode::from_bytes(b)?),
            other => Err(LinkError::Decode(format!("{other:?} is not an archive"))),
        }
    }
}

impl std::fmt::Debug for AuxValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxValue::String(s) => write!(f, "String({s:?})"),
            AuxValue::Bytes(b) => write!(
                f,
                "Bytes(len={}, first_bytes={:?})",
                b.len(),
                &b[..b.len().min(10)]
            ),
            AuxValue::U32(n) => write!(f, "U32({n})"),
            AuxValue::I64(n) => write!(f, "I64({n})"),
        }
    }
}

pub(crate) fn archive(v: Value) -> Result<Vec<u8>, LinkError> {
    ns_keyed_archive::encode::encode_to_bytes(v)
        .map_err(|e| LinkError::Decode(format!("archiving failed: {e:?}")))
}

/// Encodes `values` as an aux block with its header. Empty lists encode to
/// nothing at all.
pub fn encode(values: &[AuxValue]) -> Vec<u8> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut entries = Vec::new();
    for v in values {
        entries.extend_from_slice(&TYPE_NULL.to_le_bytes());
        match v {
            AuxValue::String(s) => {
                entries.extend_from_slice(&TYPE_STRING.to_le_bytes());
                entries.extend_from_slice(&(s.len() as u32).to_le_bytes());
                entries.extend_from_slice(s.as_bytes());
            }
            AuxValue::Bytes(b) => {
                entries.extend_from_slice(&TYPE_BYTES.to_le_bytes());
                entries.extend_from_slice(&(b.len() as u32).to_le_bytes());
                entries.extend_from_slice(b);
            }
            AuxValue::U32(n) => {
                entries.extend_from_slice(&TYPE_U32.to_le_bytes());
                entries.extend_from_slice(&n.to_le_bytes());
            }
            AuxValue::I64(n) => {
                entries.extend_from_slice(&TYPE_I64.to_le_bytes());
                entries.extend_from_slice(&n.to_le_bytes());
            }
        }
    }

    let mut res = Vec::with_capacity(AUX_HEADER_LEN + entries.len());
    res.extend_from_slice(&BUFFER_SIZE.to_le_bytes());
    res.extend_from_slice(&0u32.to_le_bytes());
    res.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    res.extend_from_slice(&0u32.to_le_bytes());
    res.extend_from_slice(&entries);
    res
}

fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Result<&'a [u8], LinkError> {
    if bytes.len() < n {
        return Err(LinkError::Decode(format!(
            "aux entry needs {n} bytes, {} left",
            bytes.len()
        )));
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

fn take_u32(bytes: &mut &[u8]) -> Result<u32, LinkError> {
    let b = take(bytes, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decodes an aux block, header included, into its ordered values
pub fn decode(block: &[u8]) -> Result<Vec<AuxValue>, LinkError> {
    if block.len() < AUX_HEADER_LEN {
        return Err(LinkError::Decode(format!(
            "aux block of {} bytes has no header",
            block.len()
        )));
    }
    let size = u32::from_le_bytes([block[8], block[9], block[10], block[11]]) as usize;
    let mut bytes = &block[AUX_HEADER_LEN..];
    if bytes.len() < size {
        return Err(LinkError::Decode(format!(
            "aux header claims {size} bytes, block has {}",
            bytes.len()
        )));
    }
    bytes = &bytes[..size];

    let mut values = Vec::new();
    while !bytes.is_empty() {
        let ty = take_u32(&mut bytes)?;
        match ty {
            TYPE_NULL => {}
            TYPE_STRING => {
                let len = take_u32(&mut bytes)? as usize;
                let s = take(&mut bytes, len)?;
                values.push(AuxValue::String(String::from_utf8(s.to_vec())?));
            }
            TYPE_BYTES => {
                let len = take_u32(&mut bytes)? as usize;
                values.push(AuxValue::Bytes(take(&mut bytes, len)?.to_vec()));
            }
            TYPE_U32 => values.push(AuxValue::U32(take_u32(&mut bytes)?)),
            TYPE_I64 => {
                let b = take(&mut bytes, 8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                values.push(AuxValue::I64(i64::from_le_bytes(buf)));
            }
            other => return Err(LinkError::UnknownAuxType(other)),
        }
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_keep_their_order() {
        let args = vec![
            AuxValue::U32(7),
            AuxValue::String("identifier".into()),
            AuxValue::I64(-3),
            AuxValue::Bytes(vec![1, 2, 3]),
        ];
        let block = encode(&args);
        assert_eq!(&block[..4], &BUFFER_SIZE.to_le_bytes());
        assert_eq!(
            u32::from_le_bytes([block[8], block[9], block[10], block[11]]) as usize,
            block.len() - AUX_HEADER_LEN
        );
        let decoded = decode(&block).unwrap();
        assert_eq!(decoded, args);
        assert_eq!(decoded[0].as_u32(), Some(7));
        assert_eq!(decoded[1].as_str(), Some("identifier"));
        assert_eq!(decoded[2].as_i64(), Some(-3));
        assert_eq!(decoded[3].as_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn empty_lists_have_no_block() {
        assert!(encode(&[]).is_empty());
    }

    #[test]
    fn unknown_types_are_rejected() {
        let mut block = Vec::new();
        block.extend_from_slice(&BUFFER_SIZE.to_le_bytes());
        block.extend_from_slice(&0u32.to_le_bytes());
        block.extend_from_slice(&8u32.to_le_bytes());
        block.extend_from_slice(&0u32.to_le_bytes());
        block.extend_from_slice(&TYPE_NULL.to_le_bytes());
        block.extend_from_slice(&0x09u32.to_le_bytes());
        assert!(matches!(decode(&block), Err(LinkError::UnknownAuxType(9))));
    }

    #[test]
    fn truncated_entries_are_decode_errors() {
        let mut block = encode(&[AuxValue::String("abcdef".into())]);
        // shrink the string but keep the declared length
        let claimed = block.len() - AUX_HEADER_LEN - 2;
        block.truncate(block.len() - 2);
        block[8..12].copy_from_slice(&(claimed as u32).to_le_bytes());
        assert!(matches!(decode(&block), Err(LinkError::Decode(_))));
    }

    #[test]
    fn archived_arguments_unarchive() {
        let v = AuxValue::archived("com.apple.instruments.server.services.deviceinfo").unwrap();
        assert_eq!(
            v.unarchive().unwrap(),
            Value::String("com.apple.instruments.server.services.deviceinfo".into())
        );
        assert!(AuxValue::U32(1).unarchive().is_err());
    }
}
