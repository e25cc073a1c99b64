//! OPACK, the compact encoding of the pair-setup device info
//!
//! Only the shapes that appear in device info are supported: dictionaries,
//! arrays, strings and data up to 255 bytes, booleans and unsigned integers.

use plist::Value;

use crate::LinkError;

const TERMINATOR: u8 = 0x03;
const INLINE_LEN_MAX: usize = 0x1f;

pub fn plist_to_opack(value: &Value) -> Result<Vec<u8>, LinkError> {
    let mut buf = Vec::new();
    encode(value, &mut buf)?;
    Ok(buf)
}

fn encode(node: &Value, buf: &mut Vec<u8>) -> Result<(), LinkError> {
    match node {
        Value::Dictionary(dict) => {
            let count = dict.len();
            buf.push(if count < 15 { 0xe0 + count as u8 } else { 0xef });
            for (key, val) in dict {
                encode_bytes(key.as_bytes(), 0x40, 0x61, buf)?;
                encode(val, buf)?;
            }
            if count >= 15 {
                buf.push(TERMINATOR);
            }
        }
        Value::Array(array) => {
            let count = array.len();
            buf.push(if count < 15 { 0xd0 + count as u8 } else { 0xdf });
            for val in array {
                encode(val, buf)?;
            }
            if count >= 15 {
                buf.push(TERMINATOR);
            }
        }
        Value::Boolean(b) => buf.push(if *b { 0x01 } else { 0x02 }),
        Value::Integer(i) => {
            let v = i
                .as_unsigned()
                .ok_or_else(|| LinkError::Decode("negative integers have no opack form".into()))?;
            if v <= 0x27 {
                buf.push(0x08 + v as u8);
            } else if v <= u8::MAX as u64 {
                buf.extend_from_slice(&[0x30, v as u8]);
            } else if v <= u32::MAX as u64 {
                buf.push(0x32);
                buf.extend_from_slice(&(v as u32).to_le_bytes());
            } else {
                buf.push(0x33);
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        Value::String(s) => encode_bytes(s.as_bytes(), 0x40, 0x61, buf)?,
        Value::Data(d) => encode_bytes(d, 0x70, 0x91, buf)?,
        _ => return Err(LinkError::Decode("value has no opack form".into())),
    }
    Ok(())
}

/// `inline | len` below 32 bytes, `sized, len:u8` up to 255
fn encode_bytes(bytes: &[u8], inline: u8, sized: u8, buf: &mut Vec<u8>) -> Result<(), LinkError> {
    let len = bytes.len();
    if len <= INLINE_LEN_MAX {
        buf.push(inline + len as u8);
    } else if len <= u8::MAX as usize {
        buf.extend_from_slice(&[sized, len as u8]);
    } else {
        return Err(LinkError::Decode(format!(
            "{len} bytes is too long for opack"
        )));
    }
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Decodes one opack value, used for the info the device sends back
pub fn opack_to_plist(bytes: &[u8]) -> Result<Value, LinkError> {
    let mut pos = 0;
    let v = decode(bytes, &mut pos)?;
    if pos != bytes.len() {
        return Err(LinkError::Decode("trailing bytes after opack value".into()));
    }
    Ok(v)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], LinkError> {
    let end = *pos + n;
    if end > bytes.len() {
        return Err(LinkError::IncompleteFrame {
            needed: end,
            got: bytes.len(),
        });
    }
    let s = &bytes[*pos..end];
    *pos = end;
    Ok(s)
}

fn decode(bytes: &[u8], pos: &mut usize) -> Result<Value, LinkError> {
    let tag = take(bytes, pos, 1)?[0];
    Ok(match tag {
        0x01 => Value::Boolean(true),
        0x02 => Value::Boolean(false),
        0x08..=0x2f => Value::Integer(((tag - 0x08) as u64).into()),
        0x30 => Value::Integer((take(bytes, pos, 1)?[0] as u64).into()),
        0x32 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(take(bytes, pos, 4)?);
            Value::Integer((u32::from_le_bytes(b) as u64).into())
        }
        0x33 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(take(bytes, pos, 8)?);
            Value::Integer(u64::from_le_bytes(b).into())
        }
        0x40..=0x60 | 0x61 | 0x62 => {
            let raw = decode_sized(tag, 0x40, bytes, pos)?;
            Value::String(
                String::from_utf8(raw)
                    .map_err(|_| LinkError::Decode("opack string is not utf8".into()))?,
            )
        }
        0x70..=0x90 | 0x91 | 0x92 => Value::Data(decode_sized(tag, 0x70, bytes, pos)?),
        0xd0..=0xdf => {
            let mut items = Vec::new();
            if tag == 0xdf {
                while bytes.get(*pos) != Some(&TERMINATOR) {
                    items.push(decode(bytes, pos)?);
                }
                *pos += 1;
            } else {
                for _ in 0..(tag - 0xd0) {
                    items.push(decode(bytes, pos)?);
                }
            }
            Value::Array(items)
        }
        0xe0..=0xef => {
            let mut dict = plist::Dictionary::new();
            let mut entry = |pos: &mut usize| -> Result<(), LinkError> {
                let key = match decode(bytes, pos)? {
                    Value::String(k) => k,
                    _ => return Err(LinkError::Decode("opack key is not a string".into())),
                };
                dict.insert(key, decode(bytes, pos)?);
                Ok(())
            };
            if tag == 0xef {
                while bytes.get(*pos) != Some(&TERMINATOR) {
                    entry(pos)?;
                }
                *pos += 1;
            } else {
                for _ in 0..(tag - 0xe0) {
                    entry(pos)?;
                }
            }
            Value::Dictionary(dict)
        }
        other => return Err(LinkError::Decode(format!("unsupported opack tag {other:#x}"))),
    })
}

fn decode_sized(tag: u8, inline: u8, bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>, LinkError> {
    let len = match tag - inline {
        l @ 0..=0x20 => l as usize,
        0x21 => take(bytes, pos, 1)?[0] as usize,
        _ => {
            let b = take(bytes, pos, 2)?;
            u16::from_le_bytes([b[0], b[1]]) as usize
        }
    };
    Ok(take(bytes, pos, len)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_info() -> Value {
        let mut d = plist::Dictionary::new();
        d.insert(
            "accountID".into(),
            "BB559933-AA88-4499-BB88-442266EECCFF".into(),
        );
        d.insert(
            "mac".into(),
            Value::Data(vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
        );
        d.insert("name".into(), "host-name".into());
        Value::Dictionary(d)
    }

    #[test]
    fn device_info_round_trips() {
        let bytes = plist_to_opack(&device_info()).unwrap();

        // dict of three, then "accountID" as an inline string
        assert_eq!(bytes[0], 0xe3);
        assert_eq!(bytes[1], 0x40 + 9);
        assert_eq!(&bytes[2..11], b"accountID");
        // 36 byte value takes the u8 length form
        assert_eq!(&bytes[11..13], &[0x61, 36]);
        // "mac" then six bytes of data
        assert_eq!(&bytes[49..53], &[0x43, b'm', b'a', b'c']);
        assert_eq!(bytes[53], 0x76);

        assert_eq!(opack_to_plist(&bytes).unwrap(), device_info());
    }

    #[test]
    fn length_classes() {
        let mut buf = Vec::new();
        encode(&Value::String("a".repeat(15)), &mut buf).unwrap();
        assert_eq!(buf[0], 0x4f);

        buf.clear();
        encode(&Value::String("a".repeat(20)), &mut buf).unwrap();
        assert_eq!(buf[0], 0x50 | (20 & 0xf));

        buf.clear();
        encode(&Value::Data(vec![0; 32]), &mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x91, 32]);

        assert!(encode(&Value::String("a".repeat(256)), &mut Vec::new()).is_err());
    }

    #[test]
    fn larger_dictionaries_are_terminated() {
        let mut d = plist::Dictionary::new();
        for i in 0..16u64 {
            d.insert(format!("k{i}"), Value::Integer(i.into()));
        }
        d.insert("flag".into(), Value::Boolean(true));
        let v = Value::Dictionary(d);
        let bytes = plist_to_opack(&v).unwrap();
        assert_eq!(bytes[0], 0xef);
        assert_eq!(*bytes.last().unwrap(), TERMINATOR);
        assert_eq!(opack_to_plist(&bytes).unwrap(), v);
    }
}
