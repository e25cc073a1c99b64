//! DTX message format
//!
//! ```text
//! +---------------------+
//! |   MessageHeader     | 32 bytes
//! +---------------------+
//! |   PayloadHeader     | 16 bytes
//! +---------------------+
//! |   Aux block         | optional, see [`super::auxiliary`]
//! +---------------------+
//! |   Payload           | NSKeyedArchive, or raw bytes
//! +---------------------+
//! ```
//!
//! Messages whose encoding does not fit in 64 KiB are fragmented. The first
//! fragment is a bare header carrying the total length; every following
//! fragment is a header plus up to 64 KiB minus 32 bytes of the payload. All
//! fragments share the message identifier.

use std::collections::HashMap;

use plist::Value;
use tracing::warn;

use crate::{
    LinkError,
    dvt::auxiliary::{self, AuxValue},
};

pub const DTX_MAGIC: u32 = 0x1F3D_5B79;
pub const HEADER_LEN: usize = 32;
pub const PAYLOAD_HEADER_LEN: usize = 16;
/// Largest frame on the wire
pub const MAX_FRAGMENT: usize = 64 * 1024;
/// Payload bytes carried by one continuation fragment
pub const FRAGMENT_DATA: usize = MAX_FRAGMENT - HEADER_LEN;

/// Set in the type word by some senders when a reply is expected
const EXPECTS_REPLY_FLAG: u32 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Ack = 0,
    Unknown1 = 1,
    MethodInvocation = 2,
    ResponseWithReturnValue = 3,
    Error = 4,
    Lz4Compressed = 0x707,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Result<Self, LinkError> {
        Ok(match value & !EXPECTS_REPLY_FLAG {
            0 => Self::Ack,
            1 => Self::Unknown1,
            2 => Self::MethodInvocation,
            3 => Self::ResponseWithReturnValue,
            4 => Self::Error,
            0x707 => Self::Lz4Compressed,
            _ => return Err(LinkError::UnknownDtxMessageType(value)),
        })
    }
}

/// The 32-byte frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub fragment_index: u16,
    pub fragment_count: u16,
    /// Bytes following this header in the frame; the whole message length
    /// on a bare first fragment
    pub length: u32,
    pub identifier: u32,
    /// 0 for a request, the request's index plus one for its reply
    pub conversation_index: u32,
    pub channel: i32,
    pub expects_reply: bool,
}

impl MessageHeader {
    pub fn new(identifier: u32, conversation_index: u32, channel: i32, expects_reply: bool) -> Self {
        Self {
            fragment_index: 0,
            fragment_count: 1,
            length: 0,
            identifier,
            conversation_index,
            channel,
            expects_reply,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut res = [0u8; HEADER_LEN];
        res[0..4].copy_from_slice(&DTX_MAGIC.to_le_bytes());
        res[4..8].copy_from_slice(&(HEADER_LEN as u32).to_le_bytes());
        res[8..10].copy_from_slice(&self.fragment_index.to_le_bytes());
        res[10..12].copy_from_slice(&self.fragment_count.to_le_bytes());
        res[12..16].copy_from_slice(&self.length.to_le_bytes());
        res[16..20].copy_from_slice(&self.identifier.to_le_bytes());
        res[20..24].copy_from_slice(&self.conversation_index.to_le_bytes());
        res[24..28].copy_from_slice(&self.channel.to_le_bytes());
        res[28..32].copy_from_slice(&u32::from(self.expects_reply).to_le_bytes());
        res
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LinkError> {
        if buf.len() < HEADER_LEN {
            return Err(LinkError::IncompleteFrame {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);

        let magic = u32_at(0);
        if magic != DTX_MAGIC {
            return Err(LinkError::BadMagic(magic as u64));
        }
        let header_len = u32_at(4);
        if header_len as usize != HEADER_LEN {
            return Err(LinkError::Decode(format!(
                "DTX header length {header_len}, expected {HEADER_LEN}"
            )));
        }
        let header = Self {
            fragment_index: u16_at(8),
            fragment_count: u16_at(10),
            length: u32_at(12),
            identifier: u32_at(16),
            conversation_index: u32_at(20),
            channel: u32_at(24) as i32,
            expects_reply: u32_at(28) == 1,
        };
        if header.fragment_count == 0 || header.fragment_index >= header.fragment_count {
            return Err(LinkError::Decode(format!(
                "fragment {} of {}",
                header.fragment_index, header.fragment_count
            )));
        }
        Ok(header)
    }

    pub fn is_fragmented(&self) -> bool {
        self.fragment_count > 1
    }

    /// A bare header announcing a fragmented message
    pub fn is_first_fragment(&self) -> bool {
        self.is_fragmented() && self.fragment_index == 0
    }
}

/// What a message carries, by message type
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Ack,
    Unknown1(Vec<u8>),
    MethodInvocation { selector: String },
    Response(Option<Value>),
    Error(Value),
    /// LZ4 block-compressed payload, passed through undecoded
    Compressed(Vec<u8>),
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Ack => MessageType::Ack,
            Body::Unknown1(_) => MessageType::Unknown1,
            Body::MethodInvocation { .. } => MessageType::MethodInvocation,
            Body::Response(_) => MessageType::ResponseWithReturnValue,
            Body::Error(_) => MessageType::Error,
            Body::Compressed(_) => MessageType::Lz4Compressed,
        }
    }
}

/// A complete, defragmented message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub aux: Vec<AuxValue>,
    pub body: Body,
}

impl Message {
    pub fn method_invocation(
        identifier: u32,
        channel: i32,
        selector: impl Into<String>,
        args: Vec<AuxValue>,
        expects_reply: bool,
    ) -> Self {
        Self {
            header: MessageHeader::new(identifier, 0, channel, expects_reply),
            aux: args,
            body: Body::MethodInvocation {
                selector: selector.into(),
            },
        }
    }

    /// A reply to `request` carrying `value`
    pub fn response(request: &MessageHeader, value: Option<Value>) -> Self {
        Self {
            header: MessageHeader::new(
                request.identifier,
                request.conversation_index + 1,
                request.channel,
                false,
            ),
            aux: Vec::new(),
            body: Body::Response(value),
        }
    }

    /// The empty acknowledgement of `request`
    pub fn ack(request: &MessageHeader) -> Self {
        Self {
            header: MessageHeader::new(
                request.identifier,
                request.conversation_index + 1,
                request.channel,
                false,
            ),
            aux: Vec::new(),
            body: Body::Ack,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn selector(&self) -> Option<&str> {
        match &self.body {
            Body::MethodInvocation { selector } => Some(selector),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.header.conversation_index > 0
    }

    /// The returned object of a response
    pub fn value(&self) -> Option<&Value> {
        match &self.body {
            Body::Response(v) => v.as_ref(),
            _ => None,
        }
    }

    /// Payload header, aux block and payload
    fn encode_payload(&self) -> Result<Vec<u8>, LinkError> {
        let aux = auxiliary::encode(&self.aux);
        let payload = match &self.body {
            Body::Ack | Body::Response(None) => Vec::new(),
            Body::Unknown1(b) | Body::Compressed(b) => b.clone(),
            Body::MethodInvocation { selector } => {
                auxiliary::archive(Value::String(selector.clone()))?
            }
            Body::Response(Some(v)) | Body::Error(v) => auxiliary::archive(v.clone())?,
        };

        let mut res = Vec::with_capacity(PAYLOAD_HEADER_LEN + aux.len() + payload.len());
        res.extend_from_slice(&(self.message_type() as u32).to_le_bytes());
        res.extend_from_slice(&(aux.len() as u32).to_le_bytes());
        res.extend_from_slice(&((aux.len() + payload.len()) as u32).to_le_bytes());
        res.extend_from_slice(&0u32.to_le_bytes());
        res.extend_from_slice(&aux);
        res.extend_from_slice(&payload);
        Ok(res)
    }

    /// Serializes the message, fragmenting it when it exceeds
    /// [`MAX_FRAGMENT`]
    pub fn encode(&self) -> Result<Vec<u8>, LinkError> {
        let payload = self.encode_payload()?;
        let mut header = self.header;

        if HEADER_LEN + payload.len() <= MAX_FRAGMENT {
            header.fragment_index = 0;
            header.fragment_count = 1;
            header.length = payload.len() as u32;
            let mut res = Vec::with_capacity(HEADER_LEN + payload.len());
            res.extend_from_slice(&header.encode());
            res.extend_from_slice(&payload);
            return Ok(res);
        }

        let chunks = payload.len().div_ceil(FRAGMENT_DATA);
        let count = u16::try_from(chunks + 1).map_err(|_| {
            LinkError::Decode(format!("{} bytes is too large for DTX", payload.len()))
        })?;

        let mut res = Vec::with_capacity(HEADER_LEN * (chunks + 1) + payload.len());
        header.fragment_index = 0;
        header.fragment_count = count;
        header.length = payload.len() as u32;
        res.extend_from_slice(&header.encode());
        for (i, chunk) in payload.chunks(FRAGMENT_DATA).enumerate() {
            header.fragment_index = i as u16 + 1;
            header.length = chunk.len() as u32;
            res.extend_from_slice(&header.encode());
            res.extend_from_slice(chunk);
        }
        Ok(res)
    }

    /// Decodes the body of a complete message
    pub fn decode_payload(header: MessageHeader, bytes: &[u8]) -> Result<Self, LinkError> {
        if bytes.len() < PAYLOAD_HEADER_LEN {
            return Err(LinkError::Decode(format!(
                "DTX payload of {} bytes has no payload header",
                bytes.len()
            )));
        }
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let message_type = MessageType::from_u32(u32_at(0))?;
        let aux_len = u32_at(4) as usize;
        let total_len = u32_at(8) as usize;

        let rest = &bytes[PAYLOAD_HEADER_LEN..];
        if total_len < aux_len || rest.len() < total_len {
            return Err(LinkError::Decode(format!(
                "DTX payload header claims aux {aux_len} of {total_len}, have {}",
                rest.len()
            )));
        }
        let aux = if aux_len > 0 {
            auxiliary::decode(&rest[..aux_len])?
        } else {
            Vec::new()
        };
        let payload = &rest[aux_len..total_len];

        let archived = |p: &[u8]| -> Result<Option<Value>, LinkError> {
            if p.is_empty() {
                Ok(None)
            } else {
                Ok(Some(ns_keyed_archive::decode::from_bytes(p)?))
            }
        };

        let body = match message_type {
            MessageType::Ack => Body::Ack,
            MessageType::Unknown1 => Body::Unknown1(payload.to_vec()),
            MessageType::Lz4Compressed => Body::Compressed(payload.to_vec()),
            MessageType::MethodInvocation => match archived(payload)? {
                Some(Value::String(selector)) => Body::MethodInvocation { selector },
                other => {
                    return Err(LinkError::Decode(format!(
                        "method invocation without a selector: {other:?}"
                    )));
                }
            },
            MessageType::ResponseWithReturnValue => Body::Response(archived(payload)?),
            MessageType::Error => Body::Error(archived(payload)?.unwrap_or(Value::String(
                "empty error".into(),
            ))),
        };

        Ok(Self { header, aux, body })
    }
}

/// One frame as read off the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub header: MessageHeader,
    pub data: Vec<u8>,
}

/// Decodes one frame from the front of `buf`, returning it and the bytes it
/// used. [`LinkError::IncompleteFrame`] means more bytes are needed.
pub fn decode_fragment(buf: &[u8]) -> Result<(Fragment, usize), LinkError> {
    let header = MessageHeader::decode(buf)?;
    if header.is_first_fragment() {
        return Ok((
            Fragment {
                header,
                data: Vec::new(),
            },
            HEADER_LEN,
        ));
    }
    let needed = HEADER_LEN + header.length as usize;
    if buf.len() < needed {
        return Err(LinkError::IncompleteFrame {
            needed,
            got: buf.len(),
        });
    }
    Ok((
        Fragment {
            header,
            data: buf[HEADER_LEN..needed].to_vec(),
        },
        needed,
    ))
}

#[derive(Debug)]
struct Partial {
    expected: usize,
    next: u16,
    data: Vec<u8>,
}

/// Joins fragments back into messages, keyed by channel and identifier
#[derive(Debug, Default)]
pub struct Defragmenter {
    partial: HashMap<(i32, u32), Partial>,
}

impl Defragmenter {
    /// Feeds one frame. Returns the header and payload bytes once a message
    /// is complete.
    pub fn push(
        &mut self,
        fragment: Fragment,
    ) -> Result<Option<(MessageHeader, Vec<u8>)>, LinkError> {
        let mut header = fragment.header;
        if !header.is_fragmented() {
            return Ok(Some((header, fragment.data)));
        }

        let key = (header.channel, header.identifier);
        if header.is_first_fragment() {
            if self.partial.contains_key(&key) {
                warn!("Restarting fragmented message {key:?}");
            }
            self.partial.insert(
                key,
                Partial {
                    expected: header.length as usize,
                    next: 1,
                    data: Vec::with_capacity(header.length as usize),
                },
            );
            return Ok(None);
        }

        let Some(partial) = self.partial.get_mut(&key) else {
            return Err(LinkError::Decode(format!(
                "fragment {} of {key:?} without a first fragment",
                header.fragment_index
            )));
        };
        if header.fragment_index != partial.next {
            self.partial.remove(&key);
            return Err(LinkError::Decode(format!(
                "fragment {} of {key:?} out of order",
                header.fragment_index
            )));
        }
        partial.next += 1;
        partial.data.extend_from_slice(&fragment.data);

        if header.fragment_index + 1 < header.fragment_count {
            return Ok(None);
        }
        let Some(partial) = self.partial.remove(&key) else {
            return Ok(None);
        };
        if partial.data.len() != partial.expected {
            return Err(LinkError::Decode(format!(
                "fragmented message {key:?} has {} bytes, announced {}",
                partial.data.len(),
                partial.expected
            )));
        }
        header.fragment_index = 0;
        header.fragment_count = 1;
        header.length = partial.expected as u32;
        Ok(Some((header, partial.data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(mut buf: &[u8]) -> Vec<Message> {
        let mut defrag = Defragmenter::default();
        let mut out = Vec::new();
        while !buf.is_empty() {
            let (fragment, used) = decode_fragment(buf).unwrap();
            buf = &buf[used..];
            if let Some((header, payload)) = defrag.push(fragment).unwrap() {
                out.push(Message::decode_payload(header, &payload).unwrap());
            }
        }
        out
    }

    #[test]
    fn header_layout() {
        let header = MessageHeader {
            fragment_index: 0,
            fragment_count: 1,
            length: 0x10,
            identifier: 42,
            conversation_index: 1,
            channel: -1,
            expects_reply: true,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &[0x79, 0x5b, 0x3d, 0x1f]);
        assert_eq!(&bytes[4..8], &32u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &42u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &[0xff; 4]);
        assert_eq!(&bytes[28..32], &1u32.to_le_bytes());
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn acks_are_48_bytes() {
        let request = MessageHeader::new(9, 0, 3, true);
        let ack = Message::ack(&request).encode().unwrap();
        assert_eq!(ack.len(), 48);
        let header = MessageHeader::decode(&ack).unwrap();
        assert_eq!(header.identifier, 9);
        assert_eq!(header.conversation_index, 1);
        assert_eq!(header.channel, 3);
        assert!(!header.expects_reply);
        assert_eq!(header.length, 16);
        assert_eq!(&ack[32..48], &[0u8; 16]);
    }

    #[test]
    fn method_invocation_carries_selector_and_arguments() {
        let msg = Message::method_invocation(
            7,
            1,
            "_requestChannelWithCode:identifier:",
            vec![
                AuxValue::U32(1),
                AuxValue::archived("com.apple.instruments.server.services.deviceinfo").unwrap(),
            ],
            true,
        );
        let decoded = decode_all(&msg.encode().unwrap());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].aux, msg.aux);
        assert_eq!(decoded[0].header.identifier, 7);
        assert!(decoded[0].header.expects_reply);
        assert_eq!(
            decoded[0].selector(),
            Some("_requestChannelWithCode:identifier:")
        );
        assert_eq!(decoded[0].message_type(), MessageType::MethodInvocation);
    }

    #[test]
    fn large_messages_fragment_and_reassemble() {
        for size in [FRAGMENT_DATA * 2 + 100, 200_000] {
            let msg = Message {
                header: MessageHeader::new(5, 0, 2, false),
                aux: Vec::new(),
                body: Body::Unknown1((0..size).map(|i| (i % 251) as u8).collect()),
            };
            let bytes = msg.encode().unwrap();

            let payload_len = PAYLOAD_HEADER_LEN + size;
            let first = MessageHeader::decode(&bytes).unwrap();
            assert!(first.is_first_fragment());
            assert_eq!(first.length as usize, payload_len);
            assert_eq!(
                first.fragment_count as usize - 1,
                payload_len.div_ceil(MAX_FRAGMENT - HEADER_LEN)
            );

            let mut rest = &bytes[..];
            let mut frames = 0;
            while !rest.is_empty() {
                let (fragment, used) = decode_fragment(rest).unwrap();
                assert!(used <= MAX_FRAGMENT);
                assert_eq!(fragment.header.identifier, 5);
                rest = &rest[used..];
                frames += 1;
            }
            assert_eq!(frames, first.fragment_count as usize);
            let decoded = decode_all(&bytes);
            assert_eq!(decoded.len(), 1);
            assert_eq!(decoded[0].body, msg.body);
            assert_eq!(decoded[0].header.length as usize, payload_len);
        }
    }

    #[test]
    fn partial_frames_ask_for_more() {
        let bytes = Message::method_invocation(1, 0, "ping", Vec::new(), false)
            .encode()
            .unwrap();
        assert!(matches!(
            decode_fragment(&bytes[..20]),
            Err(LinkError::IncompleteFrame { needed: 32, got: 20 })
        ));
        let cut = bytes.len() - 1;
        assert!(matches!(
            decode_fragment(&bytes[..cut]),
            Err(LinkError::IncompleteFrame { got, .. }) if got == cut
        ));
        assert!(decode_fragment(&bytes).is_ok());
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut bytes = Message::ack(&MessageHeader::new(1, 0, 0, true))
            .encode()
            .unwrap();
        bytes[0] = 0;
        assert!(matches!(decode_fragment(&bytes), Err(LinkError::BadMagic(_))));
    }

    #[test]
    fn unknown_message_types_are_rejected() {
        let mut bytes = Message::ack(&MessageHeader::new(1, 0, 0, true))
            .encode()
            .unwrap();
        bytes[32..36].copy_from_slice(&9u32.to_le_bytes());
        let (fragment, _) = decode_fragment(&bytes).unwrap();
        assert!(matches!(
            Message::decode_payload(fragment.header, &fragment.data),
            Err(LinkError::UnknownDtxMessageType(9))
        ));
    }

    #[test]
    fn stray_continuation_fragments_are_rejected() {
        let mut defrag = Defragmenter::default();
        let header = MessageHeader {
            fragment_index: 2,
            fragment_count: 3,
            length: 4,
            ..MessageHeader::new(1, 0, 0, false)
        };
        let res = defrag.push(Fragment {
            header,
            data: vec![0; 4],
        });
        assert!(matches!(res, Err(LinkError::Decode(_))));
    }
}
