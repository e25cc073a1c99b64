//! TLV8 as used by pair-setup and pair-verify
//!
//! Values longer than 255 bytes are written as consecutive entries of the
//! same type and joined again on read.

use crate::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    ErrorResponse = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0a,
    Permissions = 0x0b,
    FragmentData = 0x0c,
    FragmentLast = 0x0d,
    SessionId = 0x0e,
    Flags = 0x13,
    Info = 0x11,
    Separator = 0xff,
}

impl TryFrom<u8> for TlvType {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use TlvType::*;
        Ok(match value {
            0x00 => Method,
            0x01 => Identifier,
            0x02 => Salt,
            0x03 => PublicKey,
            0x04 => Proof,
            0x05 => EncryptedData,
            0x06 => State,
            0x07 => ErrorResponse,
            0x08 => RetryDelay,
            0x09 => Certificate,
            0x0a => Signature,
            0x0b => Permissions,
            0x0c => FragmentData,
            0x0d => FragmentLast,
            0x0e => SessionId,
            0x11 => Info,
            0x13 => Flags,
            0xff => Separator,
            other => return Err(LinkError::Decode(format!("unknown TLV type {other:#x}"))),
        })
    }
}

/// Pair-setup and pair-verify steps, carried in [`TlvType::State`]
pub mod state {
    pub const START_REQUEST: u8 = 0x01;
    pub const START_RESPONSE: u8 = 0x02;
    pub const VERIFY_REQUEST: u8 = 0x03;
    pub const VERIFY_RESPONSE: u8 = 0x04;
    pub const EXCHANGE_REQUEST: u8 = 0x05;
    pub const EXCHANGE_RESPONSE: u8 = 0x06;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub tlv_type: TlvType,
    pub data: Vec<u8>,
}

impl TlvEntry {
    pub fn new(tlv_type: TlvType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tlv_type,
            data: data.into(),
        }
    }

    pub fn state(s: u8) -> Self {
        Self::new(TlvType::State, [s])
    }
}

pub fn serialize_tlv8(entries: &[TlvEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.data.is_empty() {
            out.extend_from_slice(&[entry.tlv_type as u8, 0]);
            continue;
        }
        for chunk in entry.data.chunks(255) {
            out.push(entry.tlv_type as u8);
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
    }
    out
}

pub fn deserialize_tlv8(input: &[u8]) -> Result<Vec<TlvEntry>, LinkError> {
    let mut index = 0;
    let mut result = Vec::new();

    while index + 2 <= input.len() {
        let tlv_type = TlvType::try_from(input[index])?;
        let length = input[index + 1] as usize;
        index += 2;

        if index + length > input.len() {
            return Err(LinkError::IncompleteFrame {
                needed: index + length,
                got: input.len(),
            });
        }
        result.push(TlvEntry::new(tlv_type, &input[index..index + length]));
        index += length;
    }
    if index != input.len() {
        return Err(LinkError::Decode("trailing byte after TLV entries".into()));
    }
    Ok(result)
}

/// Joins every entry of `tlv_type`, `None` if there is none
pub fn read_coalesced(entries: &[TlvEntry], tlv_type: TlvType) -> Option<Vec<u8>> {
    let mut found = false;
    let mut out = Vec::new();
    for e in entries.iter().filter(|e| e.tlv_type == tlv_type) {
        found = true;
        out.extend_from_slice(&e.data);
    }
    found.then_some(out)
}

pub fn has_error(entries: &[TlvEntry]) -> bool {
    entries.iter().any(|e| e.tlv_type == TlvType::ErrorResponse)
}
