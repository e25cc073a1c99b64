//! The handful of HTTP/2 frames RemoteXPC uses
//!
//! Only what the device actually sends is decoded: no HPACK, no priorities.
//! Headers frames exist solely to open a stream.

use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::{LinkError, ReadWrite};

pub const FRAME_HEADER_LEN: usize = 9;

pub const TYPE_DATA: u8 = 0x00;
pub const TYPE_HEADERS: u8 = 0x01;
pub const TYPE_RST_STREAM: u8 = 0x03;
pub const TYPE_SETTINGS: u8 = 0x04;
pub const TYPE_PING: u8 = 0x06;
pub const TYPE_GOAWAY: u8 = 0x07;
pub const TYPE_WINDOW_UPDATE: u8 = 0x08;

pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_END_HEADERS: u8 = 0x04;

pub trait HttpFrame {
    fn serialize(&self) -> Vec<u8>;
}

fn frame_header(len: usize, frame_type: u8, flags: u8, stream_id: u32) -> Vec<u8> {
    let len = (len as u32).to_be_bytes();
    let mut res = Vec::with_capacity(FRAME_HEADER_LEN);
    res.extend_from_slice(&len[1..]);
    res.push(frame_type);
    res.push(flags);
    res.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    res
}

#[derive(Debug)]
pub enum Frame {
    Settings(SettingsFrame),
    WindowUpdate(WindowUpdateFrame),
    Headers(HeadersFrame),
    Data(DataFrame),
    Ping(PingFrame),
}

impl Frame {
    /// Reads the next frame off the socket.
    ///
    /// RST_STREAM and GOAWAY end the conversation and surface as errors.
    pub async fn next(socket: &mut impl ReadWrite) -> Result<Self, LinkError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        socket.read_exact(&mut header).await?;
        let frame_len = u32::from_be_bytes([0x00, header[0], header[1], header[2]]);
        let frame_type = header[3];
        let flags = header[4];
        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;

        let mut body = vec![0; frame_len as usize];
        socket.read_exact(&mut body).await?;
        trace!("HTTP/2 frame type {frame_type} flags {flags:#x} stream {stream_id} len {frame_len}");

        Ok(match frame_type {
            TYPE_DATA => Self::Data(DataFrame {
                stream_id,
                payload: body,
            }),
            TYPE_HEADERS => Self::Headers(HeadersFrame { stream_id }),
            TYPE_RST_STREAM => return Err(LinkError::HttpStreamReset),
            TYPE_SETTINGS => {
                if body.len() % 6 != 0 {
                    return Err(LinkError::Decode(format!(
                        "settings frame of {} bytes",
                        body.len()
                    )));
                }
                let settings = body
                    .chunks_exact(6)
                    .map(|c| {
                        Setting::parse(
                            u16::from_be_bytes([c[0], c[1]]),
                            u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::Settings(SettingsFrame {
                    settings,
                    stream_id,
                    flags,
                })
            }
            TYPE_PING => {
                let opaque: [u8; 8] = body
                    .as_slice()
                    .try_into()
                    .map_err(|_| LinkError::Decode("ping frame is not 8 bytes".into()))?;
                Self::Ping(PingFrame { opaque, flags })
            }
            TYPE_GOAWAY => {
                let msg = if body.len() < 8 {
                    "<MISSING>".to_string()
                } else {
                    String::from_utf8_lossy(&body[8..]).to_string()
                };
                return Err(LinkError::HttpGoAway(msg));
            }
            TYPE_WINDOW_UPDATE => {
                let increment: [u8; 4] = body
                    .as_slice()
                    .try_into()
                    .map_err(|_| LinkError::UnexpectedResponse)?;
                Self::WindowUpdate(WindowUpdateFrame {
                    increment_size: u32::from_be_bytes(increment),
                    stream_id,
                })
            }
            _ => return Err(LinkError::UnknownFrame(frame_type)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    /// A registered setting the host has no use for
    Other(u16, u32),
}

impl Setting {
    fn parse(id: u16, value: u32) -> Result<Self, LinkError> {
        Ok(match id {
            0x03 => Self::MaxConcurrentStreams(value),
            0x04 => Self::InitialWindowSize(value),
            0x01 | 0x02 | 0x05 | 0x06 => Self::Other(id, value),
            _ => return Err(LinkError::UnknownHttpSetting(id)),
        })
    }

    fn serialize(&self) -> [u8; 6] {
        let (id, value) = match self {
            Setting::MaxConcurrentStreams(m) => (0x03u16, *m),
            Setting::InitialWindowSize(s) => (0x04, *s),
            Setting::Other(id, v) => (*id, *v),
        };
        let mut res = [0u8; 6];
        res[..2].copy_from_slice(&id.to_be_bytes());
        res[2..].copy_from_slice(&value.to_be_bytes());
        res
    }
}

#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub settings: Vec<Setting>,
    pub stream_id: u32,
    pub flags: u8,
}

impl HttpFrame for SettingsFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut res = frame_header(self.settings.len() * 6, TYPE_SETTINGS, self.flags, self.stream_id);
        for s in &self.settings {
            res.extend_from_slice(&s.serialize());
        }
        res
    }
}

#[derive(Debug, Clone)]
pub struct WindowUpdateFrame {
    pub increment_size: u32,
    pub stream_id: u32,
}

impl HttpFrame for WindowUpdateFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut res = frame_header(4, TYPE_WINDOW_UPDATE, 0, self.stream_id);
        res.extend_from_slice(&self.increment_size.to_be_bytes());
        res
    }
}

/// Opens a stream; carries no header block
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
}

impl HttpFrame for HeadersFrame {
    fn serialize(&self) -> Vec<u8> {
        frame_header(0, TYPE_HEADERS, FLAG_END_HEADERS, self.stream_id)
    }
}

#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl HttpFrame for DataFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut res = frame_header(self.payload.len(), TYPE_DATA, 0, self.stream_id);
        res.extend_from_slice(&self.payload);
        res
    }
}

#[derive(Debug, Clone)]
pub struct PingFrame {
    pub opaque: [u8; 8],
    pub flags: u8,
}

impl HttpFrame for PingFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut res = frame_header(8, TYPE_PING, self.flags, 0);
        res.extend_from_slice(&self.opaque);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_back_written_frames() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let settings = SettingsFrame {
            settings: vec![
                Setting::MaxConcurrentStreams(100),
                Setting::InitialWindowSize(1048576),
            ],
            stream_id: 0,
            flags: 0,
        };
        a.write_all(&settings.serialize()).await.unwrap();
        a.write_all(
            &DataFrame {
                stream_id: 3,
                payload: b"abc".to_vec(),
            }
            .serialize(),
        )
        .await
        .unwrap();

        match Frame::next(&mut b).await.unwrap() {
            Frame::Settings(s) => assert_eq!(s.settings, settings.settings),
            other => panic!("unexpected {other:?}"),
        }
        match Frame::next(&mut b).await.unwrap() {
            Frame::Data(d) => {
                assert_eq!(d.stream_id, 3);
                assert_eq!(d.payload, b"abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn goaway_carries_debug_text() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut body = vec![0u8; 8];
        body.extend_from_slice(b"bye");
        let mut frame = frame_header(body.len(), TYPE_GOAWAY, 0, 0);
        frame.extend_from_slice(&body);
        a.write_all(&frame).await.unwrap();

        match Frame::next(&mut b).await {
            Err(LinkError::HttpGoAway(msg)) => assert_eq!(msg, "bye"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn headers_frame_opens_stream() {
        assert_eq!(
            HeadersFrame { stream_id: 1 }.serialize(),
            [0, 0, 0, 1, 4, 0, 0, 0, 1]
        );
    }
}
