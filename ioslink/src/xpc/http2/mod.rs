//! A minimal HTTP/2 client carrying RemoteXPC streams
//!
//! Data for streams other than the one being read is parked in a per-stream
//! queue until someone asks for it.

use std::collections::{HashMap, VecDeque};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{LinkError, ReadWrite};

pub mod frame;
use frame::HttpFrame;
pub use frame::Setting;

const HTTP2_MAGIC: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub struct Http2Client<R: ReadWrite> {
    inner: R,
    cache: HashMap<u32, VecDeque<Vec<u8>>>,
}

impl<R: ReadWrite> std::fmt::Debug for Http2Client<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Client")
            .field("streams", &self.cache.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<R: ReadWrite> Http2Client<R> {
    /// Writes the connection preface
    pub async fn new(mut inner: R) -> Result<Self, LinkError> {
        inner.write_all(HTTP2_MAGIC).await?;
        inner.flush().await?;
        Ok(Self {
            inner,
            cache: HashMap::new(),
        })
    }

    async fn write_frame(&mut self, frame: impl HttpFrame) -> Result<(), LinkError> {
        self.inner.write_all(&frame.serialize()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn set_settings(
        &mut self,
        settings: Vec<Setting>,
        stream_id: u32,
    ) -> Result<(), LinkError> {
        self.write_frame(frame::SettingsFrame {
            settings,
            stream_id,
            flags: 0,
        })
        .await
    }

    pub async fn window_update(
        &mut self,
        increment_size: u32,
        stream_id: u32,
    ) -> Result<(), LinkError> {
        self.write_frame(frame::WindowUpdateFrame {
            increment_size,
            stream_id,
        })
        .await
    }

    pub async fn open_stream(&mut self, stream_id: u32) -> Result<(), LinkError> {
        // The device may send on a stream before it sees our headers
        self.cache.entry(stream_id).or_default();
        self.write_frame(frame::HeadersFrame { stream_id }).await
    }

    pub async fn send(&mut self, payload: Vec<u8>, stream_id: u32) -> Result<(), LinkError> {
        self.write_frame(frame::DataFrame { stream_id, payload })
            .await
    }

    /// Returns the next data payload for `stream_id`, servicing control
    /// frames on the way
    pub async fn read(&mut self, stream_id: u32) -> Result<Vec<u8>, LinkError> {
        if let Some(d) = self
            .cache
            .entry(stream_id)
            .or_default()
            .pop_front()
        {
            return Ok(d);
        }

        loop {
            match frame::Frame::next(&mut self.inner).await? {
                frame::Frame::Settings(settings) => {
                    if settings.flags & frame::FLAG_ACK == 0 {
                        self.write_frame(frame::SettingsFrame {
                            settings: Vec::new(),
                            stream_id: settings.stream_id,
                            flags: frame::FLAG_ACK,
                        })
                        .await?;
                    }
                }
                frame::Frame::Ping(ping) => {
                    if ping.flags & frame::FLAG_ACK == 0 {
                        self.write_frame(frame::PingFrame {
                            opaque: ping.opaque,
                            flags: frame::FLAG_ACK,
                        })
                        .await?;
                    }
                }
                frame::Frame::Data(data) => {
                    debug!(
                        "Got data frame for {} with {} bytes",
                        data.stream_id,
                        data.payload.len()
                    );
                    // Device-initiated streams need their window topped up
                    if data.stream_id % 2 == 0 && !data.payload.is_empty() {
                        let len = data.payload.len() as u32;
                        self.window_update(len, 0).await?;
                        self.window_update(len, data.stream_id).await?;
                    }
                    if data.stream_id == stream_id {
                        return Ok(data.payload);
                    }
                    let queue = self.cache.entry(data.stream_id).or_insert_with(|| {
                        warn!("Received data for unopened stream {}", data.stream_id);
                        VecDeque::new()
                    });
                    queue.push_back(data.payload);
                }
                frame::Frame::Headers(_) | frame::Frame::WindowUpdate(_) => {}
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn parks_data_for_other_streams_and_acks_settings() {
        let (client, mut device) = tokio::io::duplex(4096);
        let mut client = Http2Client::new(client).await.unwrap();

        let mut magic = vec![0u8; HTTP2_MAGIC.len()];
        device.read_exact(&mut magic).await.unwrap();
        assert_eq!(magic, HTTP2_MAGIC);

        let mut script = frame::SettingsFrame {
            settings: vec![Setting::MaxConcurrentStreams(10)],
            stream_id: 0,
            flags: 0,
        }
        .serialize();
        script.extend(
            frame::DataFrame {
                stream_id: 3,
                payload: b"reply".to_vec(),
            }
            .serialize(),
        );
        script.extend(
            frame::DataFrame {
                stream_id: 1,
                payload: b"root".to_vec(),
            }
            .serialize(),
        );
        device.write_all(&script).await.unwrap();

        assert_eq!(client.read(1).await.unwrap(), b"root");
        assert_eq!(client.read(3).await.unwrap(), b"reply");

        // settings ack: empty settings frame with the ack flag
        let mut ack = [0u8; frame::FRAME_HEADER_LEN];
        device.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [0, 0, 0, frame::TYPE_SETTINGS, frame::FLAG_ACK, 0, 0, 0, 0]);
    }
}
