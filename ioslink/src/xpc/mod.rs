//! RemoteXPC over HTTP/2
//!
//! iOS 17+ services, the untrusted tunnel service and RSD included, talk
//! XPC dictionaries over two HTTP/2 streams: root (1) carries requests and
//! replies, reply (3) only takes part in the opening handshake.

use tracing::debug;

use crate::{LinkError, ReadWrite};

pub mod format;
pub mod http2;

pub use format::{Dictionary, XpcFlags, XpcMessage, XpcObject};

pub const ROOT_CHANNEL: u32 = 1;
pub const REPLY_CHANNEL: u32 = 3;

/// Port of the RSD handshake on the device's tunnel address
pub const RSD_PORT: u16 = 58783;

#[derive(Debug)]
pub struct RemoteXpcClient<R: ReadWrite> {
    h2_client: http2::Http2Client<R>,
    root_id: u64,
}

impl<R: ReadWrite> RemoteXpcClient<R> {
    pub async fn new(socket: R) -> Result<Self, LinkError> {
        Ok(Self {
            h2_client: http2::Http2Client::new(socket).await?,
            root_id: 1,
        })
    }

    /// Opens both streams and announces this end as an XPC client
    pub async fn do_handshake(&mut self) -> Result<(), LinkError> {
        self.h2_client
            .set_settings(
                vec![
                    http2::Setting::MaxConcurrentStreams(100),
                    http2::Setting::InitialWindowSize(1048576),
                ],
                0,
            )
            .await?;
        self.h2_client.window_update(983041, 0).await?;

        self.h2_client.open_stream(ROOT_CHANNEL).await?;
        self.send_on(
            ROOT_CHANNEL,
            XpcMessage::new(
                XpcFlags::ALWAYS_SET,
                Some(XpcObject::Dictionary(Dictionary::new())),
                0,
            ),
        )
        .await?;

        self.h2_client.open_stream(REPLY_CHANNEL).await?;
        self.send_on(
            REPLY_CHANNEL,
            XpcMessage::new(XpcFlags::INIT_HANDSHAKE | XpcFlags::ALWAYS_SET, None, 0),
        )
        .await?;

        self.send_on(ROOT_CHANNEL, XpcMessage::new(XpcFlags(0x201), None, 0))
            .await?;
        debug!("RemoteXPC handshake sent");
        Ok(())
    }

    async fn send_on(&mut self, stream: u32, msg: XpcMessage) -> Result<(), LinkError> {
        self.h2_client.send(msg.encode(), stream).await
    }

    /// Sends a dictionary on the root stream
    pub async fn send_object(
        &mut self,
        msg: impl Into<XpcObject>,
        expect_reply: bool,
    ) -> Result<(), LinkError> {
        let mut flags = XpcFlags::ALWAYS_SET | XpcFlags::DATA;
        if expect_reply {
            flags |= XpcFlags::WANTING_REPLY;
        }
        let msg = XpcMessage::new(flags, Some(msg.into()), self.root_id);
        self.send_on(ROOT_CHANNEL, msg).await?;
        self.root_id += 1;
        Ok(())
    }

    /// Reads the next message on `stream`, joining data frames until it
    /// decodes
    pub async fn recv_message(&mut self, stream: u32) -> Result<XpcMessage, LinkError> {
        let mut buf = self.h2_client.read(stream).await?;
        loop {
            match XpcMessage::decode(&buf) {
                Ok(m) => return Ok(m),
                Err(LinkError::IncompleteFrame { .. }) => {
                    buf.extend_from_slice(&self.h2_client.read(stream).await?);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The next root stream message with a body, as XPC
    pub async fn recv_root_object(&mut self) -> Result<XpcObject, LinkError> {
        loop {
            if let Some(m) = self.recv_message(ROOT_CHANNEL).await?.message {
                return Ok(m);
            }
        }
    }

    /// The next root stream message with a body, as a plist
    pub async fn recv_root(&mut self) -> Result<plist::Value, LinkError> {
        Ok(self.recv_root_object().await?.to_plist())
    }

    pub fn into_inner(self) -> R {
        self.h2_client.into_inner()
    }
}
