//! Carriers of the remote pairing control channel
//!
//! The same envelopes travel either as length-prefixed JSON on a plain TCP
//! listener or as XPC dictionaries over RemoteXPC. Byte strings are base64 in
//! JSON and raw data in XPC.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use std::{fmt::Debug, pin::Pin};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{LinkError, ReadWrite, pretty_print_plist};

pub const RPPAIRING_MAGIC: &[u8] = b"RPPairing";

type EnvelopeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LinkError>> + Send + 'a>>;

pub trait RpPairingSocketProvider: Debug + Send {
    /// Sends `message` wrapped in a host envelope carrying `seq`
    fn send_envelope(&mut self, message: plist::Value, seq: u64) -> EnvelopeFuture<'_, ()>;

    /// Receives the next envelope and returns its `message` branch
    fn recv_envelope(&mut self) -> EnvelopeFuture<'_, plist::Value>;

    fn serialize_bytes(b: &[u8]) -> plist::Value;
    fn deserialize_bytes(v: plist::Value) -> Option<Vec<u8>>;
}

fn host_envelope(message: plist::Value, seq: u64) -> plist::Dictionary {
    let mut d = plist::Dictionary::new();
    d.insert("message".into(), message);
    d.insert("originatedBy".into(), "host".into());
    d.insert("sequenceNumber".into(), seq.into());
    d
}

/// `RPPairing | len:u16 BE | JSON` framing of the manual pairing listener
#[derive(Debug)]
pub struct RpPairingSocket<R: ReadWrite> {
    pub inner: R,
}

impl<R: ReadWrite> RpPairingSocket<R> {
    pub fn new(socket: R) -> Self {
        Self { inner: socket }
    }

    async fn send_rppairing(&mut self, value: &plist::Value) -> Result<(), LinkError> {
        let body = serde_json::to_vec(value)?;
        let len = u16::try_from(body.len())
            .map_err(|_| LinkError::Decode(format!("{} byte envelope is too long", body.len())))?;

        let mut packet = Vec::with_capacity(RPPAIRING_MAGIC.len() + 2 + body.len());
        packet.extend_from_slice(RPPAIRING_MAGIC);
        packet.extend_from_slice(&len.to_be_bytes());
        packet.extend_from_slice(&body);
        self.inner.write_all(&packet).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn recv_rppairing(&mut self) -> Result<serde_json::Value, LinkError> {
        let mut magic = [0u8; RPPAIRING_MAGIC.len()];
        self.inner.read_exact(&mut magic).await?;
        if magic != RPPAIRING_MAGIC {
            warn!("Bad RPPairing magic: {magic:02x?}");
            return Err(LinkError::UnexpectedResponse);
        }

        let mut len = [0u8; 2];
        self.inner.read_exact(&mut len).await?;
        let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
        self.inner.read_exact(&mut body).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// JSON to plist, dropping nulls which plist cannot hold
pub(crate) fn json_to_plist(value: serde_json::Value) -> Option<plist::Value> {
    use serde_json::Value as J;
    Some(match value {
        J::Null => return None,
        J::Bool(b) => plist::Value::Boolean(b),
        J::Number(n) => {
            if let Some(u) = n.as_u64() {
                plist::Value::Integer(u.into())
            } else if let Some(i) = n.as_i64() {
                plist::Value::Integer(i.into())
            } else {
                plist::Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        J::String(s) => plist::Value::String(s),
        J::Array(a) => plist::Value::Array(a.into_iter().filter_map(json_to_plist).collect()),
        J::Object(o) => plist::Value::Dictionary(
            o.into_iter()
                .filter_map(|(k, v)| json_to_plist(v).map(|v| (k, v)))
                .collect(),
        ),
    })
}

impl<R: ReadWrite> RpPairingSocketProvider for RpPairingSocket<R> {
    fn send_envelope(&mut self, message: plist::Value, seq: u64) -> EnvelopeFuture<'_, ()> {
        Box::pin(async move {
            let v = plist::Value::Dictionary(host_envelope(message, seq));
            debug!("Sending RPPairing envelope: {}", pretty_print_plist(&v));
            self.send_rppairing(&v).await
        })
    }

    fn recv_envelope(&mut self) -> EnvelopeFuture<'_, plist::Value> {
        Box::pin(async move {
            let mut value = self.recv_rppairing().await?;
            match value.get_mut("message").map(serde_json::Value::take) {
                Some(m) => {
                    let m = json_to_plist(m).ok_or(LinkError::UnexpectedResponse)?;
                    debug!("Received RPPairing message: {}", pretty_print_plist(&m));
                    Ok(m)
                }
                None => {
                    warn!("RPPairing envelope without a message: {value}");
                    Err(LinkError::UnexpectedResponse)
                }
            }
        })
    }

    fn serialize_bytes(b: &[u8]) -> plist::Value {
        plist::Value::String(B64.encode(b))
    }

    fn deserialize_bytes(v: plist::Value) -> Option<Vec<u8>> {
        if let plist::Value::String(v) = v {
            B64.decode(v).ok()
        } else {
            None
        }
    }
}

#[cfg(feature = "xpc")]
mod xpc_carrier {
    use super::*;
    use crate::xpc::{Dictionary, RemoteXpcClient, XpcObject};

    const ENVELOPE_TYPE: &str = "RemotePairing.ControlChannelMessageEnvelope";

    impl<R: ReadWrite> RpPairingSocketProvider for RemoteXpcClient<R> {
        fn send_envelope(&mut self, message: plist::Value, seq: u64) -> EnvelopeFuture<'_, ()> {
            let mut value = Dictionary::new();
            value.insert("message".into(), message.into());
            value.insert("originatedBy".into(), XpcObject::String("host".into()));
            value.insert("sequenceNumber".into(), XpcObject::UInt64(seq));

            let mut envelope = Dictionary::new();
            envelope.insert(
                "mangledTypeName".into(),
                XpcObject::String(ENVELOPE_TYPE.into()),
            );
            envelope.insert("value".into(), XpcObject::Dictionary(value));
            debug!("Sending XPC envelope {seq}");

            Box::pin(async move { self.send_object(envelope, true).await })
        }

        fn recv_envelope(&mut self) -> EnvelopeFuture<'_, plist::Value> {
            Box::pin(async move {
                let msg = self.recv_root().await?;
                debug!("Received RemoteXPC {}", pretty_print_plist(&msg));
                msg.into_dictionary()
                    .and_then(|mut x| x.remove("value"))
                    .and_then(|x| x.into_dictionary())
                    .and_then(|mut x| x.remove("message"))
                    .ok_or(LinkError::UnexpectedResponse)
            })
        }

        fn serialize_bytes(b: &[u8]) -> plist::Value {
            plist::Value::Data(b.to_owned())
        }

        fn deserialize_bytes(v: plist::Value) -> Option<Vec<u8>> {
            if let plist::Value::Data(v) = v {
                Some(v)
            } else {
                warn!("Non-data passed to deserialize_bytes for the RemoteXPC carrier");
                None
            }
        }
    }
}
