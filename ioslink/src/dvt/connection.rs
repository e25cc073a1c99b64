//! The DTX multiplexer
//!
//! One reader task owns the read half of the socket. It reassembles
//! fragments, routes replies to their waiters by `(channel, identifier)`,
//! acknowledges device calls that expect a reply, and hands every other
//! message to a per-selector or per-channel inbox. Writers share the write
//! half behind an async mutex.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use plist::{Dictionary, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, trace, warn};

use crate::{
    DeviceSocket, LinkError,
    dvt::{
        auxiliary::AuxValue,
        channel::{Channel, Subscription},
        message::{Body, Defragmenter, MAX_FRAGMENT, Message, MessageHeader, decode_fragment},
    },
    provider::DeviceProvider,
};

/// How long a call or a channel request waits for its reply
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);
pub const REQUEST_CHANNEL: &str = "_requestChannelWithCode:identifier:";
pub const CHANNEL_CANCELED: &str = "_channelCanceled:";
pub const PUBLISH_CAPABILITIES: &str = "_notifyOfPublishedCapabilities:";

/// Lockdown name of the instruments server, iOS 14 and later
pub const SERVICE_NAME: &str = "com.apple.instruments.remoteserver.DVTSecureSocketProxy";
/// The same server before iOS 14
pub const LEGACY_SERVICE_NAME: &str = "com.apple.instruments.remoteserver";
/// The same server reached through RSD
pub const RSD_SERVICE_NAME: &str = "com.apple.instruments.dtservicehub";

const INBOX_DEPTH: usize = 64;

type ReplySender = oneshot::Sender<Result<Message, LinkError>>;

#[derive(Debug, Default)]
struct Routes {
    pending: HashMap<(i32, u32), ReplySender>,
    selectors: HashMap<(i32, String), (u64, mpsc::Sender<Message>)>,
    channels: HashMap<i32, mpsc::Sender<Message>>,
    closed: bool,
}

/// State shared by the connection, its channels and the reader task
#[derive(Debug)]
pub(crate) struct Shared {
    writer: tokio::sync::Mutex<WriteHalf<DeviceSocket>>,
    routes: Mutex<Routes>,
    next_identifier: AtomicU32,
    next_subscription: AtomicU64,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) async fn send(&self, message: &Message) -> Result<(), LinkError> {
        let bytes = message.encode()?;
        trace!(
            "DTX -> channel {} id {} {:?}",
            message.header.channel, message.header.identifier, message.body
        );
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Sends a method invocation expecting a reply and waits for it
    pub(crate) async fn call(
        &self,
        channel: i32,
        selector: &str,
        args: Vec<AuxValue>,
        timeout: Duration,
    ) -> Result<Message, LinkError> {
        let identifier = self.next_identifier.fetch_add(1, Ordering::Relaxed);
        let key = (channel, identifier);
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes();
            if routes.closed {
                return Err(LinkError::ConnectionClosed);
            }
            routes.pending.insert(key, tx);
        }

        debug!("DTX call {selector} on channel {channel} as {identifier}");
        let message = Message::method_invocation(identifier, channel, selector, args, true);
        if let Err(e) = self.send(&message).await {
            self.routes().pending.remove(&key);
            return Err(e);
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => return Err(LinkError::ConnectionClosed),
            Err(_) => {
                self.routes().pending.remove(&key);
                warn!("No reply to {selector} on channel {channel} within {timeout:?}");
                return Err(LinkError::Timeout);
            }
        };

        if let Body::Error(e) = &reply.body {
            return Err(LinkError::DtxCallFailed {
                selector: selector.to_string(),
                error: describe_error(e),
            });
        }
        Ok(reply)
    }

    /// Sends a method invocation without waiting for anything
    pub(crate) async fn notify(
        &self,
        channel: i32,
        selector: &str,
        args: Vec<AuxValue>,
    ) -> Result<(), LinkError> {
        let identifier = self.next_identifier.fetch_add(1, Ordering::Relaxed);
        let message = Message::method_invocation(identifier, channel, selector, args, false);
        self.send(&message).await
    }

    pub(crate) fn register_channel(&self, code: i32) -> Result<mpsc::Receiver<Message>, LinkError> {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let mut routes = self.routes();
        if routes.closed {
            return Err(LinkError::ConnectionClosed);
        }
        routes.channels.insert(code, tx);
        Ok(rx)
    }

    pub(crate) fn subscribe(self: &Arc<Self>, channel: i32, selector: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let mut routes = self.routes();
        // a closed connection drops the sender, the subscription sees the end
        if !routes.closed {
            routes
                .selectors
                .insert((channel, selector.to_string()), (id, tx));
        }
        Subscription::new(self.clone(), channel, selector.to_string(), id, rx)
    }

    pub(crate) fn unsubscribe(&self, channel: i32, selector: &str, id: u64) {
        let mut routes = self.routes();
        let key = (channel, selector.to_string());
        if routes.selectors.get(&key).map(|(i, _)| *i) == Some(id) {
            routes.selectors.remove(&key);
        }
    }

    /// Drops a channel's inboxes and fails its waiters
    pub(crate) fn forget_channel(&self, code: i32) {
        let mut routes = self.routes();
        routes.channels.remove(&code);
        routes.selectors.retain(|(c, _), _| *c != code);
        let keys: Vec<_> = routes
            .pending
            .keys()
            .filter(|(c, _)| *c == code)
            .copied()
            .collect();
        for key in keys {
            if let Some(tx) = routes.pending.remove(&key) {
                let _ = tx.send(Err(LinkError::ConnectionClosed));
            }
        }
    }

    fn close(&self, reason: &LinkError) {
        let mut routes = self.routes();
        if routes.closed {
            return;
        }
        debug!("DTX connection closing: {reason}");
        routes.closed = true;
        for (_, tx) in routes.pending.drain() {
            let _ = tx.send(Err(LinkError::ConnectionClosed));
        }
        routes.selectors.clear();
        routes.channels.clear();
    }

    async fn dispatch(&self, header: MessageHeader, payload: &[u8]) {
        let message = match Message::decode_payload(header, payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "Undecodable DTX message {} on channel {}: {e}",
                    header.identifier, header.channel
                );
                if header.conversation_index > 0 {
                    let waiter = self
                        .routes()
                        .pending
                        .remove(&(header.channel, header.identifier));
                    if let Some(tx) = waiter {
                        let _ = tx.send(Err(e));
                    }
                }
                return;
            }
        };
        trace!(
            "DTX <- channel {} id {}.{} {:?}",
            header.channel, header.identifier, header.conversation_index, message.body
        );

        if message.is_reply() {
            let waiter = self
                .routes()
                .pending
                .remove(&(header.channel, header.identifier));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(message));
                }
                None if message.body == Body::Ack => {}
                None => debug!(
                    "Reply {} on channel {} has no waiter",
                    header.identifier, header.channel
                ),
            }
            return;
        }

        if header.expects_reply {
            if let Err(e) = self.send(&Message::ack(&header)).await {
                error!("Failed to acknowledge DTX message {}: {e}", header.identifier);
            }
        }

        if header.channel == 0 && message.selector() == Some(CHANNEL_CANCELED) {
            match message.aux.first().and_then(AuxValue::as_u32) {
                Some(code) => {
                    debug!("Device canceled channel {code}");
                    self.forget_channel(code as i32);
                }
                None => warn!("{CHANNEL_CANCELED} without a channel code"),
            }
        }

        let inbox = {
            let routes = self.routes();
            message
                .selector()
                .and_then(|s| routes.selectors.get(&(header.channel, s.to_string())))
                .map(|(_, tx)| tx.clone())
                .or_else(|| routes.channels.get(&header.channel).cloned())
        };
        match inbox {
            Some(tx) => {
                if tx.send(message).await.is_err() {
                    debug!("Inbox for channel {} was dropped", header.channel);
                }
            }
            None => warn!(
                "No inbox for {:?} on channel {}",
                message.selector(),
                header.channel
            ),
        }
    }
}

fn describe_error(v: &Value) -> String {
    if let Some(s) = v.as_string() {
        return s.to_string();
    }
    if let Some(d) = v.as_dictionary() {
        for key in ["NSLocalizedDescription", "NSDescription"] {
            if let Some(s) = d.get(key).and_then(Value::as_string) {
                return s.to_string();
            }
        }
        if let Some(user_info) = d.get("NSUserInfo").and_then(Value::as_dictionary) {
            if let Some(s) = user_info.get("NSLocalizedDescription").and_then(Value::as_string) {
                return s.to_string();
            }
        }
    }
    format!("{v:?}")
}

async fn read_loop(mut reader: ReadHalf<DeviceSocket>, shared: Arc<Shared>) {
    let mut buf: Vec<u8> = Vec::with_capacity(MAX_FRAGMENT);
    let mut defrag = Defragmenter::default();

    let reason = loop {
        match decode_fragment(&buf) {
            Ok((fragment, used)) => {
                buf.drain(..used);
                match defrag.push(fragment) {
                    Ok(Some((header, payload))) => shared.dispatch(header, &payload).await,
                    Ok(None) => {}
                    Err(e) => warn!("Dropping DTX fragment: {e}"),
                }
                continue;
            }
            Err(LinkError::IncompleteFrame { .. }) => {}
            Err(e) => {
                error!("DTX stream out of sync: {e}");
                break e;
            }
        }

        match reader.read_buf(&mut buf).await {
            Ok(0) => break LinkError::ConnectionClosed,
            Ok(_) => {}
            Err(e) => break LinkError::Socket(e),
        }
    };
    shared.close(&reason);
}

/// A DTX session over one service socket
#[derive(Debug)]
pub struct DtxConnection {
    shared: Arc<Shared>,
    root: Channel,
    next_channel: AtomicI32,
    reader: JoinHandle<()>,
}

impl DtxConnection {
    /// Starts the reader task on `socket`
    pub fn new(socket: DeviceSocket) -> Self {
        let (reader, writer) = tokio::io::split(socket);
        let mut routes = Routes::default();
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        routes.channels.insert(0, tx);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            routes: Mutex::new(routes),
            next_identifier: AtomicU32::new(1),
            next_subscription: AtomicU64::new(0),
        });

        let root = Channel::new(shared.clone(), 0, "root".into(), rx);
        let reader = tokio::spawn(read_loop(reader, shared.clone()));
        Self {
            shared,
            root,
            next_channel: AtomicI32::new(1),
            reader,
        }
    }

    /// Starts the instruments server through Lockdown and connects to it
    pub async fn connect(provider: &dyn DeviceProvider) -> Result<Self, LinkError> {
        let connection = match crate::lockdown::start_service(provider, SERVICE_NAME).await {
            Ok(c) => c,
            Err(LinkError::ServiceNotFound(_)) => {
                debug!("{SERVICE_NAME} missing, trying {LEGACY_SERVICE_NAME}");
                crate::lockdown::start_service(provider, LEGACY_SERVICE_NAME).await?
            }
            Err(e) => return Err(e),
        };
        Ok(Self::new(connection.into_inner()?))
    }

    /// Publishes the host's capabilities and waits for the device's
    pub async fn handshake(&mut self) -> Result<Dictionary, LinkError> {
        let mut ours = Dictionary::new();
        ours.insert("com.apple.private.DTXBlockCompression".into(), 0.into());
        ours.insert("com.apple.private.DTXConnection".into(), 1.into());
        self.shared
            .notify(
                0,
                PUBLISH_CAPABILITIES,
                vec![AuxValue::archived(Value::Dictionary(ours))?],
            )
            .await?;

        let timeout = self.root.timeout();
        let theirs = tokio::time::timeout(timeout, async {
            loop {
                let message = self
                    .root
                    .next_message()
                    .await
                    .ok_or(LinkError::ConnectionClosed)?;
                if message.selector() == Some(PUBLISH_CAPABILITIES) {
                    return Ok::<_, LinkError>(message);
                }
                debug!("Skipping {:?} while waiting for capabilities", message.selector());
            }
        })
        .await
        .map_err(|_| LinkError::Timeout)??;

        let capabilities = theirs
            .aux
            .first()
            .ok_or_else(|| LinkError::Decode("capabilities without an argument".into()))?
            .unarchive()?;
        match capabilities {
            Value::Dictionary(d) => {
                debug!("Device DTX capabilities: {d:?}");
                Ok(d)
            }
            other => Err(LinkError::Decode(format!(
                "capabilities are not a dictionary: {other:?}"
            ))),
        }
    }

    /// Channel 0, used for channel management
    pub fn root(&mut self) -> &mut Channel {
        &mut self.root
    }

    /// Asks the device for a channel to the service named `identifier`
    pub async fn request_channel(&self, identifier: &str) -> Result<Channel, LinkError> {
        let code = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let inbox = self.shared.register_channel(code)?;
        let args = vec![
            AuxValue::U32(code as u32),
            AuxValue::archived(identifier)?,
        ];
        let res = self
            .shared
            .call(0, REQUEST_CHANNEL, args, CHANNEL_TIMEOUT)
            .await;
        if let Err(e) = res {
            self.shared.forget_channel(code);
            return Err(e);
        }
        debug!("Channel {code} open to {identifier}");
        Ok(Channel::new(self.shared.clone(), code, identifier.into(), inbox))
    }

    /// Stops the reader and fails every waiter
    pub fn close(self) {
        self.reader.abort();
        self.shared.close(&LinkError::ConnectionClosed);
    }
}

impl Drop for DtxConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
