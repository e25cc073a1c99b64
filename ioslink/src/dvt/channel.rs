//! Channel handles and selector subscriptions

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    LinkError,
    dvt::{
        auxiliary::AuxValue,
        connection::{CHANNEL_CANCELED, CHANNEL_TIMEOUT, Shared},
        message::Message,
    },
};

/// One DTX channel. Messages the device sends on it that no subscription
/// claims are read with [`Channel::next_message`].
#[derive(Debug)]
pub struct Channel {
    shared: Arc<Shared>,
    code: i32,
    identifier: String,
    inbox: mpsc::Receiver<Message>,
    timeout: Duration,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<Shared>,
        code: i32,
        identifier: String,
        inbox: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            shared,
            code,
            identifier,
            inbox,
            timeout: CHANNEL_TIMEOUT,
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Some calls run longer than the default
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Invokes `selector` and waits for its reply
    pub async fn call(&self, selector: &str, args: Vec<AuxValue>) -> Result<Message, LinkError> {
        self.shared
            .call(self.code, selector, args, self.timeout)
            .await
    }

    /// Invokes `selector` without asking for a reply
    pub async fn notify(&self, selector: &str, args: Vec<AuxValue>) -> Result<(), LinkError> {
        self.shared.notify(self.code, selector, args).await
    }

    /// Routes device calls of `selector` on this channel to their own inbox
    pub fn subscribe(&self, selector: &str) -> Subscription {
        self.shared.subscribe(self.code, selector)
    }

    /// The next unclaimed message, `None` once the channel or the
    /// connection is gone
    pub async fn next_message(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }

    /// Tells the device the channel is done and drops its inboxes
    pub async fn cancel(self) -> Result<(), LinkError> {
        debug!("Canceling channel {} ({})", self.code, self.identifier);
        let res = self
            .shared
            .notify(0, CHANNEL_CANCELED, vec![AuxValue::U32(self.code as u32)])
            .await;
        self.shared.forget_channel(self.code);
        res
    }
}

/// The inbox of one selector on one channel. Dropping it unregisters it.
#[derive(Debug)]
pub struct Subscription {
    shared: Arc<Shared>,
    channel: i32,
    selector: String,
    id: u64,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(
        shared: Arc<Shared>,
        channel: i32,
        selector: String,
        id: u64,
        rx: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            shared,
            channel,
            selector,
            id,
            rx,
        }
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.unsubscribe(self.channel, &self.selector, self.id);
    }
}

#[cfg(test)]
mod tests {
    use crate::dvt::{
        connection::{
            DtxConnection,
            tests::{accept_channel, read_message, write_message},
        },
        message::Message,
    };

    use super::*;

    #[tokio::test]
    async fn dropped_subscriptions_fall_back_to_the_channel() {
        let (host, mut device) = tokio::io::duplex(1 << 16);
        let conn = DtxConnection::new(Box::new(host));
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

        let device_task = tokio::spawn(async move {
            let code = accept_channel(&mut device, "events").await;
            go_rx.await.unwrap();
            let event = Message::method_invocation(
                10,
                code,
                "outputReceived:fromProcess:atTime:",
                Vec::new(),
                false,
            );
            write_message(&mut device, &event).await;
            device
        });

        let mut channel = conn.request_channel("events").await.unwrap();
        let sub = channel.subscribe("outputReceived:fromProcess:atTime:");
        drop(sub);
        go_tx.send(()).unwrap();
        let _device = device_task.await.unwrap();

        let event = channel.next_message().await.unwrap();
        assert_eq!(event.selector(), Some("outputReceived:fromProcess:atTime:"));
    }

    #[tokio::test]
    async fn cancel_notifies_the_device() {
        let (host, mut device) = tokio::io::duplex(1 << 16);
        let conn = DtxConnection::new(Box::new(host));

        let device_task = tokio::spawn(async move {
            let code = accept_channel(&mut device, "brief").await;
            let cancel = read_message(&mut device).await;
            (code, cancel)
        });

        let channel = conn.request_channel("brief").await.unwrap();
        channel.cancel().await.unwrap();
        let (code, cancel) = device_task.await.unwrap();
        assert_eq!(cancel.selector(), Some(CHANNEL_CANCELED));
        assert_eq!(cancel.header.channel, 0);
        assert_eq!(cancel.aux[0].as_u32(), Some(code as u32));
    }
}
