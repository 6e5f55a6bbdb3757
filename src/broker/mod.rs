//! Broker access shared by every publisher and reader in the process.
//!
//! Components only see the [`Broker`] trait; the concrete connection (MQTT or
//! the in-process loopback) is built once in `main` and handed out as
//! `Arc<dyn Broker>`.

pub mod loopback;
pub mod mqtt;
pub mod reader;
pub mod router;

use crate::error::RelayError;
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// Subject carrying serialized telemetry records.
pub const TELEMETRY_SUBJECT: &str = "telemetry";
/// Subject carrying `{deviceId, command}` messages.
pub const DEVICE_COMMAND_SUBJECT: &str = "device.command";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects if not already connected. Idempotent.
    async fn connect(&self) -> Result<(), RelayError>;

    /// Flushes outstanding publishes and closes the connection. Idempotent.
    async fn disconnect(&self) -> Result<(), RelayError>;

    /// Fire-and-forget publish; fails with `NotConnected` unless connected.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), RelayError>;

    /// Opens a raw stream of messages on `subject`.
    async fn subscribe(&self, subject: &str) -> Result<MessageStream, RelayError>;

    /// Follows every state transition. Reaching `Disconnected` after a
    /// disconnect or exhausted reconnects means no stream will be fed again
    /// until `connect()` is called.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    fn state(&self) -> ConnectionState {
        *self.watch_state().borrow()
    }

    /// Point-in-time snapshot; may be stale by the time the caller acts on it.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

/// Resolves once the broker is `Disconnected`, or immediately if it is already.
pub async fn closed(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await;
}

/// Lazy sequence of inbound messages on one subject.
///
/// Yields `None` once the broker can no longer feed it (disconnect, failed
/// resubscribe, retries exhausted).
#[derive(Debug)]
pub struct MessageStream {
    subject: String,
    receiver: mpsc::Receiver<BrokerMessage>,
}

impl MessageStream {
    pub(crate) fn new(subject: String, receiver: mpsc::Receiver<BrokerMessage>) -> Self {
        Self { subject, receiver }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }
}

impl Stream for MessageStream {
    type Item = BrokerMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
