//! # Cross-Instance Transport
//!
//! The shared pub/sub medium between bus instances. Delivery is best-effort
//! broadcast with FIFO order per publisher and no persistence.
//!
//! ```text
//!  ┌──────────┐  publish(channel, bytes)  ┌───────────────┐  subscribe(channels)  ┌──────────┐
//!  │  Bus A   │ ────────────────────────► │   Transport   │ ────────────────────► │  Bus B   │
//!  └──────────┘                           └───────────────┘                       └──────────┘
//! ```

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use nexus_types::NexusError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// One message on a transport channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: String,
    pub payload: Arc<[u8]>,
}

/// A broadcast medium shared by every bus instance.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Publish bytes on a channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), NexusError>;

    /// Subscribe to a set of channels. The stream ends when the connection drops.
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, TransportMessage>, NexusError>;
}

/// In-process transport over `tokio::sync::broadcast`.
///
/// Clones share the same medium, so two buses built with clones of one
/// `InMemoryTransport` observe each other's events.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    sender: broadcast::Sender<TransportMessage>,
}

impl InMemoryTransport {
    /// Default broadcast buffer.
    pub const DEFAULT_CAPACITY: usize = 4096;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Current number of subscribed receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterTransport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), NexusError> {
        // No receivers is not an error: no peer is listening yet.
        let _ = self.sender.send(TransportMessage {
            channel: channel.to_string(),
            payload: payload.into(),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<BoxStream<'static, TransportMessage>, NexusError> {
        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(msg) if wanted.contains(&msg.channel) => Some(msg),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Transport receiver lagged, messages lost");
                    None
                }
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}
