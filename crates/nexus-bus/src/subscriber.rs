//! # Subscriptions
//!
//! The subscription table and the handles returned to subscribers.
//!
//! A handle unsubscribes when dropped, so a subscriber's lifetime is tied to
//! the value it holds.

use crate::handler::{DeliveryScope, EventHandler};
use crate::pattern::EventPattern;
use futures::Stream;
use nexus_types::EventEnvelope;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors from subscription operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The event bus was closed.
    #[error("Event bus closed")]
    Closed,
}

/// Where matching events go.
#[derive(Clone)]
pub(crate) enum Target {
    /// Callback run on a delivery worker.
    Handler(Arc<dyn EventHandler>),
    /// Bounded channel read by an [`EventStream`].
    Sink(mpsc::Sender<Arc<EventEnvelope>>),
}

#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) id: u64,
    pub(crate) patterns: Vec<EventPattern>,
    pub(crate) scope: DeliveryScope,
    pub(crate) target: Target,
}

impl Registration {
    fn accepts(&self, envelope: &EventEnvelope, local_origin: bool) -> bool {
        let scope_ok = match self.scope {
            DeliveryScope::All => true,
            DeliveryScope::LocalOrigin => local_origin,
        };
        scope_ok && self.patterns.iter().any(|p| p.matches_envelope(envelope))
    }
}

/// All live registrations of one bus.
#[derive(Default)]
pub(crate) struct SubscriberTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Registration>>,
}

impl SubscriberTable {
    pub(crate) fn insert(
        &self,
        patterns: Vec<EventPattern>,
        scope: DeliveryScope,
        target: Target,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.write().insert(
            id,
            Registration {
                id,
                patterns,
                scope,
                target,
            },
        );
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    /// Registrations accepting this envelope, cloned out of the lock.
    pub(crate) fn matching(&self, envelope: &EventEnvelope, local_origin: bool) -> Vec<Registration> {
        self.entries
            .read()
            .values()
            .filter(|r| r.accepts(envelope, local_origin))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Handle for a registered subscription. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    id: u64,
    table: Weak<SubscriberTable>,
    label: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, table: &Arc<SubscriberTable>, label: String) -> Self {
        Self {
            id,
            table: Arc::downgrade(table),
            label,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscription now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("patterns", &self.label)
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if table.remove(self.id) {
                debug!(subscription = self.id, patterns = %self.label, "Subscription dropped");
            }
        }
    }
}

/// Channel-backed subscription implementing `Stream`.
///
/// The channel is bounded; when the reader falls behind, the bus drops
/// events for this stream only.
pub struct EventStream {
    receiver: mpsc::Receiver<Arc<EventEnvelope>>,
    handle: SubscriptionHandle,
}

impl EventStream {
    pub(crate) fn new(receiver: mpsc::Receiver<Arc<EventEnvelope>>, handle: SubscriptionHandle) -> Self {
        Self { receiver, handle }
    }

    /// Receive the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.receiver.recv().await
    }

    /// Receive without waiting.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(event))` - An event was available
    /// - `Ok(None)` - Nothing queued right now
    /// - `Err(SubscriptionError::Closed)` - The bus was dropped
    pub fn try_recv(&mut self) -> Result<Option<Arc<EventEnvelope>>, SubscriptionError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(SubscriptionError::Closed),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle.id()
    }
}

impl Stream for EventStream {
    type Item = Arc<EventEnvelope>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
