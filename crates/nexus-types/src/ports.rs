//! # Ports
//!
//! Narrow traits that let components emit events without depending on the
//! concrete bus.

use crate::envelope::EventEnvelope;
use crate::errors::NexusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Anything that accepts envelopes for delivery.
///
/// The bus implements this; the stream controller and the node's command
/// handlers emit through it so lifecycle events share the ordinary delivery path.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit one event.
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), NexusError>;
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), NexusError> {
        (**self).emit(envelope).await
    }
}

/// Sink that records everything it receives. Useful for wiring tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    /// Recorded event type strings, in emission order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type.to_string())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), NexusError> {
        self.events.lock().push(envelope);
        Ok(())
    }
}
