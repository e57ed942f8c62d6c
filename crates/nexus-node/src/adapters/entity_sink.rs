//! # Entity Sink
//!
//! Publishing path for events produced on this node.
//!
//! ```text
//! emit(event)
//!   ├─ bus.publish            (validate, dedup, local handlers, peers)
//!   └─ store.notify(entity)   (local sockets; only for entity-scoped,
//!                              non-request events that were not duplicates)
//! ```
//!
//! Peers receive the event through the bridge and fan it out to their own
//! sockets in the entity router, so every client sees the same lifecycle
//! regardless of which node it is connected to.

use async_trait::async_trait;
use nexus_bus::{EventBus, EventPublisher, PublishOutcome};
use nexus_state::EntityStateStore;
use nexus_types::{EventEnvelope, EventSink, EventState, NexusError};
use std::sync::Arc;

/// [`EventSink`] and [`EventPublisher`] that also feeds local entity subscribers.
pub struct EntitySink {
    bus: Arc<EventBus>,
    store: Arc<EntityStateStore>,
}

impl EntitySink {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, store: Arc<EntityStateStore>) -> Arc<Self> {
        Arc::new(Self { bus, store })
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

/// Entity whose subscribers should see `envelope`, if any.
pub(crate) fn fanout_target(envelope: &EventEnvelope) -> Option<&str> {
    match envelope.entity_id.as_deref() {
        Some(entity_id) if !entity_id.is_empty() && envelope.state() != EventState::Requested => {
            Some(entity_id)
        }
        _ => None,
    }
}

#[async_trait]
impl EventPublisher for EntitySink {
    async fn publish(&self, mut envelope: EventEnvelope) -> Result<PublishOutcome, NexusError> {
        envelope.metadata.origin_instance = Some(self.bus.instance_id().to_string());
        let local = fanout_target(&envelope).map(|entity_id| (entity_id.to_string(), envelope.clone()));

        let outcome = self.bus.publish(envelope).await?;
        if let (PublishOutcome::Delivered { .. }, Some((entity_id, envelope))) = (&outcome, local) {
            self.store.notify(&entity_id, Arc::new(envelope)).await;
        }
        Ok(outcome)
    }

    fn events_published(&self) -> u64 {
        self.bus.events_published()
    }
}

#[async_trait]
impl EventSink for EntitySink {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), NexusError> {
        EventPublisher::publish(self, envelope).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_state::StoreConfig;
    use nexus_types::{EventCatalog, EventType, EventValidator};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup() -> (Arc<EntitySink>, Arc<EntityStateStore>) {
        let catalog = EventCatalog::builder()
            .action("campaign", "update")
            .build()
            .unwrap();
        let bus = EventBus::builder(EventValidator::new(Arc::new(catalog))).build();
        bus.start();
        let store = EntityStateStore::new(StoreConfig::default());
        (EntitySink::new(bus, store.clone()), store)
    }

    fn event(state: EventState) -> EventEnvelope {
        EventEnvelope::new(EventType::new("campaign", "update", 1, state).unwrap(), json!({}))
            .with_entity("42")
    }

    #[tokio::test]
    async fn test_lifecycle_event_reaches_entity_subscribers() {
        let (sink, store) = setup();
        let mut sub = store.subscribe("42", "u1").unwrap();

        sink.emit(event(EventState::Started)).await.unwrap();

        let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(got.event_type.to_string(), "campaign:update:v1:started");
        assert_eq!(got.metadata.origin_instance.as_deref(), Some(sink.bus().instance_id()));
    }

    #[tokio::test]
    async fn test_requests_and_duplicates_not_fanned_out() {
        let (sink, store) = setup();
        let mut sub = store.subscribe("42", "u1").unwrap();

        sink.emit(event(EventState::Requested)).await.unwrap();
        let started = event(EventState::Started);
        sink.emit(started.clone()).await.unwrap();
        let outcome = EventPublisher::publish(&*sink, started).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Duplicate);

        let first = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(first.state(), EventState::Started);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_invalid_event_not_fanned_out() {
        let (sink, store) = setup();
        let mut sub = store.subscribe("42", "u1").unwrap();
        let bad = EventEnvelope::new(
            EventType::new("billing", "charge", 1, EventState::Success).unwrap(),
            json!({}),
        )
        .with_entity("42");

        assert!(sink.emit(bad).await.is_err());
        assert!(sub.try_recv().is_none());
    }
}
