//! # Event Routing
//!
//! Bus subscriptions that connect the bus to the entity store and the
//! stream controller.
//!
//! | Handler | Scope | Events |
//! |---------|-------|--------|
//! | [`EntityRouter`] | all instances | entity-scoped non-request events from peers |
//! | [`StreamRouter`] | local origin | streaming-capable requests |

use crate::adapters::entity_sink::fanout_target;
use async_trait::async_trait;
use nexus_bus::EventHandler;
use nexus_state::EntityStateStore;
use nexus_stream::StreamController;
use nexus_types::payload::to_payload;
use nexus_types::{EventEnvelope, EventSink, EventState, Failure, NexusError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Brings events published on other instances to this node's entity subscribers.
///
/// `{entity_type}:state:v1:success` events carrying a state change are
/// applied to the local store before fan-out; everything else entity-scoped
/// is forwarded as is. Events of local origin were already fanned out when
/// they were emitted and are skipped.
pub struct EntityRouter {
    instance_id: String,
    entity_type: String,
    store: Arc<EntityStateStore>,
}

impl EntityRouter {
    #[must_use]
    pub fn new(instance_id: impl Into<String>, store: Arc<EntityStateStore>) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.into(),
            entity_type: store.config().entity_type.clone(),
            store,
        })
    }

    fn is_state_change(&self, envelope: &EventEnvelope) -> bool {
        envelope.event_type.service() == self.entity_type
            && envelope.event_type.action() == "state"
            && envelope.state() == EventState::Success
    }
}

#[async_trait]
impl EventHandler for EntityRouter {
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> Result<(), NexusError> {
        if envelope.metadata.origin_instance.as_deref() == Some(self.instance_id.as_str()) {
            return Ok(());
        }
        let Some(entity_id) = fanout_target(&envelope).map(str::to_string) else {
            return Ok(());
        };

        if self.is_state_change(&envelope) {
            match self.store.apply_replicated(envelope.clone()).await {
                Ok(version) => {
                    debug!(entity_id = %entity_id, version, origin = ?envelope.metadata.origin_instance, "Remote state applied");
                    return Ok(());
                }
                // A `state` read reply: a snapshot, not a change.
                Err(NexusError::Serialization(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.store.notify(&entity_id, envelope).await;
        Ok(())
    }
}

/// Starts stream sessions for streaming-capable requests published on this node.
pub struct StreamRouter {
    controller: Arc<StreamController>,
    sink: Arc<dyn EventSink>,
}

impl StreamRouter {
    #[must_use]
    pub fn new(controller: Arc<StreamController>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self { controller, sink })
    }

    /// One `{topic}:*:requested` pattern per registered stream handler.
    #[must_use]
    pub fn patterns(controller: &StreamController) -> Vec<String> {
        controller
            .topics()
            .into_iter()
            .map(|topic| format!("{topic}:*:requested"))
            .collect()
    }
}

#[async_trait]
impl EventHandler for StreamRouter {
    async fn handle(&self, request: Arc<EventEnvelope>) -> Result<(), NexusError> {
        if !self.controller.is_streaming(&request) {
            return Ok(());
        }
        match self.controller.start((*request).clone()).await {
            Ok(session_id) => {
                debug!(session_id = %session_id, event_type = %request.event_type, "Stream session routed");
                Ok(())
            }
            Err(err @ NexusError::Busy { .. }) => {
                warn!(event_type = %request.event_type, error = %err, "Stream request rejected");
                let payload = to_payload(&Failure::from(&err))?;
                self.sink.emit(request.reply(EventState::Failed, payload)).await
            }
            Err(NexusError::Closed) => Ok(()),
            Err(err) => {
                warn!(event_type = %request.event_type, error = %err, "Stream request ignored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_state::StoreConfig;
    use nexus_stream::{stream_handler_fn, StreamConfig};
    use nexus_types::{EventType, FailureReason, RecordingSink, StateChange};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    fn remote(raw: &str, entity: &str, payload: Value) -> Arc<EventEnvelope> {
        let mut envelope = EventEnvelope::new(EventType::parse(raw).unwrap(), payload).with_entity(entity);
        envelope.metadata.origin_instance = Some("peer".into());
        Arc::new(envelope)
    }

    fn change(entity: &str, version: u64, patch: Value) -> Value {
        let patch = patch.as_object().unwrap().clone();
        to_payload(&StateChange {
            entity_id: entity.into(),
            entity_type: "campaign".into(),
            version,
            last_updated: chrono::Utc::now(),
            state: patch.clone(),
            patch,
            replace: false,
            actor_id: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_remote_state_change_applied_and_fanned_out() {
        let store = EntityStateStore::new(StoreConfig::default());
        let router = EntityRouter::new("self", store.clone());
        let mut sub = store.subscribe("42", "u1").unwrap();

        router
            .handle(remote("campaign:state:v1:success", "42", change("42", 3, json!({"title": "X"}))))
            .await
            .unwrap();

        let snapshot = store.snapshot("42").unwrap();
        assert_eq!(snapshot.state.get("title"), Some(&json!("X")));
        assert_eq!(snapshot.version, 3);
        let got = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(got.event_type.to_string(), "campaign:state:v1:success");
    }

    #[tokio::test]
    async fn test_remote_lifecycle_event_forwarded() {
        let store = EntityStateStore::new(StoreConfig::default());
        let router = EntityRouter::new("self", store.clone());
        let mut sub = store.subscribe("42", "u1").unwrap();

        router
            .handle(remote("campaign:update:v1:started", "42", json!({})))
            .await
            .unwrap();
        // A snapshot reply is forwarded without touching state.
        router
            .handle(remote("campaign:state:v1:success", "42", json!({"entity_id": "42", "state": {}})))
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(first.state(), EventState::Started);
        let second = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(second.event_type.action(), "state");
        assert_eq!(store.snapshot("42").unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_local_and_request_events_skipped() {
        let store = EntityStateStore::new(StoreConfig::default());
        let router = EntityRouter::new("self", store.clone());
        let mut sub = store.subscribe("42", "u1").unwrap();

        let mut local = EventEnvelope::new(EventType::parse("campaign:update:v1:success").unwrap(), json!({}))
            .with_entity("42");
        local.metadata.origin_instance = Some("self".into());
        router.handle(Arc::new(local)).await.unwrap();
        router
            .handle(remote("campaign:update:v1:requested", "42", json!({})))
            .await
            .unwrap();

        assert!(sub.try_recv().is_none());
    }

    fn controller(sink: Arc<RecordingSink>, max_sessions: usize) -> Arc<StreamController> {
        StreamController::builder(sink)
            .config(StreamConfig {
                max_sessions,
                ..StreamConfig::default()
            })
            .register(
                "campaign:stream_state",
                stream_handler_fn(|ctx| async move {
                    ctx.cancelled().await;
                    Ok(Value::Null)
                }),
            )
            .build()
    }

    fn stream_request() -> Arc<EventEnvelope> {
        Arc::new(EventEnvelope::new(
            EventType::parse("campaign:stream_state:v1:requested").unwrap(),
            json!({}),
        ))
    }

    #[tokio::test]
    async fn test_stream_router_busy_emits_failed() {
        let sink = Arc::new(RecordingSink::new());
        let controller = controller(sink.clone(), 1);
        let router = StreamRouter::new(controller.clone(), sink.clone());

        router.handle(stream_request()).await.unwrap();
        let rejected = stream_request();
        router.handle(rejected.clone()).await.unwrap();

        let failed: Vec<EventEnvelope> = sink
            .events()
            .into_iter()
            .filter(|e| e.state() == EventState::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].correlation_id, rejected.correlation_id);
        let failure: Failure = failed[0].decode_payload().unwrap();
        assert_eq!(failure.reason, FailureReason::Busy);
        assert_eq!(controller.active_count(), 1);
        controller.shutdown().await;
    }

    #[test]
    fn test_stream_patterns() {
        let controller = controller(Arc::new(RecordingSink::new()), 1);
        assert_eq!(
            StreamRouter::patterns(&controller),
            vec!["campaign:stream_state:*:requested"]
        );
    }
}
