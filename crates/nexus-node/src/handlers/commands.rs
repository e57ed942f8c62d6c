//! # Entity Command Handler
//!
//! Serves `{entity_type}:{update|state|list}:vN:requested` events published
//! on this node.
//!
//! ## Update Flow
//!
//! ```text
//! requested ──► started ──► apply_update ──► {entity_type}:state:v1:success ──► success
//!                               │                    (bus only; local sockets
//!                               │                     were notified by the store)
//!                               └── error ──► failed {reason, message}
//! ```

use crate::adapters::EntitySink;
use async_trait::async_trait;
use nexus_bus::EventHandler;
use nexus_state::{EntityStateStore, UpdateMeta};
use nexus_types::payload::to_payload;
use nexus_types::{EventEnvelope, EventSink, EventState, Failure, NexusError, StateChange, StatePatch};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const UPDATE_ACTION: &str = "update";
pub const STATE_ACTION: &str = "state";
pub const LIST_ACTION: &str = "list";

/// Handles entity reads and writes requested by clients of this node.
pub struct EntityCommandHandler {
    store: Arc<EntityStateStore>,
    sink: Arc<EntitySink>,
}

impl EntityCommandHandler {
    #[must_use]
    pub fn new(store: Arc<EntityStateStore>, sink: Arc<EntitySink>) -> Arc<Self> {
        Arc::new(Self { store, sink })
    }

    /// Subscription patterns for `entity_type`.
    #[must_use]
    pub fn patterns(entity_type: &str) -> Vec<String> {
        [UPDATE_ACTION, STATE_ACTION, LIST_ACTION]
            .iter()
            .map(|action| format!("{entity_type}:{action}:*:requested"))
            .collect()
    }

    async fn execute(&self, request: &EventEnvelope) -> Result<Value, NexusError> {
        match request.event_type.action() {
            UPDATE_ACTION => self.update(request).await,
            STATE_ACTION => {
                let snapshot = self.store.load_or_create(required_entity(request)?).await?;
                to_payload(&snapshot)
            }
            LIST_ACTION => Ok(json!({ "entities": self.store.list_entities() })),
            other => Err(NexusError::invalid_type(
                request.event_type.to_string(),
                format!("no command handler for action '{other}'"),
            )),
        }
    }

    async fn update(&self, request: &EventEnvelope) -> Result<Value, NexusError> {
        let entity_id = required_entity(request)?;
        self.sink.emit(request.reply(EventState::Started, json!({}))).await?;

        // Restore persisted state before the first write merges into it.
        self.store.load_or_create(entity_id).await?;

        let patch = StatePatch::from_payload(&request.payload);
        let meta = UpdateMeta {
            replace: patch.as_ref().is_some_and(|p| p.replace),
            correlation_id: Some(request.correlation_id.clone()),
            source: request.metadata.source.clone(),
        };
        let state_event = self
            .store
            .apply_update(
                entity_id,
                request.metadata.actor_id.as_deref(),
                patch.map(|p| p.patch),
                meta,
            )
            .await?;

        let change: StateChange = state_event.decode_payload()?;
        self.sink.bus().publish(state_event).await?;

        Ok(json!({
            "entity_id": change.entity_id,
            "version": change.version,
            "state": change.state,
        }))
    }
}

fn required_entity(request: &EventEnvelope) -> Result<&str, NexusError> {
    match request.entity_id.as_deref() {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(NexusError::Validation("entity_id is required".into())),
    }
}

#[async_trait]
impl EventHandler for EntityCommandHandler {
    async fn handle(&self, request: Arc<EventEnvelope>) -> Result<(), NexusError> {
        match self.execute(&request).await {
            Ok(result) => {
                debug!(event_type = %request.event_type, correlation_id = %request.correlation_id, "Command completed");
                self.sink.emit(request.reply(EventState::Success, result)).await
            }
            Err(err) => {
                warn!(
                    event_type = %request.event_type,
                    correlation_id = %request.correlation_id,
                    error = %err,
                    "Command failed"
                );
                let payload = to_payload(&Failure::from(&err))?;
                self.sink.emit(request.reply(EventState::Failed, payload)).await
            }
        }
    }
}
