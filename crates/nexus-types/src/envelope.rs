//! # Event Envelope
//!
//! The transport-agnostic message unit moving through the bus.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "event_id": "0191c1b6-...",
//!   "event_type": "campaign:update:v1:requested",
//!   "correlation_id": "0191c1b6-...",
//!   "entity_id": "42",
//!   "payload": { "patch": { "title": "X" } },
//!   "metadata": { "actor_id": "u1", "partial": false, "timestamp": "2024-01-01T00:00:00Z" }
//! }
//! ```
//!
//! Event ids are UUIDv7: unique and time-ordered, so ids generated by one
//! producer sort in emission order.

use crate::errors::NexusError;
use crate::event_type::{EventState, EventType};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Generate a new time-ordered event id.
#[must_use]
pub fn new_event_id() -> String {
    Uuid::now_v7().to_string()
}

/// Structured context attached to every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// The payload is a partial update rather than a full document.
    #[serde(default)]
    pub partial: bool,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Bus instance that first published this envelope. Used for loop prevention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_instance: Option<String>,

    /// Anything else the producer attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            actor_id: None,
            session_id: None,
            device_id: None,
            source: None,
            partial: false,
            timestamp: Utc::now(),
            origin_instance: None,
            extra: Map::new(),
        }
    }
}

/// The canonical event message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: EventType,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Lenient shape used to tell malformed JSON apart from a bad event type.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    metadata: Option<Value>,
}

impl EventEnvelope {
    /// Create an envelope with a fresh id. The correlation id starts equal to the event id.
    #[must_use]
    pub fn new(event_type: EventType, payload: Value) -> Self {
        let event_id = new_event_id();
        Self {
            correlation_id: event_id.clone(),
            event_id,
            event_type,
            entity_id: None,
            entity_type: None,
            payload,
            metadata: EventMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    #[must_use]
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.metadata.actor_id = Some(actor_id.into());
        self
    }

    #[must_use]
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Derive a sibling event in the same lifecycle: same service, action,
    /// version, correlation and entity; new id, new state, new payload.
    #[must_use]
    pub fn reply(&self, state: EventState, payload: Value) -> Self {
        Self {
            event_id: new_event_id(),
            event_type: self.event_type.with_state(state),
            correlation_id: self.correlation_id.clone(),
            entity_id: self.entity_id.clone(),
            entity_type: self.entity_type.clone(),
            payload,
            metadata: EventMetadata {
                actor_id: self.metadata.actor_id.clone(),
                session_id: self.metadata.session_id.clone(),
                device_id: self.metadata.device_id.clone(),
                source: self.metadata.source.clone(),
                ..EventMetadata::default()
            },
        }
    }

    /// `service:action` topic of this event.
    #[must_use]
    pub fn topic(&self) -> String {
        self.event_type.topic()
    }

    #[must_use]
    pub fn state(&self) -> EventState {
        self.event_type.state()
    }

    /// Decode the payload into a typed view.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, NexusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<String, NexusError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire format.
    ///
    /// Missing `event_id` gets a fresh id, missing `correlation_id` falls back
    /// to the event id, missing payload becomes `{}`.
    ///
    /// # Errors
    ///
    /// - `Serialization` when the input is not a JSON object of the right shape
    /// - `InvalidEventType` when `event_type` is missing or violates the grammar
    pub fn from_json(raw: &str) -> Result<Self, NexusError> {
        let wire: WireEnvelope = serde_json::from_str(raw)?;

        let raw_type = wire
            .event_type
            .ok_or_else(|| NexusError::invalid_type("", "missing event_type"))?;
        let event_type = EventType::parse(&raw_type)?;

        let event_id = wire
            .event_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_event_id);
        let correlation_id = wire
            .correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| event_id.clone());
        let metadata = match wire.metadata {
            Some(value) => serde_json::from_value(value)?,
            None => EventMetadata::default(),
        };

        Ok(Self {
            event_id,
            event_type,
            correlation_id,
            entity_id: wire.entity_id.filter(|id| !id.is_empty()),
            entity_type: wire.entity_type.filter(|t| !t.is_empty()),
            payload: wire.payload.unwrap_or_else(empty_object),
            metadata,
        })
    }
}
