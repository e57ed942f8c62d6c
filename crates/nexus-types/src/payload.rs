//! # Payload Variants
//!
//! Typed views over envelope payloads for the event categories Nexus itself
//! produces and consumes. Domain payloads stay opaque `serde_json::Value`s.

use crate::errors::{FailureReason, NexusError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object used for entity state and patches.
pub type StateMap = Map<String, Value>;

/// Body of an entity update request (`{service}:update:vN:requested`).
///
/// Accepts `{"patch": {...}, "replace": false}`; a payload without a
/// `patch` key is treated as the patch itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    pub patch: StateMap,
    #[serde(default)]
    pub replace: bool,
}

impl StatePatch {
    /// Extract a patch from a request payload.
    ///
    /// Returns `None` when the payload carries no object to merge.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let object = payload.as_object()?;
        match object.get("patch") {
            Some(Value::Object(patch)) => Some(Self {
                patch: patch.clone(),
                replace: object
                    .get("replace")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            Some(_) => None,
            None => Some(Self {
                patch: object.clone(),
                replace: false,
            }),
        }
    }
}

/// Body of `{entity_type}:state:v1:success`, the result of an applied update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub entity_id: String,
    pub entity_type: String,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    pub patch: StateMap,
    pub state: StateMap,
    #[serde(default)]
    pub replace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

/// Incremental chunk emitted by a stream worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub sequence: u64,
    pub data: Value,
}

/// Keep-alive emitted on the `stream` state when a session is otherwise quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub heartbeat: bool,
    pub sequence: u64,
    pub elapsed_ms: u64,
}

impl Heartbeat {
    #[must_use]
    pub fn new(sequence: u64, elapsed_ms: u64) -> Self {
        Self {
            heartbeat: true,
            sequence,
            elapsed_ms,
        }
    }
}

/// Body of every `*:failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: FailureReason,
    pub message: String,
}

impl From<&NexusError> for Failure {
    fn from(err: &NexusError) -> Self {
        Self {
            reason: err.reason(),
            message: err.to_string(),
        }
    }
}

/// Encode a typed payload into the envelope's value slot.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Value, NexusError> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_wrapped() {
        let p = StatePatch::from_payload(&json!({"patch": {"title": "X"}, "replace": true})).unwrap();
        assert_eq!(p.patch.get("title"), Some(&json!("X")));
        assert!(p.replace);
    }

    #[test]
    fn test_patch_bare_object() {
        let p = StatePatch::from_payload(&json!({"title": "X", "budget": 10})).unwrap();
        assert_eq!(p.patch.len(), 2);
        assert!(!p.replace);
    }

    #[test]
    fn test_patch_missing() {
        assert!(StatePatch::from_payload(&json!(null)).is_none());
        assert!(StatePatch::from_payload(&json!([1, 2])).is_none());
        assert!(StatePatch::from_payload(&json!({"patch": 3})).is_none());
    }

    #[test]
    fn test_failure_from_error() {
        let f = Failure::from(&NexusError::WorkerPanic("boom".into()));
        assert_eq!(f.reason, FailureReason::WorkerPanic);
        assert!(f.message.contains("boom"));
        let v = to_payload(&f).unwrap();
        assert_eq!(v["reason"], "worker_panic");
    }

    #[test]
    fn test_heartbeat_shape() {
        let v = to_payload(&Heartbeat::new(3, 1000)).unwrap();
        assert_eq!(v, json!({"heartbeat": true, "sequence": 3, "elapsed_ms": 1000}));
    }
}
