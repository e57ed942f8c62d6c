//! # Error Types
//!
//! The error taxonomy shared by every Nexus component.
//!
//! Errors local to one subscriber or one entity never propagate to others;
//! validation errors are returned synchronously so producers can react.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the bus, the state store, the stream controller and the gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NexusError {
    // =========================================================================
    // Rejected before entering the bus
    // =========================================================================
    /// Malformed or unregistered event type.
    #[error("Invalid event type '{event_type}': {reason}")]
    InvalidEventType { event_type: String, reason: String },

    /// Empty entity id, missing patch, or another malformed request.
    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Runtime failures
    // =========================================================================
    /// Durable write failed. Never affects in-memory state.
    #[error("Persistence failed for entity {entity_id}: {message}")]
    Persistence { entity_id: String, message: String },

    /// Subscriber channel stayed full past the send timeout.
    #[error("Slow consumer: subscriber {subscriber_id} did not accept event within {timeout_ms}ms")]
    SlowConsumer {
        subscriber_id: String,
        timeout_ms: u64,
    },

    /// Streaming session exceeded its deadline.
    #[error("Stream {session_id} timed out after {elapsed:?}")]
    StreamTimeout { session_id: String, elapsed: Duration },

    /// A worker panicked and was recovered.
    #[error("Worker panicked: {0}")]
    WorkerPanic(String),

    /// A concurrency bound was exceeded. Retry later.
    #[error("Busy: {resource} at capacity ({limit})")]
    Busy { resource: String, limit: usize },

    // =========================================================================
    // Plumbing
    // =========================================================================
    /// Envelope could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cross-instance transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation cancelled before completion.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A stream handler reported a domain failure.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// The component or channel has been shut down.
    #[error("Closed")]
    Closed,
}

impl NexusError {
    /// Build an `InvalidEventType` error.
    pub fn invalid_type(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEventType {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// Build a `Busy` error.
    pub fn busy(resource: impl Into<String>, limit: usize) -> Self {
        Self::Busy {
            resource: resource.into(),
            limit,
        }
    }

    /// Failure reason carried by `*:failed` payloads for this error.
    #[must_use]
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::InvalidEventType { .. } => FailureReason::InvalidEventType,
            Self::Validation(_) | Self::Serialization(_) => FailureReason::Validation,
            Self::Persistence { .. } => FailureReason::Persistence,
            Self::SlowConsumer { .. } => FailureReason::SlowConsumer,
            Self::StreamTimeout { .. } => FailureReason::Timeout,
            Self::WorkerPanic(_) => FailureReason::WorkerPanic,
            Self::Busy { .. } => FailureReason::Busy,
            Self::Cancelled(_) | Self::Closed => FailureReason::Cancelled,
            Self::Handler(_) | Self::Transport(_) => FailureReason::HandlerError,
        }
    }

    /// Whether the caller may retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. } | Self::Transport(_) | Self::Persistence { .. }
        )
    }
}

impl From<serde_json::Error> for NexusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Reason attached to a `*:failed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidEventType,
    Validation,
    Persistence,
    SlowConsumer,
    Timeout,
    WorkerPanic,
    Busy,
    Cancelled,
    HandlerError,
}

impl FailureReason {
    /// Stable label used in payloads and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidEventType => "invalid_event_type",
            Self::Validation => "validation",
            Self::Persistence => "persistence",
            Self::SlowConsumer => "slow_consumer",
            Self::Timeout => "timeout",
            Self::WorkerPanic => "worker_panic",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::HandlerError => "handler_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort text of a caught panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            NexusError::invalid_type("x", "bad").reason(),
            FailureReason::InvalidEventType
        );
        assert_eq!(
            NexusError::StreamTimeout {
                session_id: "s".into(),
                elapsed: Duration::from_secs(1)
            }
            .reason(),
            FailureReason::Timeout
        );
        assert_eq!(NexusError::busy("sessions", 4).reason(), FailureReason::Busy);
        assert_eq!(
            NexusError::WorkerPanic("boom".into()).reason(),
            FailureReason::WorkerPanic
        );
    }

    #[test]
    fn test_retryable() {
        assert!(NexusError::busy("sessions", 1).is_retryable());
        assert!(!NexusError::Validation("empty".into()).is_retryable());
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailureReason::WorkerPanic).unwrap();
        assert_eq!(json, "\"worker_panic\"");
        assert_eq!(FailureReason::HandlerError.to_string(), "handler_error");
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
