//! # Nexus Types Crate
//!
//! The wire contract shared by every Nexus component: the [`EventEnvelope`],
//! the canonical `{service}:{action}:v{version}:{state}` grammar, the
//! immutable service catalog with its validator, typed payload views and the
//! [`NexusError`] taxonomy.
//!
//! ## Design Principles
//!
//! - **Validated at the edge**: an [`EventType`] can only hold a grammar-valid
//!   name; the [`EventValidator`] additionally requires a registered
//!   `service:action` before anything enters the bus.
//! - **Immutable catalog**: loaded once at boot, shared as `Arc<EventCatalog>`,
//!   read without locks.
//! - **Tagged payloads, opaque fallback**: Nexus-produced categories have typed
//!   views in [`payload`]; domain payloads stay `serde_json::Value`.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod backoff;
pub mod catalog;
pub mod duration_serde;
pub mod envelope;
pub mod errors;
pub mod event_type;
pub mod payload;
pub mod ports;

pub use backoff::ExponentialBackoff;
pub use catalog::{EventCatalog, EventValidator, ValidatedType, STREAMING_MARKER};
pub use envelope::{new_event_id, EventEnvelope, EventMetadata};
pub use errors::{panic_message, FailureReason, NexusError};
pub use event_type::{EventState, EventType};
pub use payload::{Failure, Heartbeat, StateChange, StateMap, StatePatch, StreamChunk};
pub use ports::{EventSink, RecordingSink};

/// Default cross-instance channel for topics without a dedicated channel.
pub const DEFAULT_CHANNEL: &str = "nexus:events";

/// Cross-instance channel name for a `service:action` topic.
#[must_use]
pub fn topic_channel(topic: &str) -> String {
    format!("{DEFAULT_CHANNEL}:{topic}")
}

/// Entity id used when a client does not name one.
pub const DEFAULT_ENTITY_ID: &str = "0";
