//! # Adapters
//!
//! Implementations of component ports for the node: the event sink shared by
//! handlers and the gateway, and file-backed entity persistence.

pub mod entity_sink;
pub mod snapshot_hook;

pub use entity_sink::EntitySink;
pub use snapshot_hook::FileSnapshotHook;
