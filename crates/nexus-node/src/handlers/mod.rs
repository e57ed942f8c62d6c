//! # Built-in Handlers
//!
//! Bus handlers and stream handlers the node wires at startup.

pub mod commands;
pub mod routing;
pub mod streams;

pub use commands::{EntityCommandHandler, LIST_ACTION, STATE_ACTION, UPDATE_ACTION};
pub use routing::{EntityRouter, StreamRouter};
pub use streams::{
    AnalyticsStreamHandler, StateStreamHandler, STREAM_ANALYTICS_ACTION, STREAM_STATE_ACTION,
};
