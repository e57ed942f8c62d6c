//! # Nexus Stream - Streaming Lifecycle Controller
//!
//! Turns a `{service}:{action}:v{n}:requested` event on a streaming-capable
//! action into a supervised session:
//!
//! ```text
//! requested ──► started ──► stream* ──► success
//!                                  └──► failed (handler_error | worker_panic | timeout | cancelled)
//! ```
//!
//! ## Guarantees
//!
//! - Every accepted request ends with exactly one terminal event, whatever
//!   the handler does (returns, errors, panics, hangs).
//! - No `*:stream` event follows the terminal event.
//! - A quiet session emits a heartbeat `*:stream` every interval.
//! - At most `max_sessions` sessions run at once; the rest get `Busy`.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod config;
pub mod controller;
pub mod emitter;
pub mod session;

pub use config::StreamConfig;
pub use controller::{
    stream_handler_fn, FnStreamHandler, StreamContext, StreamController, StreamControllerBuilder,
    StreamHandler, StreamStats,
};
pub use emitter::ChunkEmitter;
pub use session::{SessionInfo, SessionPhase, StreamSession};
