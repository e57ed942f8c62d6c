//! # Nexus Bus - Event Bus with Cross-Instance Replication
//!
//! Topic-based pub/sub for [`EventEnvelope`](nexus_types::EventEnvelope)s.
//! Every instance of a deployment runs one [`EventBus`]; a
//! [`ClusterTransport`] connects them so that an event published anywhere
//! reaches subscribers everywhere.
//!
//! ```text
//!   Instance A                                   Instance B
//! ┌──────────────┐   outbound    ┌───────────┐   receiver   ┌──────────────┐
//! │  EventBus    │ ────────────► │ Transport │ ───────────► │  EventBus    │
//! │  workers[N]  │ ◄──────────── │           │ ◄─────────── │  workers[N]  │
//! └──────────────┘   receiver    └───────────┘   outbound   └──────────────┘
//!        │                                                         │
//!   local handlers                                           local handlers
//! ```
//!
//! ## Guarantees
//!
//! - **Validated**: only catalog-registered `service:action` pairs are accepted
//! - **Deduplicated**: one `event_id` is delivered at most once per instance
//!   within the dedup TTL
//! - **Non-blocking**: publishers never wait on subscribers; overflow drops
//!   and counts
//! - **Loop-free**: every envelope carries its origin instance; echoes are ignored
//!
//! Delivery across instances is best-effort and at-least-once within the TTL.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

mod bridge;
pub mod bus;
pub mod dedup;
pub mod handler;
pub mod pattern;
pub mod subscriber;
pub mod transport;
mod worker;

pub use bus::{BusConfig, BusStats, EventBus, EventBusBuilder, EventPublisher, PublishOutcome};
pub use dedup::{DedupStore, InMemoryDedupStore, TtlSet};
pub use handler::{handler_fn, DeliveryScope, EventHandler, FnHandler};
pub use pattern::EventPattern;
pub use subscriber::{EventStream, SubscriptionError, SubscriptionHandle};
pub use transport::{ClusterTransport, InMemoryTransport, TransportMessage};

use std::time::Duration;

/// How long an event id stays claimed and remembered.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3);
