//! # Nexus State - Entity State Store
//!
//! Authoritative in-memory state per entity, fanned out to every connected
//! subscriber and mirrored to durable storage in the background.
//!
//! ```text
//!   apply_update ──► [entity lock] ──► SubscriberRegistry::notify ──► client channels
//!                                  └─► persistence queue ──► PersistHook (retry, degrade)
//!   apply_replicated (peer StateChange) ──► [entity lock] ──► notify
//! ```
//!
//! ## Invariants
//!
//! - Mutations of one entity are serialized by its own lock; different
//!   entities never contend.
//! - `version` strictly increases per local update; `last_updated` never
//!   goes backwards.
//! - A slow or vanished subscriber never delays others beyond one send timeout.
//! - Persistence failures never roll back or block in-memory state.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod fanout;
pub mod persistence;
pub mod store;

pub use config::{FanoutConfig, PersistConfig, StoreConfig};
pub use fanout::{EntitySubscription, NotifyReport, SubscriberInfo, SubscriberRegistry, Unsubscribe};
pub use persistence::{MemoryPersistHook, PersistHook, PersistenceError, PersistenceState};
pub use store::{EntityAnalytics, EntitySnapshot, EntityStateStore, StoreStats, UpdateMeta};
