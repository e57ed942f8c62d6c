//! # Event Deduplication
//!
//! Two layers keep one envelope from being processed twice:
//!
//! - [`DedupStore`]: a short-lived claim keyed by `event_id`, shared between
//!   bus instances. Only the first instance to publish an id delivers it.
//! - [`TtlSet`]: a per-instance set of ids already delivered locally, so a
//!   cross-instance replay of an event seen here is dropped.
//!
//! ## Expiry
//!
//! - Entries expire after their TTL (default 3s, see [`crate::DEFAULT_DEDUP_TTL`])
//! - Expired entries are garbage-collected lazily on insert, at most once per GC interval
//! - Memory is bounded by publish rate × TTL

use async_trait::async_trait;
use nexus_types::NexusError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Set of ids that forget themselves after a TTL.
#[derive(Debug)]
pub struct TtlSet {
    /// id -> expiry instant.
    entries: HashMap<String, Instant>,

    /// Last garbage collection.
    last_gc: Instant,

    /// Garbage collection interval.
    gc_interval: Duration,
}

impl TtlSet {
    /// Default garbage collection interval.
    pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new() -> Self {
        Self::with_gc_interval(Self::DEFAULT_GC_INTERVAL)
    }

    #[must_use]
    pub fn with_gc_interval(gc_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            last_gc: Instant::now(),
            gc_interval,
        }
    }

    /// Insert `id` unless a live entry exists. Returns `true` when inserted.
    pub fn insert_if_absent(&mut self, id: &str, ttl: Duration) -> bool {
        self.insert_if_absent_at(id, ttl, Instant::now())
    }

    /// Same as [`insert_if_absent`](Self::insert_if_absent) with an explicit clock.
    pub fn insert_if_absent_at(&mut self, id: &str, ttl: Duration, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_gc) >= self.gc_interval {
            self.garbage_collect(now);
            self.last_gc = now;
        }

        match self.entries.get(id) {
            Some(expiry) if *expiry > now => false,
            _ => {
                self.entries.insert(id.to_string(), now + ttl);
                true
            }
        }
    }

    /// Whether `id` has a live entry.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|expiry| *expiry > Instant::now())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn garbage_collect(&mut self, now: Instant) {
        self.entries.retain(|_, expiry| *expiry > now);
    }
}

impl Default for TtlSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared claim store keyed by event id.
///
/// A distributed deployment backs this with a key/value store offering
/// set-if-absent with expiry; [`InMemoryDedupStore`] shares one set between
/// bus instances in the same process.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Claim `event_id` for `ttl`. Returns `true` when this caller won the claim.
    async fn claim(&self, event_id: &str, ttl: Duration) -> Result<bool, NexusError>;
}

/// In-process [`DedupStore`]. Clone the `Arc` to share it between buses.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    set: Mutex<TtlSet>,
}

impl InMemoryDedupStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked claims (including not yet collected expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn claim(&self, event_id: &str, ttl: Duration) -> Result<bool, NexusError> {
        Ok(self.set.lock().insert_if_absent(event_id, ttl))
    }
}
