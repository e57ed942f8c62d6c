//! # Persistence
//!
//! Durable storage is a lagging mirror of the in-memory store. Writes are
//! queued after each update and performed by one background worker; a
//! failing write never rolls back memory.
//!
//! ## Degraded Mode
//!
//! ```text
//! [HEALTHY] ──write exhausts retries──► [DEGRADED] (entity marked dirty)
//!     ▲                                     │
//!     │                                     ├── write fails ──► stay, mark dirty
//!     ├──── write succeeds: reconcile ◄─────┤
//!     │     (persist full snapshot of       │
//!     │      every dirty entity)            │
//!     └──── probe timer: reconcile ◄────────┘
//! ```
//!
//! A full queue never blocks the writer either: the entity is marked dirty
//! and picked up by the next reconciliation. Reconciliation runs after
//! every successful write and, while the dirty set is non-empty, on a probe
//! timer that follows the retry backoff, so recovery does not wait for new
//! updates.

use crate::config::PersistConfig;
use async_trait::async_trait;
use nexus_telemetry::{PERSISTENCE_DEGRADED, PERSIST_FAILURES};
use nexus_types::{ExponentialBackoff, NexusError, StateMap};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors reported by a [`PersistHook`].
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    /// Attach the entity id and lift into the shared taxonomy.
    #[must_use]
    pub fn for_entity(self, entity_id: &str) -> NexusError {
        NexusError::Persistence {
            entity_id: entity_id.to_string(),
            message: self.to_string(),
        }
    }
}

/// Durable write supplied by the host application.
///
/// Without a hook the store runs purely in memory.
#[async_trait]
pub trait PersistHook: Send + Sync {
    /// Write `patch` for `entity_id`. Reconciliation passes the full state.
    async fn persist(&self, entity_id: &str, patch: &StateMap) -> Result<(), PersistenceError>;

    /// Previously persisted state, consulted when an entity is first created.
    async fn load(&self, _entity_id: &str) -> Result<Option<StateMap>, PersistenceError> {
        Ok(None)
    }
}

/// One queued write.
#[derive(Debug)]
pub(crate) struct PersistJob {
    pub(crate) entity_id: String,
    pub(crate) patch: StateMap,
}

/// Health shared between the store and its persistence worker.
#[derive(Debug, Default)]
pub struct PersistenceState {
    degraded: AtomicBool,
    dirty: Mutex<HashSet<String>>,
    written: AtomicU64,
    failed: AtomicU64,
    reconciled: AtomicU64,
}

impl PersistenceState {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Entities whose latest state may not be in durable storage.
    #[must_use]
    pub fn dirty_entities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.dirty.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Writes that exhausted their retries.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reconciled(&self) -> u64 {
        self.reconciled.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_dirty(&self, entity_id: &str) {
        self.dirty.lock().insert(entity_id.to_string());
    }

    pub(crate) fn is_dirty(&self, entity_id: &str) -> bool {
        self.dirty.lock().contains(entity_id)
    }

    fn has_dirty(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    fn enter_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            PERSISTENCE_DEGRADED.set(1.0);
            warn!("Persistence unavailable, running in-memory only");
        }
    }

    fn leave_degraded(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            PERSISTENCE_DEGRADED.set(0.0);
            info!("Persistence recovered");
        }
    }

    fn take_dirty(&self) -> Vec<String> {
        self.dirty.lock().drain().collect()
    }
}

/// Source of full entity state for reconciliation.
pub(crate) trait SnapshotSource: Send + Sync {
    fn full_state(&self, entity_id: &str) -> Option<StateMap>;
}

/// Background writer: drains the queue, retries, reconciles.
pub(crate) struct PersistenceWorker {
    hook: Arc<dyn PersistHook>,
    config: PersistConfig,
    state: Arc<PersistenceState>,
    source: std::sync::Weak<dyn SnapshotSource>,
}

impl PersistenceWorker {
    pub(crate) fn new(
        hook: Arc<dyn PersistHook>,
        config: PersistConfig,
        state: Arc<PersistenceState>,
        source: std::sync::Weak<dyn SnapshotSource>,
    ) -> Self {
        Self {
            hook,
            config,
            state,
            source,
        }
    }

    pub(crate) async fn run(self, mut queue: mpsc::Receiver<PersistJob>, cancel: CancellationToken) {
        debug!("Persistence worker started");
        let mut probe = ExponentialBackoff::new(self.config.base_delay, self.config.max_delay, 2.0, 0.1);
        loop {
            let wait = if self.state.has_dirty() {
                Some(probe.next_delay())
            } else {
                probe.reset();
                None
            };

            let job = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                () = sleep_for(wait) => {
                    debug!("Probing storage for reconciliation");
                    if self.reconcile(&cancel).await {
                        self.state.leave_degraded();
                    }
                    continue;
                }
            };

            if self.write_with_retry(&job.entity_id, &job.patch, &cancel).await {
                self.state.leave_degraded();
                self.reconcile(&cancel).await;
            } else {
                self.state.mark_dirty(&job.entity_id);
                self.state.enter_degraded();
            }
        }
        debug!("Persistence worker stopped");
    }

    /// Returns `true` once a write succeeds; `false` after `max_attempts` or on cancel.
    async fn write_with_retry(&self, entity_id: &str, patch: &StateMap, cancel: &CancellationToken) -> bool {
        let mut backoff = ExponentialBackoff::new(self.config.base_delay, self.config.max_delay, 2.0, 0.1);
        let attempts = self.config.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.hook.persist(entity_id, patch).await {
                Ok(()) => {
                    self.state.written.fetch_add(1, Ordering::Relaxed);
                    debug!(entity_id, attempt, "Entity persisted");
                    return true;
                }
                Err(e) => {
                    let err = e.for_entity(entity_id);
                    if attempt == attempts {
                        self.state.failed.fetch_add(1, Ordering::Relaxed);
                        PERSIST_FAILURES.inc();
                        error!(entity_id, attempts, error = %err, "Persistence retries exhausted");
                        return false;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        entity_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Persistence failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return false,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        false
    }

    /// Rewrite every dirty entity in full. Returns `true` when none is left
    /// dirty; the first failure stops the pass and keeps the rest dirty.
    async fn reconcile(&self, cancel: &CancellationToken) -> bool {
        let Some(source) = self.source.upgrade() else {
            return true;
        };
        let dirty = self.state.take_dirty();
        if dirty.is_empty() {
            return true;
        }
        info!(entities = dirty.len(), "Reconciling entities written while degraded");

        let mut pending = dirty.into_iter();
        while let Some(entity_id) = pending.next() {
            // Evicted since: nothing left to mirror.
            let Some(state) = source.full_state(&entity_id) else {
                continue;
            };
            if self.write_with_retry(&entity_id, &state, cancel).await {
                self.state.reconciled.fetch_add(1, Ordering::Relaxed);
            } else {
                self.state.mark_dirty(&entity_id);
                for rest in pending {
                    self.state.mark_dirty(&rest);
                }
                self.state.enter_degraded();
                return false;
            }
        }
        !self.state.has_dirty()
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// In-memory [`PersistHook`] with switchable failure, for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryPersistHook {
    records: Mutex<std::collections::HashMap<String, StateMap>>,
    writes: Mutex<Vec<(String, StateMap)>>,
    failing: AtomicBool,
}

impl MemoryPersistHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Merged persisted state of one entity.
    #[must_use]
    pub fn record(&self, entity_id: &str) -> Option<StateMap> {
        self.records.lock().get(entity_id).cloned()
    }

    /// Every successful write, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(String, StateMap)> {
        self.writes.lock().clone()
    }

    /// Pre-populate state returned by `load`.
    pub fn insert(&self, entity_id: &str, state: StateMap) {
        self.records.lock().insert(entity_id.to_string(), state);
    }
}

#[async_trait]
impl PersistHook for MemoryPersistHook {
    async fn persist(&self, entity_id: &str, patch: &StateMap) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("storage offline".into()));
        }
        let mut records = self.records.lock();
        let record = records.entry(entity_id.to_string()).or_default();
        for (key, value) in patch {
            record.insert(key.clone(), value.clone());
        }
        self.writes.lock().push((entity_id.to_string(), patch.clone()));
        Ok(())
    }

    async fn load(&self, entity_id: &str) -> Result<Option<StateMap>, PersistenceError> {
        Ok(self.records.lock().get(entity_id).cloned())
    }
}
