//! # Entity State Store
//!
//! Concurrent map of entity id → current state. Each entity has its own
//! lock; the map itself is sharded, so contention grows with the number of
//! hot entities, not with the total.
//!
//! ## Update Path
//!
//! ```text
//! apply_update(id, actor, patch, meta)
//!   ├─ reject empty id / missing patch          (no lock taken)
//!   ├─ lock entity (bounded wait, else Busy)
//!   │     merge or replace, version += 1, last_updated = max(now, prev)
//!   ├─ unlock
//!   ├─ notify local subscribers                  (fan-out, bounded per subscriber)
//!   ├─ queue persistence                         (never blocks, never rolls back)
//!   └─ return {entity_type}:state:v1:success
//! ```
//!
//! ## Conflict Policy
//!
//! Last writer wins per top-level key. Updates to one entity apply in lock
//! acquisition order; nested objects are replaced, never deep-merged.
//! `version` and `last_updated` are for observability only.

use crate::config::StoreConfig;
use crate::fanout::{EntitySubscription, NotifyReport, SubscriberInfo, SubscriberRegistry};
use crate::persistence::{PersistHook, PersistJob, PersistenceState, PersistenceWorker, SnapshotSource};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nexus_telemetry::{log_entity_event, ENTITIES_ACTIVE, ENTITIES_EVICTED, ENTITY_UPDATES};
use nexus_types::payload::to_payload;
use nexus_types::{EventEnvelope, EventState, EventType, NexusError, StateChange, StateMap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

// =============================================================================
// TYPES
// =============================================================================

struct EntityState {
    entity_type: String,
    state: StateMap,
    version: u64,
    last_updated: DateTime<Utc>,
    last_touched: Instant,
}

impl EntityState {
    fn new(entity_type: &str, state: StateMap) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            state,
            version: 0,
            last_updated: Utc::now(),
            last_touched: Instant::now(),
        }
    }

    fn snapshot(&self, entity_id: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: entity_id.to_string(),
            entity_type: self.entity_type.clone(),
            state: self.state.clone(),
            version: self.version,
            last_updated: self.last_updated,
        }
    }

    fn apply(&mut self, patch: &StateMap, replace: bool) {
        if replace {
            self.state = patch.clone();
        } else {
            for (key, value) in patch {
                self.state.insert(key.clone(), value.clone());
            }
        }
        self.version += 1;
        self.last_updated = Utc::now().max(self.last_updated);
        self.last_touched = Instant::now();
    }
}

/// Copy of an entity at one point in time. Never a live reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: String,
    pub entity_type: String,
    pub state: StateMap,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

/// Options of one update.
#[derive(Debug, Clone, Default)]
pub struct UpdateMeta {
    /// Replace the whole state instead of merging.
    pub replace: bool,
    /// Correlation id for the resulting state event; a fresh one otherwise.
    pub correlation_id: Option<String>,
    /// Recorded as `metadata.source` of the state event.
    pub source: Option<String>,
}

/// Observability view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityAnalytics {
    pub entity_id: String,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    pub idle_ms: u64,
    pub state_keys: Vec<String>,
    pub subscriber_count: usize,
    pub subscribers: Vec<SubscriberInfo>,
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub entities: usize,
    pub subscribers: usize,
    pub updates: u64,
    pub replicated: u64,
    pub evicted: u64,
    pub slow_consumers: u64,
    pub persistence_degraded: bool,
    pub persist_writes: u64,
    pub persist_failures: u64,
    pub dirty_entities: usize,
}

#[derive(Debug, Default)]
struct StoreCounters {
    updates: AtomicU64,
    replicated: AtomicU64,
    evicted: AtomicU64,
}

// =============================================================================
// STORE
// =============================================================================

/// In-memory entity state with subscriber fan-out and async persistence.
pub struct EntityStateStore {
    config: StoreConfig,
    entities: DashMap<String, Arc<Mutex<EntityState>>>,
    fanout: Arc<SubscriberRegistry>,
    hook: Option<Arc<dyn PersistHook>>,
    persist_tx: mpsc::Sender<PersistJob>,
    persist_rx: Mutex<Option<mpsc::Receiver<PersistJob>>>,
    persistence: Arc<PersistenceState>,
    counters: StoreCounters,
    started: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl EntityStateStore {
    /// Store without persistence.
    #[must_use]
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Store mirroring every update through `hook`.
    #[must_use]
    pub fn with_persist_hook(config: StoreConfig, hook: Arc<dyn PersistHook>) -> Arc<Self> {
        Self::build(config, Some(hook))
    }

    fn build(config: StoreConfig, hook: Option<Arc<dyn PersistHook>>) -> Arc<Self> {
        let (persist_tx, persist_rx) = mpsc::channel(config.persistence.queue_capacity.max(1));
        Arc::new(Self {
            fanout: SubscriberRegistry::new(config.fanout.clone()),
            entities: DashMap::new(),
            hook,
            persist_tx,
            persist_rx: Mutex::new(Some(persist_rx)),
            persistence: Arc::new(PersistenceState::default()),
            counters: StoreCounters::default(),
            started: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn fanout(&self) -> &Arc<SubscriberRegistry> {
        &self.fanout
    }

    #[must_use]
    pub fn persistence(&self) -> &PersistenceState {
        &self.persistence
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.persistence.is_degraded()
    }

    /// Spawn the idle sweeper and, with a hook, the persistence worker.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(hook) = &self.hook {
            if let Some(queue) = self.persist_rx.lock().take() {
                let source: Weak<dyn SnapshotSource> = Arc::downgrade(self) as Weak<dyn SnapshotSource>;
                let worker = PersistenceWorker::new(
                    hook.clone(),
                    self.config.persistence.clone(),
                    self.persistence.clone(),
                    source,
                );
                self.tracker.spawn(worker.run(queue, self.cancel.clone()));
            }
        }

        let store = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.config.sweep_interval.max(Duration::from_millis(10));
        let ttl = self.config.idle_ttl;
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else { break };
                        store.evict_idle(ttl);
                    }
                }
            }
        });

        info!(
            entity_type = %self.config.entity_type,
            persistence = self.hook.is_some(),
            "Entity state store started"
        );
    }

    /// Stop the sweeper and persistence worker.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Entity state store stopped");
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn entry(&self, entity_id: &str) -> Arc<Mutex<EntityState>> {
        if let Some(existing) = self.entities.get(entity_id) {
            return existing.clone();
        }
        self.entities
            .entry(entity_id.to_string())
            .or_insert_with(|| {
                ENTITIES_ACTIVE.inc();
                log_entity_event!(debug, "store", "Entity created", entity_id);
                Arc::new(Mutex::new(EntityState::new(&self.config.entity_type, StateMap::new())))
            })
            .clone()
    }

    fn lock_timeout_busy(&self, entity_id: &str) -> NexusError {
        NexusError::busy(format!("entity lock {entity_id}"), 1)
    }

    /// Snapshot of `entity_id`, creating it empty on first reference.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty id, `Busy` when the entity lock is contended
    /// beyond the configured wait.
    pub fn get_or_create(&self, entity_id: &str) -> Result<EntitySnapshot, NexusError> {
        validate_id(entity_id)?;
        let entity = self.entry(entity_id);
        let mut guard = entity
            .try_lock_for(self.config.lock_timeout)
            .ok_or_else(|| self.lock_timeout_busy(entity_id))?;
        guard.last_touched = Instant::now();
        Ok(guard.snapshot(entity_id))
    }

    /// Like [`get_or_create`](Self::get_or_create), but a newly created
    /// entity starts from the persist hook's stored state when there is one.
    ///
    /// # Errors
    ///
    /// As [`get_or_create`](Self::get_or_create). A failing `load` is logged
    /// and the entity starts empty.
    pub async fn load_or_create(&self, entity_id: &str) -> Result<EntitySnapshot, NexusError> {
        validate_id(entity_id)?;
        if self.entities.contains_key(entity_id) {
            return self.get_or_create(entity_id);
        }

        let stored = match &self.hook {
            Some(hook) => match hook.load(entity_id).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(entity_id, error = %e.for_entity(entity_id), "Loading persisted state failed");
                    None
                }
            },
            None => None,
        };

        if let Some(state) = stored {
            self.entities
                .entry(entity_id.to_string())
                .or_insert_with(|| {
                    ENTITIES_ACTIVE.inc();
                    log_entity_event!(debug, "store", "Entity restored from storage", entity_id, keys = state.len());
                    Arc::new(Mutex::new(EntityState::new(&self.config.entity_type, state)))
                });
        }
        self.get_or_create(entity_id)
    }

    /// Snapshot of an existing entity; `None` if it is not in memory.
    #[must_use]
    pub fn snapshot(&self, entity_id: &str) -> Option<EntitySnapshot> {
        let entity = self.entities.get(entity_id)?.clone();
        let guard = entity.try_lock_for(self.config.lock_timeout)?;
        Some(guard.snapshot(entity_id))
    }

    /// Current state and version, creating the entity on first reference.
    ///
    /// # Errors
    ///
    /// As [`get_or_create`](Self::get_or_create).
    pub fn get_entity_state(&self, entity_id: &str) -> Result<(StateMap, u64), NexusError> {
        let snapshot = self.get_or_create(entity_id)?;
        Ok((snapshot.state, snapshot.version))
    }

    /// Ids of all in-memory entities, sorted.
    #[must_use]
    pub fn list_entities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entities.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Analytics for an existing entity.
    #[must_use]
    pub fn analytics(&self, entity_id: &str) -> Option<EntityAnalytics> {
        let entity = self.entities.get(entity_id)?.clone();
        let (version, last_updated, idle, mut state_keys) = {
            let guard = entity.try_lock_for(self.config.lock_timeout)?;
            (
                guard.version,
                guard.last_updated,
                guard.last_touched.elapsed(),
                guard.state.keys().cloned().collect::<Vec<_>>(),
            )
        };
        state_keys.sort();
        let subscribers = self.fanout.subscribers(entity_id);
        Some(EntityAnalytics {
            entity_id: entity_id.to_string(),
            version,
            last_updated,
            idle_ms: idle.as_millis() as u64,
            state_keys,
            subscriber_count: subscribers.len(),
            subscribers,
        })
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entities: self.entities.len(),
            subscribers: self.fanout.total_subscribers(),
            updates: self.counters.updates.load(Ordering::Relaxed),
            replicated: self.counters.replicated.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            slow_consumers: self.fanout.slow_consumer_count(),
            persistence_degraded: self.persistence.is_degraded(),
            persist_writes: self.persistence.writes(),
            persist_failures: self.persistence.failures(),
            dirty_entities: self.persistence.dirty_entities().len(),
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Merge `patch` into `entity_id` and notify its subscribers.
    ///
    /// Returns the `{entity_type}:state:v1:success` event describing the
    /// change, already delivered to local subscribers. Publishing it to
    /// other instances is up to the caller.
    ///
    /// # Errors
    ///
    /// - `Validation`: empty id or no patch (checked before locking)
    /// - `Busy`: the entity lock was not granted within `lock_timeout`
    pub async fn apply_update(
        &self,
        entity_id: &str,
        actor_id: Option<&str>,
        patch: Option<StateMap>,
        meta: UpdateMeta,
    ) -> Result<EventEnvelope, NexusError> {
        validate_id(entity_id)?;
        let patch = patch.ok_or_else(|| NexusError::Validation("patch is required".into()))?;

        let entity = self.entry(entity_id);
        let change = {
            let mut guard = entity
                .try_lock_for(self.config.lock_timeout)
                .ok_or_else(|| self.lock_timeout_busy(entity_id))?;
            guard.apply(&patch, meta.replace);
            StateChange {
                entity_id: entity_id.to_string(),
                entity_type: guard.entity_type.clone(),
                version: guard.version,
                last_updated: guard.last_updated,
                patch: patch.clone(),
                state: guard.state.clone(),
                replace: meta.replace,
                actor_id: actor_id.map(str::to_string),
            }
        };

        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        ENTITY_UPDATES.inc();

        let event_type = EventType::new(change.entity_type.clone(), "state", 1, EventState::Success)?;
        let mut envelope = EventEnvelope::new(event_type, to_payload(&change)?)
            .with_entity(entity_id)
            .with_entity_type(change.entity_type.clone());
        if let Some(correlation_id) = meta.correlation_id {
            envelope = envelope.with_correlation(correlation_id);
        }
        if let Some(actor_id) = actor_id {
            envelope = envelope.with_actor(actor_id);
        }
        envelope.metadata.partial = !meta.replace;
        envelope.metadata.source = meta.source;

        log_entity_event!(
            debug,
            "store",
            "Entity updated",
            entity_id,
            version = change.version,
            keys = patch.len(),
            replace = meta.replace
        );

        self.fanout.notify(entity_id, Arc::new(envelope.clone())).await;

        let persisted = if meta.replace { change.state } else { patch };
        self.schedule_persist(entity_id, persisted);
        Ok(envelope)
    }

    /// Apply a state change that another instance already applied and persisted.
    ///
    /// Local subscribers are notified with the same envelope. Returns the
    /// local version after applying.
    ///
    /// # Errors
    ///
    /// `Serialization` when the payload is not a [`StateChange`], `Busy` as
    /// in [`apply_update`](Self::apply_update).
    pub async fn apply_replicated(&self, envelope: Arc<EventEnvelope>) -> Result<u64, NexusError> {
        let change: StateChange = envelope.decode_payload()?;
        validate_id(&change.entity_id)?;

        let entity = self.entry(&change.entity_id);
        let version = {
            let mut guard = entity
                .try_lock_for(self.config.lock_timeout)
                .ok_or_else(|| self.lock_timeout_busy(&change.entity_id))?;
            if change.replace {
                guard.state = change.state.clone();
            } else {
                for (key, value) in &change.patch {
                    guard.state.insert(key.clone(), value.clone());
                }
            }
            guard.version = guard.version.max(change.version);
            guard.last_updated = guard.last_updated.max(change.last_updated);
            guard.last_touched = Instant::now();
            guard.version
        };

        self.counters.replicated.fetch_add(1, Ordering::Relaxed);
        log_entity_event!(
            debug,
            "store",
            "Replicated update applied",
            change.entity_id,
            version = version,
            origin = ?envelope.metadata.origin_instance
        );
        self.fanout.notify(&change.entity_id, envelope).await;
        Ok(version)
    }

    /// Deliver a non-state event to an entity's subscribers.
    pub async fn notify(&self, entity_id: &str, envelope: Arc<EventEnvelope>) -> NotifyReport {
        if let Some(entity) = self.entities.get(entity_id).map(|e| e.clone()) {
            if let Some(mut guard) = entity.try_lock() {
                guard.last_touched = Instant::now();
            }
        }
        self.fanout.notify(entity_id, envelope).await
    }

    /// Subscribe to an entity, creating it if needed.
    ///
    /// # Errors
    ///
    /// `Validation` for empty ids, `Busy` when the entity lock is contended.
    pub fn subscribe(&self, entity_id: &str, subscriber_id: &str) -> Result<EntitySubscription, NexusError> {
        self.get_or_create(entity_id)?;
        self.fanout.subscribe(entity_id, subscriber_id)
    }

    pub fn unsubscribe(&self, entity_id: &str, subscriber_id: &str) -> bool {
        self.fanout.unsubscribe(entity_id, subscriber_id)
    }

    fn schedule_persist(&self, entity_id: &str, patch: StateMap) {
        if self.hook.is_none() {
            return;
        }
        let job = PersistJob {
            entity_id: entity_id.to_string(),
            patch,
        };
        if self.persist_tx.try_send(job).is_err() {
            // Reconciliation writes the full state later.
            self.persistence.mark_dirty(entity_id);
            debug!(entity_id, "Persistence queue full, entity marked dirty");
        }
    }

    // -------------------------------------------------------------------------
    // Seeding and eviction
    // -------------------------------------------------------------------------

    /// Merge `state` into an entity without bumping its version.
    ///
    /// # Errors
    ///
    /// As [`get_or_create`](Self::get_or_create).
    pub fn seed(&self, entity_id: &str, state: StateMap) -> Result<EntitySnapshot, NexusError> {
        validate_id(entity_id)?;
        let entity = self.entry(entity_id);
        let mut guard = entity
            .try_lock_for(self.config.lock_timeout)
            .ok_or_else(|| self.lock_timeout_busy(entity_id))?;
        for (key, value) in state {
            guard.state.insert(key, value);
        }
        guard.last_touched = Instant::now();
        log_entity_event!(info, "store", "Entity seeded", entity_id, keys = guard.state.len());
        Ok(guard.snapshot(entity_id))
    }

    /// Seed one entity from a JSON document.
    ///
    /// The entity id is the document's `slug` (default `"0"`). Every
    /// top-level field except `service_specific` becomes state, then the
    /// fields under `service_specific.{entity_type}` are merged over them.
    ///
    /// # Errors
    ///
    /// `Persistence` when the file cannot be read, `Serialization` when it
    /// is not a JSON object.
    pub async fn seed_from_file(&self, path: impl AsRef<Path>) -> Result<EntitySnapshot, NexusError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| NexusError::Persistence {
                entity_id: path.display().to_string(),
                message: e.to_string(),
            })?;
        let document: Value = serde_json::from_str(&raw)?;
        let (entity_id, state) = seed_document(&document, &self.config.entity_type)?;
        self.seed(&entity_id, state)
    }

    /// Evict entities with no subscribers and no activity for `ttl`.
    ///
    /// A later reference recreates the entity empty, or from storage via
    /// [`load_or_create`](Self::load_or_create).
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let candidates: Vec<String> = self
            .entities
            .iter()
            .filter(|e| {
                e.value()
                    .try_lock()
                    .is_some_and(|s| s.last_touched.elapsed() >= ttl)
            })
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for entity_id in candidates {
            // Dirty entities stay until reconciliation has written them.
            if self.fanout.subscriber_count(&entity_id) > 0 || self.persistence.is_dirty(&entity_id) {
                continue;
            }
            // A caller holding the Arc is about to lock it; the map must keep
            // pointing at the state it will write into.
            let removed = self.entities.remove_if(&entity_id, |_, entity| {
                Arc::strong_count(entity) == 1
                    && entity
                        .try_lock()
                        .is_some_and(|s| s.last_touched.elapsed() >= ttl)
            });
            if removed.is_some() {
                evicted += 1;
                ENTITIES_ACTIVE.dec();
                ENTITIES_EVICTED.inc();
                log_entity_event!(debug, "store", "Idle entity evicted", entity_id);
            }
        }

        if evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, remaining = self.entities.len(), "Idle entities evicted");
        }
        evicted
    }
}

impl SnapshotSource for EntityStateStore {
    fn full_state(&self, entity_id: &str) -> Option<StateMap> {
        self.snapshot(entity_id).map(|s| s.state)
    }
}

impl Drop for EntityStateStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn validate_id(entity_id: &str) -> Result<(), NexusError> {
    if entity_id.is_empty() {
        return Err(NexusError::Validation("entity_id must not be empty".into()));
    }
    Ok(())
}

/// Split a seed document into entity id and state.
fn seed_document(document: &Value, entity_type: &str) -> Result<(String, StateMap), NexusError> {
    let object = document
        .as_object()
        .ok_or_else(|| NexusError::Validation("seed document must be a JSON object".into()))?;

    let entity_id = object
        .get("slug")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(nexus_types::DEFAULT_ENTITY_ID)
        .to_string();

    let mut state: StateMap = object
        .iter()
        .filter(|(key, _)| key.as_str() != "service_specific")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if let Some(Value::Object(specific)) = object
        .get("service_specific")
        .and_then(|s| s.get(entity_type))
    {
        for (key, value) in specific {
            state.insert(key.clone(), value.clone());
        }
    }
    Ok((entity_id, state))
}
