//! # Event Bus
//!
//! The per-process pub/sub hub. Producers call [`EventBus::publish`];
//! subscribers register a pattern with either a callback (run on the worker
//! pool) or a bounded channel ([`EventStream`]).
//!
//! ## Publish Path
//!
//! ```text
//! publish(env)
//!   ├─ validate against the catalog          ──► Err(InvalidEventType)
//!   ├─ stamp metadata.origin_instance = self
//!   ├─ claim event_id in the DedupStore      ──► Duplicate (nothing delivered)
//!   ├─ remember event_id in the local seen set
//!   ├─ dispatch to local registrations (never blocks)
//!   └─ enqueue for the bridge forwarder (drop when full)
//! ```
//!
//! ## Remote Path
//!
//! The bridge receiver hands decoded envelopes to [`EventBus::ingest_remote`],
//! which drops this instance's own echoes and ids already seen, then
//! dispatches to registrations whose [`DeliveryScope`] accepts peer events.

use crate::bridge::{run_forwarder, run_receiver, BridgeCounters, Outbound, ReconnectPolicy};
use crate::dedup::{DedupStore, InMemoryDedupStore, TtlSet};
use crate::handler::{DeliveryScope, EventHandler};
use crate::pattern::EventPattern;
use crate::subscriber::{EventStream, SubscriberTable, SubscriptionHandle, Target};
use crate::transport::ClusterTransport;
use crate::worker::{DeliveryJob, DeliveryPool};
use async_trait::async_trait;
use nexus_telemetry::{log_event, metric_inc, EVENTS_DROPPED, EVENTS_DUPLICATE, EVENTS_INVALID, EVENTS_PUBLISHED, BRIDGE_RECEIVED};
use nexus_types::{
    duration_serde, topic_channel, EventEnvelope, EventSink, EventValidator, NexusError,
    DEFAULT_CHANNEL,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Unique id of this process; stamped as `metadata.origin_instance`.
    pub instance_id: String,

    /// Number of delivery workers.
    pub workers: usize,

    /// Total handler queue capacity, split evenly across workers.
    pub queue_capacity: usize,

    /// Bridge outbound queue capacity.
    pub outbound_capacity: usize,

    /// Buffer of each [`EventStream`] subscription.
    pub stream_capacity: usize,

    /// Lifetime of dedup claims and of the local seen set.
    #[serde(with = "duration_serde")]
    pub dedup_ttl: Duration,

    /// Publish each topic on its own channel instead of the shared one.
    pub per_topic_channels: bool,

    /// First bridge reconnect delay.
    #[serde(with = "duration_serde")]
    pub reconnect_min: Duration,

    /// Reconnect delay ceiling.
    #[serde(with = "duration_serde")]
    pub reconnect_max: Duration,
}

fn default_instance_id() -> String {
    format!("nexus-{}", uuid::Uuid::new_v4().simple())
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            workers: 8,
            queue_capacity: 256,
            outbound_capacity: 1024,
            stream_capacity: 64,
            dedup_ttl: crate::DEFAULT_DEDUP_TTL,
            per_topic_channels: true,
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Result of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted; `receivers` local registrations were handed the event.
    Delivered { receivers: usize },
    /// The event id was already claimed; nothing was delivered.
    Duplicate,
}

/// Point-in-time counters of one bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub handler_panics: u64,
    pub remote_received: u64,
    pub remote_skipped: u64,
    pub forwarded: u64,
    pub forward_failures: u64,
    pub decode_errors: u64,
    pub bridge_restarts: u64,
    pub subscriptions: usize,
}

/// Publishing side of the bus, for components that should not depend on [`EventBus`] itself.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event.
    ///
    /// # Errors
    ///
    /// `InvalidEventType` when the type is not registered in the catalog.
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishOutcome, NexusError>;

    /// Total events accepted for delivery.
    fn events_published(&self) -> u64;
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    validator: EventValidator,
    config: BusConfig,
    dedup: Option<Arc<dyn DedupStore>>,
    transport: Option<Arc<dyn ClusterTransport>>,
}

impl EventBusBuilder {
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared claim store. Defaults to a private [`InMemoryDedupStore`].
    #[must_use]
    pub fn dedup(mut self, dedup: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Cross-instance transport. Without one the bus is process-local.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<EventBus> {
        let config = self.config;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        Arc::new(EventBus {
            pool: DeliveryPool::new(config.workers, config.queue_capacity),
            validator: self.validator,
            dedup: self
                .dedup
                .unwrap_or_else(|| Arc::new(InMemoryDedupStore::new())),
            transport: self.transport,
            seen: Mutex::new(TtlSet::new()),
            table: Arc::new(SubscriberTable::default()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            bridge: Arc::new(BridgeCounters::default()),
            counters: BusCounters::default(),
            started: AtomicBool::new(false),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            config,
        })
    }
}

// =============================================================================
// EVENT BUS
// =============================================================================

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    duplicates: AtomicU64,
    invalid: AtomicU64,
    dropped: AtomicU64,
    remote_skipped: AtomicU64,
}

/// Validated, deduplicated pub/sub with cross-instance replication.
pub struct EventBus {
    config: BusConfig,
    validator: EventValidator,
    dedup: Arc<dyn DedupStore>,
    transport: Option<Arc<dyn ClusterTransport>>,
    seen: Mutex<TtlSet>,
    table: Arc<SubscriberTable>,
    pool: DeliveryPool,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    bridge: Arc<BridgeCounters>,
    counters: BusCounters,
    started: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl EventBus {
    #[must_use]
    pub fn builder(validator: EventValidator) -> EventBusBuilder {
        EventBusBuilder {
            validator,
            config: BusConfig::default(),
            dedup: None,
            transport: None,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn validator(&self) -> &EventValidator {
        &self.validator
    }

    /// Whether this instance first published the envelope.
    #[must_use]
    pub fn is_local_origin(&self, envelope: &EventEnvelope) -> bool {
        envelope.metadata.origin_instance.as_deref() == Some(self.instance_id())
    }

    /// Spawn the delivery workers and, with a transport, the bridge tasks.
    ///
    /// Handler subscriptions receive nothing until this is called. Calling
    /// it again has no effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.spawn(&self.tracker, &self.cancel);

        if let Some(transport) = &self.transport {
            if let Some(outbound) = self.outbound_rx.lock().take() {
                self.tracker.spawn(run_forwarder(
                    outbound,
                    transport.clone(),
                    self.bridge.clone(),
                    self.cancel.clone(),
                ));
            }
            self.tracker.spawn(run_receiver(
                Arc::downgrade(self),
                transport.clone(),
                self.receive_channels(),
                self.bridge.clone(),
                ReconnectPolicy {
                    min: self.config.reconnect_min,
                    max: self.config.reconnect_max,
                },
                self.cancel.clone(),
            ));
        }

        info!(
            instance_id = %self.config.instance_id,
            workers = self.pool.workers(),
            bridged = self.transport.is_some(),
            "Event bus started"
        );
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(instance_id = %self.config.instance_id, "Event bus stopped");
    }

    // -------------------------------------------------------------------------
    // Subscribing
    // -------------------------------------------------------------------------

    /// Run `handler` for every event matching `pattern`, from any instance.
    ///
    /// # Errors
    ///
    /// `Validation` if the pattern is malformed.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle, NexusError> {
        self.subscribe_scoped(&[pattern], DeliveryScope::All, handler)
    }

    /// Run `handler` for events matching any of `patterns`, limited by `scope`.
    ///
    /// # Errors
    ///
    /// `Validation` if a pattern is malformed.
    pub fn subscribe_scoped(
        &self,
        patterns: &[&str],
        scope: DeliveryScope,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle, NexusError> {
        let parsed = parse_patterns(patterns)?;
        let id = self.table.insert(parsed, scope, Target::Handler(handler));
        debug!(subscription = id, patterns = %patterns.join(","), ?scope, "Handler subscribed");
        Ok(SubscriptionHandle::new(id, &self.table, patterns.join(",")))
    }

    /// Receive events matching any of `patterns` through a bounded channel.
    ///
    /// # Errors
    ///
    /// `Validation` if a pattern is malformed.
    pub fn subscribe_stream(&self, patterns: &[&str]) -> Result<EventStream, NexusError> {
        let parsed = parse_patterns(patterns)?;
        let (tx, rx) = mpsc::channel(self.config.stream_capacity.max(1));
        let id = self.table.insert(parsed, DeliveryScope::All, Target::Sink(tx));
        debug!(subscription = id, patterns = %patterns.join(","), "Stream subscribed");
        Ok(EventStream::new(
            rx,
            SubscriptionHandle::new(id, &self.table, patterns.join(",")),
        ))
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Validate, deduplicate and deliver an event locally and to peers.
    ///
    /// Never blocks on subscribers: full queues drop the event for that
    /// subscriber only.
    ///
    /// # Errors
    ///
    /// `InvalidEventType` when the type is not registered in the catalog.
    pub async fn publish(&self, mut envelope: EventEnvelope) -> Result<PublishOutcome, NexusError> {
        if let Err(e) = self.validator.validate_envelope(&envelope) {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            EVENTS_INVALID.inc();
            warn!(event_type = %envelope.event_type, error = %e, "Rejected invalid event");
            return Err(e);
        }

        envelope.metadata.origin_instance = Some(self.config.instance_id.clone());

        let claimed = match self.dedup.claim(&envelope.event_id, self.config.dedup_ttl).await {
            Ok(claimed) => claimed,
            Err(e) => {
                // Delivery is at-least-once; an unavailable claim store must not stop traffic.
                warn!(event_id = %envelope.event_id, error = %e, "Dedup store unavailable, delivering");
                true
            }
        };
        if !claimed || !self.seen.lock().insert_if_absent(&envelope.event_id, self.config.dedup_ttl) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            EVENTS_DUPLICATE.inc();
            log_event!(debug, "bus", "Duplicate event suppressed", envelope);
            return Ok(PublishOutcome::Duplicate);
        }

        let topic = envelope.topic();
        let envelope = Arc::new(envelope);
        let receivers = self.dispatch(&envelope, true);

        if self.transport.is_some() {
            let channel = if self.config.per_topic_channels {
                topic_channel(&topic)
            } else {
                DEFAULT_CHANNEL.to_string()
            };
            let outbound = Outbound {
                channel,
                envelope: envelope.clone(),
            };
            if self.outbound_tx.try_send(outbound).is_err() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                EVENTS_DROPPED.with_label_values(&["bridge_outbound"]).inc();
                log_event!(warn, "bus", "Bridge queue full, event not forwarded", envelope);
            }
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        EVENTS_PUBLISHED.with_label_values(&[&topic]).inc();
        log_event!(debug, "bus", "Event published", envelope, receivers = receivers);
        Ok(PublishOutcome::Delivered { receivers })
    }

    /// Deliver an envelope received from a peer instance.
    ///
    /// Returns `false` when it was dropped: own echo, already seen, or not
    /// in the catalog.
    pub fn ingest_remote(&self, envelope: EventEnvelope) -> bool {
        if self.is_local_origin(&envelope) {
            self.counters.remote_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Rejected envelopes leave the seen set untouched.
        if let Err(e) = self.validator.validate_envelope(&envelope) {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            EVENTS_INVALID.inc();
            warn!(event_type = %envelope.event_type, error = %e, "Peer sent unregistered event");
            return false;
        }
        if !self.seen.lock().insert_if_absent(&envelope.event_id, self.config.dedup_ttl) {
            self.counters.remote_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.bridge.received.fetch_add(1, Ordering::Relaxed);
        BRIDGE_RECEIVED.inc();
        let envelope = Arc::new(envelope);
        let receivers = self.dispatch(&envelope, false);
        log_event!(
            debug,
            "bridge",
            "Peer event delivered",
            envelope,
            origin = ?envelope.metadata.origin_instance,
            receivers = receivers
        );
        true
    }

    fn dispatch(&self, envelope: &Arc<EventEnvelope>, local_origin: bool) -> usize {
        let mut receivers = 0;
        for registration in self.table.matching(envelope, local_origin) {
            match registration.target {
                Target::Handler(handler) => {
                    let job = DeliveryJob {
                        subscription_id: registration.id,
                        envelope: envelope.clone(),
                        handler,
                    };
                    if self.pool.try_enqueue(job).is_ok() {
                        receivers += 1;
                    } else {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        metric_inc!(EVENTS_DROPPED, &["worker_queue"]);
                        log_event!(
                            warn,
                            "bus",
                            "Worker queue full, event dropped for subscriber",
                            envelope,
                            subscription = registration.id
                        );
                    }
                }
                Target::Sink(sender) => match sender.try_send(envelope.clone()) {
                    Ok(()) => receivers += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        metric_inc!(EVENTS_DROPPED, &["stream_sink"]);
                        log_event!(
                            warn,
                            "bus",
                            "Stream subscriber lagging, event dropped",
                            envelope,
                            subscription = registration.id
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.table.remove(registration.id);
                    }
                },
            }
        }
        receivers
    }

    fn receive_channels(&self) -> Vec<String> {
        let mut channels = vec![DEFAULT_CHANNEL.to_string()];
        if self.config.per_topic_channels {
            channels.extend(
                self.validator
                    .catalog()
                    .topics()
                    .iter()
                    .map(|topic| topic_channel(topic)),
            );
        }
        channels
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        let pool = self.pool.counters();
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: pool.delivered.load(Ordering::Relaxed),
            handler_failures: pool.failed.load(Ordering::Relaxed),
            handler_panics: pool.panicked.load(Ordering::Relaxed),
            remote_received: self.bridge.received.load(Ordering::Relaxed),
            remote_skipped: self.counters.remote_skipped.load(Ordering::Relaxed),
            forwarded: self.bridge.forwarded.load(Ordering::Relaxed),
            forward_failures: self.bridge.forward_failures.load(Ordering::Relaxed),
            decode_errors: self.bridge.decode_errors.load(Ordering::Relaxed),
            bridge_restarts: self.bridge.restarts.load(Ordering::Relaxed),
            subscriptions: self.table.len(),
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn parse_patterns(patterns: &[&str]) -> Result<Vec<EventPattern>, NexusError> {
    if patterns.is_empty() {
        return Err(NexusError::Validation("at least one pattern is required".into()));
    }
    patterns.iter().map(|p| EventPattern::parse(p)).collect()
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<PublishOutcome, NexusError> {
        EventBus::publish(self, envelope).await
    }

    fn events_published(&self) -> u64 {
        self.counters.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), NexusError> {
        EventBus::publish(self, envelope).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::transport::{InMemoryTransport, TransportMessage};
    use futures::stream::BoxStream;
    use nexus_types::{EventCatalog, EventType};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    fn validator() -> EventValidator {
        let catalog = EventCatalog::builder()
            .action("campaign", "update")
            .action("campaign", "state")
            .streaming_action("campaign", "stream")
            .build()
            .unwrap();
        EventValidator::new(Arc::new(catalog))
    }

    fn config(instance: &str) -> BusConfig {
        BusConfig {
            instance_id: instance.to_string(),
            workers: 2,
            reconnect_min: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
            ..BusConfig::default()
        }
    }

    fn envelope(raw: &str) -> EventEnvelope {
        EventEnvelope::new(EventType::parse(raw).unwrap(), json!({"n": 1})).with_entity("42")
    }

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn EventHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = handler_fn(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        (count, handler)
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while count.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected deliveries did not arrive");
    }

    async fn wait_subscribed(transport: &InMemoryTransport, receivers: usize) {
        timeout(Duration::from_secs(2), async {
            while transport.receiver_count() < receivers {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge receivers did not subscribe");
    }

    #[tokio::test]
    async fn test_publish_rejects_unregistered_type() {
        let bus = EventBus::builder(validator()).config(config("a")).build();
        let (count, handler) = counting();
        let _sub = bus.subscribe("*", handler).unwrap();
        bus.start();

        let err = bus
            .publish(envelope("billing:charge:v1:requested"))
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::InvalidEventType { .. }));
        assert_eq!(bus.stats().invalid, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pattern_filtering_and_origin_stamp() {
        let bus = EventBus::builder(validator()).config(config("a")).build();
        let mut updates = bus.subscribe_stream(&["campaign:update"]).unwrap();
        let mut states = bus.subscribe_stream(&["campaign:state:*:success"]).unwrap();

        let outcome = bus
            .publish(envelope("campaign:update:v1:requested"))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Delivered { receivers: 1 });

        let got = updates.try_recv().unwrap().unwrap();
        assert_eq!(got.metadata.origin_instance.as_deref(), Some("a"));
        assert!(bus.is_local_origin(&got));
        assert!(states.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_event_id_delivered_once() {
        let bus = EventBus::builder(validator()).config(config("a")).build();
        let (count, handler) = counting();
        let _sub = bus.subscribe("campaign:*", handler).unwrap();
        bus.start();

        let env = envelope("campaign:update:v1:requested");
        assert!(matches!(
            bus.publish(env.clone()).await.unwrap(),
            PublishOutcome::Delivered { .. }
        ));
        assert_eq!(bus.publish(env).await.unwrap(), PublishOutcome::Duplicate);

        wait_for(&count, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().duplicates, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_stream_drops_without_blocking() {
        let mut cfg = config("a");
        cfg.stream_capacity = 1;
        let bus = EventBus::builder(validator()).config(cfg).build();
        let mut stream = bus.subscribe_stream(&["*"]).unwrap();

        for _ in 0..3 {
            bus.publish(envelope("campaign:update:v1:success")).await.unwrap();
        }
        assert_eq!(bus.stats().dropped, 2);
        assert_eq!(bus.stats().published, 3);
        assert!(stream.try_recv().unwrap().is_some());
        assert!(stream.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_stream_is_unsubscribed() {
        let bus = EventBus::builder(validator()).config(config("a")).build();
        let stream = bus.subscribe_stream(&["*"]).unwrap();
        assert_eq!(bus.stats().subscriptions, 1);
        drop(stream);
        assert_eq!(bus.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_cross_instance_delivery_and_loop_prevention() {
        let transport = InMemoryTransport::new();
        let dedup: Arc<dyn DedupStore> = Arc::new(InMemoryDedupStore::new());

        let a = EventBus::builder(validator())
            .config(config("a"))
            .dedup(dedup.clone())
            .transport(Arc::new(transport.clone()))
            .build();
        let b = EventBus::builder(validator())
            .config(config("b"))
            .dedup(dedup)
            .transport(Arc::new(transport.clone()))
            .build();

        let (on_a, handler_a) = counting();
        let (on_b, handler_b) = counting();
        let (commands_b, command_handler_b) = counting();
        let _sa = a.subscribe("campaign:update", handler_a).unwrap();
        let _sb = b.subscribe("campaign:update", handler_b).unwrap();
        let _cb = b
            .subscribe_scoped(&["campaign:*:*:requested"], DeliveryScope::LocalOrigin, command_handler_b)
            .unwrap();

        a.start();
        b.start();
        wait_subscribed(&transport, 2).await;

        a.publish(envelope("campaign:update:v1:requested")).await.unwrap();

        wait_for(&on_a, 1).await;
        wait_for(&on_b, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(on_a.load(Ordering::SeqCst), 1, "own echo must be ignored");
        assert_eq!(on_b.load(Ordering::SeqCst), 1);
        assert_eq!(commands_b.load(Ordering::SeqCst), 0, "requests run only where ingested");
        assert_eq!(a.stats().remote_skipped, 1);
        assert_eq!(b.stats().remote_received, 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_ingest_remote_ignores_seen_ids() {
        let bus = EventBus::builder(validator()).config(config("b")).build();
        let mut stream = bus.subscribe_stream(&["*"]).unwrap();

        let mut env = envelope("campaign:update:v1:success");
        env.metadata.origin_instance = Some("a".into());
        assert!(bus.ingest_remote(env.clone()));
        assert!(!bus.ingest_remote(env));
        assert!(stream.try_recv().unwrap().is_some());
        assert!(stream.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_peer_event_does_not_claim_id() {
        let bus = EventBus::builder(validator()).config(config("b")).build();
        let mut stream = bus.subscribe_stream(&["*"]).unwrap();

        let mut unknown = EventEnvelope::new(EventType::parse("billing:charge:v1:success").unwrap(), json!({}))
            .with_event_id("evt-1");
        unknown.metadata.origin_instance = Some("a".into());
        assert!(!bus.ingest_remote(unknown));
        assert_eq!(bus.stats().invalid, 1);

        let mut valid = envelope("campaign:update:v1:success").with_event_id("evt-1");
        valid.metadata.origin_instance = Some("a".into());
        assert!(bus.ingest_remote(valid));
        assert!(stream.try_recv().unwrap().is_some());
        assert_eq!(bus.stats().remote_skipped, 0);
    }

    struct FlakyTransport {
        inner: InMemoryTransport,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ClusterTransport for FlakyTransport {
        async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), NexusError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(
            &self,
            channels: &[String],
        ) -> Result<BoxStream<'static, TransportMessage>, NexusError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NexusError::Transport("connection refused".into()));
            }
            self.inner.subscribe(channels).await
        }
    }

    #[tokio::test]
    async fn test_bridge_receiver_restarts_after_subscribe_failure() {
        let shared = InMemoryTransport::new();
        let flaky = Arc::new(FlakyTransport {
            inner: shared.clone(),
            failures_left: AtomicUsize::new(2),
        });

        let bus = EventBus::builder(validator())
            .config(config("b"))
            .transport(flaky)
            .build();
        let (count, handler) = counting();
        let _sub = bus.subscribe("*", handler).unwrap();
        bus.start();
        wait_subscribed(&shared, 1).await;
        assert_eq!(bus.stats().bridge_restarts, 2);

        let mut env = envelope("campaign:update:v1:success");
        env.metadata.origin_instance = Some("a".into());
        shared
            .publish(&topic_channel("campaign:update"), serde_json::to_vec(&env).unwrap())
            .await
            .unwrap();
        wait_for(&count, 1).await;
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_undecodable_peer_message_is_skipped() {
        let shared = InMemoryTransport::new();
        let bus = EventBus::builder(validator())
            .config(config("b"))
            .transport(Arc::new(shared.clone()))
            .build();
        let (count, handler) = counting();
        let _sub = bus.subscribe("*", handler).unwrap();
        bus.start();
        wait_subscribed(&shared, 1).await;

        shared.publish(DEFAULT_CHANNEL, b"not json".to_vec()).await.unwrap();
        let mut env = envelope("campaign:state:v1:success");
        env.metadata.origin_instance = Some("a".into());
        shared
            .publish(DEFAULT_CHANNEL, serde_json::to_vec(&env).unwrap())
            .await
            .unwrap();

        wait_for(&count, 1).await;
        let stats = bus.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.remote_received, 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_emit_via_sink_trait() {
        let bus = EventBus::builder(validator()).config(config("a")).build();
        let mut stream = bus.subscribe_stream(&["*"]).unwrap();
        let sink: Arc<dyn EventSink> = bus.clone();
        sink.emit(envelope("campaign:stream:v1:started")).await.unwrap();
        assert!(stream.try_recv().unwrap().is_some());
        assert_eq!(EventPublisher::events_published(bus.as_ref()), 1);
    }
}
