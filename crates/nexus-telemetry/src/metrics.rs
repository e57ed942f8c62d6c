//! Prometheus metrics for Nexus components.
//!
//! All metrics follow the naming convention: `nexus_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., events_published_total)
//! - **Gauge**: Value that can go up or down (e.g., active_subscribers)
//! - **Histogram**: Distribution of values (e.g., fanout_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // BUS METRICS
    // =========================================================================

    /// Events accepted by the bus, by topic
    pub static ref EVENTS_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("nexus_bus_events_published_total", "Events accepted for delivery"),
        &["topic"]
    ).expect("metric creation failed");

    /// Handler and stream deliveries completed
    pub static ref EVENTS_DELIVERED: Counter = Counter::new(
        "nexus_bus_events_delivered_total",
        "Local deliveries completed"
    ).expect("metric creation failed");

    /// Publishes suppressed by event-id dedup
    pub static ref EVENTS_DUPLICATE: Counter = Counter::new(
        "nexus_bus_events_duplicate_total",
        "Events suppressed as duplicates"
    ).expect("metric creation failed");

    /// Events dropped at a bounded queue
    pub static ref EVENTS_DROPPED: CounterVec = CounterVec::new(
        Opts::new("nexus_bus_events_dropped_total", "Events dropped at a bounded queue"),
        &["stage"]  // stage: worker_queue/stream_sink/bridge_outbound
    ).expect("metric creation failed");

    /// Publishes rejected by validation
    pub static ref EVENTS_INVALID: Counter = Counter::new(
        "nexus_bus_events_invalid_total",
        "Events rejected with InvalidEventType"
    ).expect("metric creation failed");

    /// Envelopes received from peer instances
    pub static ref BRIDGE_RECEIVED: Counter = Counter::new(
        "nexus_bridge_received_total",
        "Envelopes received over the cross-instance transport"
    ).expect("metric creation failed");

    /// Bridge receiver loop restarts
    pub static ref BRIDGE_RESTARTS: Counter = Counter::new(
        "nexus_bridge_restarts_total",
        "Cross-instance receiver loop restarts"
    ).expect("metric creation failed");

    /// Handler panics caught by delivery workers
    pub static ref HANDLER_PANICS: Counter = Counter::new(
        "nexus_bus_handler_panics_total",
        "Subscriber handler panics recovered by workers"
    ).expect("metric creation failed");

    // =========================================================================
    // STATE METRICS
    // =========================================================================

    /// Entities currently held in memory
    pub static ref ENTITIES_ACTIVE: Gauge = Gauge::new(
        "nexus_state_entities_active",
        "Entities resident in the state store"
    ).expect("metric creation failed");

    /// Applied entity updates
    pub static ref ENTITY_UPDATES: Counter = Counter::new(
        "nexus_state_updates_total",
        "Entity updates applied"
    ).expect("metric creation failed");

    /// Idle entities evicted
    pub static ref ENTITIES_EVICTED: Counter = Counter::new(
        "nexus_state_entities_evicted_total",
        "Entities evicted after the idle TTL"
    ).expect("metric creation failed");

    /// Failed durable writes (each attempt)
    pub static ref PERSIST_FAILURES: Counter = Counter::new(
        "nexus_state_persist_failures_total",
        "Failed persistence attempts"
    ).expect("metric creation failed");

    /// 1 while running in memory-only mode
    pub static ref PERSISTENCE_DEGRADED: Gauge = Gauge::new(
        "nexus_state_persistence_degraded",
        "1 when persistence is unavailable and the store runs in memory only"
    ).expect("metric creation failed");

    // =========================================================================
    // FAN-OUT METRICS
    // =========================================================================

    /// Live subscriber channels
    pub static ref SUBSCRIBERS_ACTIVE: Gauge = Gauge::new(
        "nexus_fanout_subscribers_active",
        "Live subscriber channels"
    ).expect("metric creation failed");

    /// Sends dropped after the per-subscriber timeout
    pub static ref SLOW_CONSUMERS: Counter = Counter::new(
        "nexus_fanout_slow_consumer_total",
        "Events dropped for a subscriber whose channel stayed full"
    ).expect("metric creation failed");

    /// Time to notify all subscribers of one entity
    pub static ref FANOUT_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "nexus_fanout_duration_seconds",
            "Time spent notifying an entity's subscribers"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).expect("bucket creation failed"))
    ).expect("metric creation failed");

    // =========================================================================
    // STREAM METRICS
    // =========================================================================

    /// Running stream sessions
    pub static ref STREAM_SESSIONS_ACTIVE: Gauge = Gauge::new(
        "nexus_stream_sessions_active",
        "Running stream sessions"
    ).expect("metric creation failed");

    /// Terminal outcomes by kind
    pub static ref STREAM_OUTCOMES: CounterVec = CounterVec::new(
        Opts::new("nexus_stream_outcomes_total", "Stream sessions by terminal outcome"),
        &["outcome"]  // success or a failure reason
    ).expect("metric creation failed");

    /// Sessions refused because the concurrency bound was reached
    pub static ref STREAM_REJECTED: Counter = Counter::new(
        "nexus_stream_rejected_busy_total",
        "Stream requests rejected with Busy"
    ).expect("metric creation failed");

    // =========================================================================
    // GATEWAY METRICS
    // =========================================================================

    /// Open WebSocket connections
    pub static ref WS_CONNECTIONS: Gauge = Gauge::new(
        "nexus_gateway_connections_active",
        "Open gateway connections"
    ).expect("metric creation failed");

    /// Ingest failures by reason
    pub static ref INGEST_ERRORS: CounterVec = CounterVec::new(
        Opts::new("nexus_gateway_ingest_errors_total", "Rejected client messages"),
        &["reason"]
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry. Safe to call more than once.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Bus
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(EVENTS_DELIVERED.clone()),
        Box::new(EVENTS_DUPLICATE.clone()),
        Box::new(EVENTS_DROPPED.clone()),
        Box::new(EVENTS_INVALID.clone()),
        Box::new(BRIDGE_RECEIVED.clone()),
        Box::new(BRIDGE_RESTARTS.clone()),
        Box::new(HANDLER_PANICS.clone()),
        // State
        Box::new(ENTITIES_ACTIVE.clone()),
        Box::new(ENTITY_UPDATES.clone()),
        Box::new(ENTITIES_EVICTED.clone()),
        Box::new(PERSIST_FAILURES.clone()),
        Box::new(PERSISTENCE_DEGRADED.clone()),
        // Fan-out
        Box::new(SUBSCRIBERS_ACTIVE.clone()),
        Box::new(SLOW_CONSUMERS.clone()),
        Box::new(FANOUT_DURATION.clone()),
        // Streams
        Box::new(STREAM_SESSIONS_ACTIVE.clone()),
        Box::new(STREAM_OUTCOMES.clone()),
        Box::new(STREAM_REJECTED.clone()),
        // Gateway
        Box::new(WS_CONNECTIONS.clone()),
        Box::new(INGEST_ERRORS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
