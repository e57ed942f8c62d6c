//! # Built-in Stream Handlers
//!
//! - `{entity_type}:stream_state` emits the entity snapshot whenever its
//!   version changed since the previous tick (1s by default).
//! - `{entity_type}:stream_analytics` emits [`EntityAnalytics`] every tick
//!   (5s by default).
//!
//! Both run until the session is cancelled or reaches its deadline, or for
//! `duration_ms` when the request payload asks for it. `interval_ms`
//! overrides the tick.
//!
//! [`EntityAnalytics`]: nexus_state::EntityAnalytics

use async_trait::async_trait;
use nexus_state::EntityStateStore;
use nexus_stream::{StreamContext, StreamHandler};
use nexus_types::payload::to_payload;
use nexus_types::{NexusError, DEFAULT_ENTITY_ID};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

pub const STREAM_STATE_ACTION: &str = "stream_state";
pub const STREAM_ANALYTICS_ACTION: &str = "stream_analytics";

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Optional request payload fields understood by the built-in streams.
#[derive(Debug, Default, Deserialize)]
struct StreamOptions {
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    interval_ms: Option<u64>,
}

impl StreamOptions {
    fn from_request(ctx: &StreamContext) -> Self {
        serde_json::from_value(ctx.request().payload.clone()).unwrap_or_default()
    }

    fn interval(&self, default: Duration) -> Duration {
        self.interval_ms
            .map_or(default, Duration::from_millis)
            .max(MIN_INTERVAL)
    }

    fn stop_at(&self) -> Option<Instant> {
        self.duration_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms))
    }
}

fn entity_of(ctx: &StreamContext) -> String {
    ctx.request()
        .entity_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_ENTITY_ID.to_string())
}

enum Tick {
    Next,
    Stop,
}

/// Wait for the next tick, cancellation or the requested stop time.
async fn next_tick(
    ctx: &StreamContext,
    ticker: &mut tokio::time::Interval,
    stop_at: Option<Instant>,
) -> Result<Tick, NexusError> {
    let stop = async {
        match stop_at {
            Some(at) => sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(NexusError::Cancelled(ctx.session_id().to_string())),
        _ = stop => Ok(Tick::Stop),
        _ = ticker.tick() => Ok(Tick::Next),
    }
}

/// Streams entity snapshots on change.
pub struct StateStreamHandler {
    store: Arc<EntityStateStore>,
    interval: Duration,
}

impl StateStreamHandler {
    #[must_use]
    pub fn new(store: Arc<EntityStateStore>) -> Arc<Self> {
        Self::with_interval(store, Duration::from_secs(1))
    }

    #[must_use]
    pub fn with_interval(store: Arc<EntityStateStore>, interval: Duration) -> Arc<Self> {
        Arc::new(Self { store, interval })
    }
}

#[async_trait]
impl StreamHandler for StateStreamHandler {
    async fn run(&self, ctx: StreamContext) -> Result<Value, NexusError> {
        let entity_id = entity_of(&ctx);
        let options = StreamOptions::from_request(&ctx);
        let stop_at = options.stop_at();
        let mut ticker = interval(options.interval(self.interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_version = None;
        let mut snapshots = 0u64;
        loop {
            if let Tick::Stop = next_tick(&ctx, &mut ticker, stop_at).await? {
                break;
            }
            let snapshot = self.store.load_or_create(&entity_id).await?;
            if last_version == Some(snapshot.version) {
                continue;
            }
            last_version = Some(snapshot.version);
            ctx.emit(to_payload(&snapshot)?).await?;
            snapshots += 1;
        }

        Ok(json!({
            "entity_id": entity_id,
            "snapshots": snapshots,
            "version": last_version,
        }))
    }
}

/// Streams entity analytics on a fixed period.
pub struct AnalyticsStreamHandler {
    store: Arc<EntityStateStore>,
    interval: Duration,
}

impl AnalyticsStreamHandler {
    #[must_use]
    pub fn new(store: Arc<EntityStateStore>) -> Arc<Self> {
        Self::with_interval(store, Duration::from_secs(5))
    }

    #[must_use]
    pub fn with_interval(store: Arc<EntityStateStore>, interval: Duration) -> Arc<Self> {
        Arc::new(Self { store, interval })
    }
}

#[async_trait]
impl StreamHandler for AnalyticsStreamHandler {
    async fn run(&self, ctx: StreamContext) -> Result<Value, NexusError> {
        let entity_id = entity_of(&ctx);
        self.store.load_or_create(&entity_id).await?;
        let options = StreamOptions::from_request(&ctx);
        let stop_at = options.stop_at();
        let mut ticker = interval(options.interval(self.interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut reports = 0u64;
        loop {
            if let Tick::Stop = next_tick(&ctx, &mut ticker, stop_at).await? {
                break;
            }
            // Evicted mid-stream: report nothing until it is referenced again.
            let Some(analytics) = self.store.analytics(&entity_id) else {
                continue;
            };
            ctx.emit(to_payload(&analytics)?).await?;
            reports += 1;
        }

        Ok(json!({ "entity_id": entity_id, "reports": reports }))
    }
}
