//! # Stream Controller
//!
//! Runs long-lived `requested` events as streaming sessions.
//!
//! ```text
//! start(request) ──► [permit] ──► *:started ──► session task
//!                                                 │
//!                     ┌───────────────────────────┤ select!
//!                     │ handler task (JoinHandle) │ cancel token
//!                     │ heartbeat tick            │ deadline
//!                     └───────────────────────────┘
//!                                 │
//!                      exactly one *:success | *:failed
//! ```
//!
//! The handler runs in its own task so a panic surfaces as a `JoinError`
//! instead of tearing down the session task. Every session holds one
//! semaphore permit; when none is left `start` fails with `Busy`.

use crate::config::StreamConfig;
use crate::emitter::ChunkEmitter;
use crate::session::{SessionInfo, SessionPhase, StreamSession};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nexus_telemetry::{log_event, STREAM_OUTCOMES, STREAM_REJECTED, STREAM_SESSIONS_ACTIVE};
use nexus_types::payload::to_payload;
use nexus_types::{
    panic_message, EventCatalog, EventEnvelope, EventSink, EventState, Failure, NexusError,
    STREAMING_MARKER,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

// =============================================================================
// HANDLERS
// =============================================================================

/// Produces the chunks and the final result of one streaming action.
///
/// Implementations should return promptly once `ctx.is_cancelled()`; a
/// handler that ignores cancellation is aborted at the deadline.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn run(&self, ctx: StreamContext) -> Result<Value, NexusError>;
}

/// Adapter turning an async closure into a [`StreamHandler`].
pub struct FnStreamHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> StreamHandler for FnStreamHandler<F>
where
    F: Fn(StreamContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, NexusError>> + Send + 'static,
{
    async fn run(&self, ctx: StreamContext) -> Result<Value, NexusError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable stream handler.
pub fn stream_handler_fn<F, Fut>(f: F) -> Arc<dyn StreamHandler>
where
    F: Fn(StreamContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, NexusError>> + Send + 'static,
{
    Arc::new(FnStreamHandler { f })
}

/// What a handler sees of its session.
#[derive(Clone)]
pub struct StreamContext {
    request: Arc<EventEnvelope>,
    emitter: ChunkEmitter,
    cancel: CancellationToken,
}

impl StreamContext {
    /// The originating `requested` event.
    #[must_use]
    pub fn request(&self) -> &EventEnvelope {
        &self.request
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.request.event_id
    }

    /// Emit one `*:stream` chunk.
    pub async fn emit(&self, data: Value) -> Result<u64, NexusError> {
        self.emitter.emit(data).await
    }

    #[must_use]
    pub fn emitter(&self) -> &ChunkEmitter {
        &self.emitter
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session is cancelled, times out or the controller stops.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

/// Controller counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub started: u64,
    pub succeeded: u64,
    /// Handler errors, panics, timeouts and failed starts.
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub panicked: u64,
    pub rejected: u64,
    pub active: usize,
}

enum Outcome {
    Success(Value),
    Failed(NexusError),
    TimedOut(NexusError),
    Cancelled,
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for [`StreamController`]. Handlers are fixed at build time.
pub struct StreamControllerBuilder {
    config: StreamConfig,
    sink: Arc<dyn EventSink>,
    catalog: Option<Arc<EventCatalog>>,
    handlers: HashMap<String, Arc<dyn StreamHandler>>,
}

impl StreamControllerBuilder {
    #[must_use]
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the catalog's streaming declarations instead of the action name alone.
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<EventCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Register the handler for a `service:action` topic.
    #[must_use]
    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn StreamHandler>) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<StreamController> {
        info!(
            handlers = self.handlers.len(),
            max_sessions = self.config.max_sessions,
            "Stream controller ready"
        );
        Arc::new(StreamController {
            permits: Arc::new(Semaphore::new(self.config.max_sessions)),
            config: self.config,
            sink: self.sink,
            catalog: self.catalog,
            handlers: self.handlers,
            sessions: DashMap::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            counters: Counters::default(),
        })
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Owns every streaming session of this instance.
pub struct StreamController {
    config: StreamConfig,
    sink: Arc<dyn EventSink>,
    catalog: Option<Arc<EventCatalog>>,
    handlers: HashMap<String, Arc<dyn StreamHandler>>,
    permits: Arc<Semaphore>,
    sessions: DashMap<String, Arc<StreamSession>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    counters: Counters,
}

impl StreamController {
    /// Lifecycle events are emitted through `sink`.
    pub fn builder(sink: Arc<dyn EventSink>) -> StreamControllerBuilder {
        StreamControllerBuilder {
            config: StreamConfig::default(),
            sink,
            catalog: None,
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Topics with a registered handler, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Whether `envelope` is a request this controller would run.
    #[must_use]
    pub fn is_streaming(&self, envelope: &EventEnvelope) -> bool {
        envelope.state() == EventState::Requested
            && self.handlers.contains_key(&envelope.topic())
            && self.is_streaming_topic(envelope)
    }

    fn is_streaming_topic(&self, envelope: &EventEnvelope) -> bool {
        match &self.catalog {
            Some(catalog) => catalog.is_streaming(&envelope.event_type),
            None => envelope.event_type.action().contains(STREAMING_MARKER),
        }
    }

    /// Start a session for `request`. Returns the session id (the request's event id).
    ///
    /// # Errors
    ///
    /// - `InvalidEventType` if the request is not a streaming `requested` event
    ///   with a registered handler
    /// - `Validation` if a session with the same id is already running
    /// - `Busy` when every session slot is taken
    /// - `Closed` after [`shutdown`](Self::shutdown)
    pub async fn start(self: &Arc<Self>, request: EventEnvelope) -> Result<String, NexusError> {
        if self.cancel.is_cancelled() {
            return Err(NexusError::Closed);
        }
        if request.state() != EventState::Requested {
            return Err(NexusError::invalid_type(
                request.event_type.to_string(),
                "streaming sessions start from a requested event",
            ));
        }
        let topic = request.topic();
        let Some(handler) = self.handlers.get(&topic).cloned() else {
            return Err(NexusError::invalid_type(
                request.event_type.to_string(),
                "no stream handler registered",
            ));
        };
        if !self.is_streaming_topic(&request) {
            return Err(NexusError::invalid_type(
                request.event_type.to_string(),
                "action is not streaming-capable",
            ));
        }
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                STREAM_REJECTED.inc();
                log_event!(warn, "stream", "Stream rejected: busy", &request, limit = self.config.max_sessions);
                return Err(NexusError::busy("stream sessions", self.config.max_sessions));
            }
        };

        let cancel = self.cancel.child_token();
        let session = Arc::new(StreamSession::new(&request, self.config.deadline, cancel.clone()));
        let request = Arc::new(request);
        let session_id = session.session_id().to_string();

        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                return Err(NexusError::Validation(format!("session {session_id} is already running")));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
            }
        }

        let emitter = ChunkEmitter::new(Arc::clone(&request), Arc::clone(&session), Arc::clone(&self.sink));
        session.advance(SessionPhase::Started);
        let info = session.info();
        let announced = self
            .sink
            .emit(request.reply(
                EventState::Started,
                json!({ "session_id": &session_id, "deadline": info.deadline }),
            ))
            .await;
        if let Err(err) = announced {
            self.sessions.remove(&session_id);
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            STREAM_OUTCOMES.with_label_values(&[err.reason().as_str()]).inc();
            log_event!(warn, "stream", "Started event emit failed", &request, error = %err);
            if let Err(emit_err) = emitter
                .finish(EventState::Failed, failure_payload(&err), SessionPhase::Failed)
                .await
            {
                log_event!(warn, "stream", "Terminal event emit failed", &request, error = %emit_err);
            }
            return Err(err);
        }

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        STREAM_SESSIONS_ACTIVE.inc();
        log_event!(info, "stream", "Stream session started", &request, session_id = %session_id);

        let ctx = StreamContext {
            request: Arc::clone(&request),
            emitter: emitter.clone(),
            cancel,
        };
        let controller = Arc::clone(self);
        self.tracker.spawn(async move {
            controller.drive(handler, ctx, session, emitter, permit).await;
        });
        Ok(session_id)
    }

    async fn drive(
        self: Arc<Self>,
        handler: Arc<dyn StreamHandler>,
        ctx: StreamContext,
        session: Arc<StreamSession>,
        emitter: ChunkEmitter,
        permit: OwnedSemaphorePermit,
    ) {
        let started = Instant::now();
        let request = Arc::clone(&ctx.request);
        let cancel = ctx.cancel.clone();
        let mut worker = self.tracker.spawn(async move { handler.run(ctx).await });

        let deadline = tokio::time::sleep(self.config.deadline);
        tokio::pin!(deadline);
        let heartbeat = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(started + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                biased;
                joined = &mut worker => {
                    break match joined {
                        Ok(Ok(value)) => Outcome::Success(value),
                        Ok(Err(NexusError::Cancelled(_) | NexusError::Closed)) => Outcome::Cancelled,
                        Ok(Err(err)) => Outcome::Failed(err),
                        Err(err) if err.is_panic() => {
                            let payload = err.into_panic();
                            Outcome::Failed(NexusError::WorkerPanic(panic_message(&*payload)))
                        }
                        Err(_) => Outcome::Cancelled,
                    };
                }
                () = cancel.cancelled() => break Outcome::Cancelled,
                () = &mut deadline => {
                    break Outcome::TimedOut(NexusError::StreamTimeout {
                        session_id: session.session_id().to_string(),
                        elapsed: started.elapsed(),
                    });
                }
                _ = ticker.tick() => {
                    if let Err(err) = emitter.heartbeat(started.elapsed()).await {
                        log_event!(warn, "stream", "Heartbeat emit failed", &request, error = %err);
                    }
                }
            }
        };

        if !worker.is_finished() {
            cancel.cancel();
            worker.abort();
        }

        let (state, payload, phase, label) = match outcome {
            Outcome::Success(value) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                (EventState::Success, value, SessionPhase::Succeeded, "success")
            }
            Outcome::Failed(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(err, NexusError::WorkerPanic(_)) {
                    self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                    log_event!(error, "stream", "Stream worker panicked", &request, error = %err);
                } else {
                    log_event!(warn, "stream", "Stream worker failed", &request, error = %err);
                }
                (EventState::Failed, failure_payload(&err), SessionPhase::Failed, err.reason().as_str())
            }
            Outcome::TimedOut(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                log_event!(warn, "stream", "Stream deadline exceeded", &request, error = %err);
                (EventState::Failed, failure_payload(&err), SessionPhase::Failed, err.reason().as_str())
            }
            Outcome::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let err = NexusError::Cancelled(format!("session {} cancelled", session.session_id()));
                (EventState::Failed, failure_payload(&err), SessionPhase::Cancelled, err.reason().as_str())
            }
        };

        STREAM_OUTCOMES.with_label_values(&[label]).inc();
        STREAM_SESSIONS_ACTIVE.dec();
        drop(permit);
        self.sessions.remove(session.session_id());

        match emitter.finish(state, payload, phase).await {
            Ok(true) => {
                log_event!(debug, "stream", "Stream session finished", &request, outcome = label, chunks = session.info().chunks);
            }
            Ok(false) => debug!(session_id = session.session_id(), "Terminal event already emitted"),
            Err(err) => {
                log_event!(warn, "stream", "Terminal event emit failed", &request, error = %err);
            }
        }
    }

    /// Cancel a running session. Returns `false` if it is unknown or done.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => {
                session.cancellation().cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let c = &self.counters;
        StreamStats {
            started: c.started.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            active: self.sessions.len(),
        }
    }

    /// Cancel every session and wait until each has emitted its terminal event.
    pub async fn shutdown(&self) {
        info!(active = self.sessions.len(), "Stopping stream controller");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn failure_payload(err: &NexusError) -> Value {
    to_payload(&Failure::from(err)).unwrap_or_else(|_| json!({ "message": err.to_string() }))
}
