//! # Stream Sessions
//!
//! One session per streaming request, keyed by the request's event id.
//!
//! ```text
//! [Requested] ──► [Started] ──► [Streaming]* ──► [Succeeded]
//!                     │              │       ├─► [Failed]
//!                     └──────────────┴───────┴─► [Cancelled]
//! ```
//!
//! Terminal phases are final: a second terminal transition is rejected,
//! which is what makes the terminal event unique.

use chrono::{DateTime, Utc};
use nexus_types::{EventEnvelope, EventType};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Requested,
    Started,
    Streaming,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Started => "started",
            Self::Streaming => "streaming",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Self::Requested, Self::Started) => true,
            (Self::Started | Self::Streaming, Self::Streaming) => true,
            (_, to) => to.is_terminal(),
        }
    }
}

#[derive(Debug)]
struct Progress {
    phase: SessionPhase,
    chunks: u64,
    heartbeats: u64,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

/// A live streaming session.
#[derive(Debug)]
pub struct StreamSession {
    session_id: String,
    event_type: EventType,
    correlation_id: String,
    entity_id: Option<String>,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
}

impl StreamSession {
    pub(crate) fn new(request: &EventEnvelope, deadline: std::time::Duration, cancel: CancellationToken) -> Self {
        let started_at = Utc::now();
        let deadline = chrono::Duration::from_std(deadline)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            session_id: request.event_id.clone(),
            event_type: request.event_type.clone(),
            correlation_id: request.correlation_id.clone(),
            entity_id: request.entity_id.clone(),
            started_at,
            deadline,
            cancel,
            progress: Mutex::new(Progress {
                phase: SessionPhase::Requested,
                chunks: 0,
                heartbeats: 0,
                last_heartbeat_at: None,
            }),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.progress.lock().phase
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Move to `next`. Returns `false` for an illegal transition.
    pub(crate) fn advance(&self, next: SessionPhase) -> bool {
        let mut progress = self.progress.lock();
        if !progress.phase.can_advance_to(next) {
            return false;
        }
        progress.phase = next;
        true
    }

    pub(crate) fn record_chunk(&self) {
        let mut progress = self.progress.lock();
        progress.chunks += 1;
        if progress.phase.can_advance_to(SessionPhase::Streaming) {
            progress.phase = SessionPhase::Streaming;
        }
    }

    pub(crate) fn record_heartbeat(&self) -> u64 {
        let mut progress = self.progress.lock();
        progress.heartbeats += 1;
        progress.last_heartbeat_at = Some(Utc::now());
        progress.heartbeats
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        let progress = self.progress.lock();
        SessionInfo {
            session_id: self.session_id.clone(),
            event_type: self.event_type.to_string(),
            correlation_id: self.correlation_id.clone(),
            entity_id: self.entity_id.clone(),
            started_at: self.started_at,
            deadline: self.deadline,
            phase: progress.phase,
            chunks: progress.chunks,
            heartbeats: progress.heartbeats,
            last_heartbeat_at: progress.last_heartbeat_at,
        }
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub event_type: String,
    pub correlation_id: String,
    pub entity_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub phase: SessionPhase,
    pub chunks: u64,
    pub heartbeats: u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}
