//! # Chunk Emitter
//!
//! The only path by which a session's events leave the controller. One
//! async gate orders chunks, heartbeats and the terminal event, so once
//! the terminal event is out nothing else for that session follows it.

use crate::session::{SessionPhase, StreamSession};
use nexus_types::payload::to_payload;
use nexus_types::{EventEnvelope, EventSink, EventState, Heartbeat, NexusError, StreamChunk};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Gate {
    closed: bool,
    sequence: u64,
    chunk_since_tick: bool,
}

/// Emits `*:stream` chunks for one session. Cheap to clone.
#[derive(Clone)]
pub struct ChunkEmitter {
    request: Arc<EventEnvelope>,
    session: Arc<StreamSession>,
    sink: Arc<dyn EventSink>,
    gate: Arc<Mutex<Gate>>,
}

impl ChunkEmitter {
    pub(crate) fn new(request: Arc<EventEnvelope>, session: Arc<StreamSession>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            request,
            session,
            sink,
            gate: Arc::new(Mutex::new(Gate::default())),
        }
    }

    /// Emit one chunk. Returns its sequence number, starting at 1.
    ///
    /// # Errors
    ///
    /// `Closed` once the session has ended; sink errors are passed through.
    pub async fn emit(&self, data: Value) -> Result<u64, NexusError> {
        let mut gate = self.gate.lock().await;
        if gate.closed {
            return Err(NexusError::Closed);
        }
        let sequence = gate.sequence + 1;
        let payload = to_payload(&StreamChunk { sequence, data })?;
        self.sink
            .emit(self.request.reply(EventState::Stream, payload))
            .await?;
        gate.sequence = sequence;
        gate.chunk_since_tick = true;
        self.session.record_chunk();
        Ok(sequence)
    }

    /// Emit a heartbeat unless a chunk went out since the previous tick.
    /// Returns whether one was sent.
    pub(crate) async fn heartbeat(&self, elapsed: Duration) -> Result<bool, NexusError> {
        let mut gate = self.gate.lock().await;
        if gate.closed {
            return Ok(false);
        }
        if std::mem::take(&mut gate.chunk_since_tick) {
            return Ok(false);
        }
        let count = self.session.record_heartbeat();
        let payload = to_payload(&Heartbeat::new(count, elapsed.as_millis() as u64))?;
        self.sink
            .emit(self.request.reply(EventState::Stream, payload))
            .await?;
        Ok(true)
    }

    /// Close the session and emit its terminal event.
    ///
    /// Returns `false` without emitting when the session already ended.
    pub(crate) async fn finish(
        &self,
        state: EventState,
        payload: Value,
        phase: SessionPhase,
    ) -> Result<bool, NexusError> {
        let mut gate = self.gate.lock().await;
        if gate.closed || !self.session.advance(phase) {
            return Ok(false);
        }
        gate.closed = true;
        self.sink.emit(self.request.reply(state, payload)).await?;
        Ok(true)
    }

    /// Chunks emitted so far.
    pub async fn sequence(&self) -> u64 {
        self.gate.lock().await.sequence
    }

    pub async fn is_closed(&self) -> bool {
        self.gate.lock().await.closed
    }
}
