//! # Delivery Worker Pool
//!
//! Handler callbacks never run on the publisher's task. Each publish enqueues
//! one job per matching handler onto a bounded per-worker queue; a full queue
//! drops the job and counts it, so a slow handler cannot stall a producer.
//!
//! Jobs are sharded by (subscription, entity or correlation id), which keeps
//! delivery to one subscriber in publish order for a given entity while
//! different subscribers and entities proceed in parallel.
//!
//! ```text
//! publish ──► shard(sub, key) ──► [queue 0] ──► worker 0 ──► handler.handle()
//!                               ├► [queue 1] ──► worker 1
//!                               └► [queue N] ──► worker N
//! ```

use crate::handler::EventHandler;
use futures::FutureExt;
use nexus_telemetry::{metric_inc, EVENTS_DELIVERED, HANDLER_PANICS};
use nexus_types::{panic_message, EventEnvelope};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// One handler invocation.
pub(crate) struct DeliveryJob {
    pub(crate) subscription_id: u64,
    pub(crate) envelope: Arc<EventEnvelope>,
    pub(crate) handler: Arc<dyn EventHandler>,
}

/// Counters shared by the pool's workers.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) delivered: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) panicked: AtomicU64,
}

/// Fixed set of delivery workers with bounded queues.
pub(crate) struct DeliveryPool {
    senders: Vec<mpsc::Sender<DeliveryJob>>,
    receivers: Mutex<Vec<mpsc::Receiver<DeliveryJob>>>,
    counters: Arc<PoolCounters>,
}

impl DeliveryPool {
    pub(crate) fn new(workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let per_worker = (queue_capacity / workers).max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..workers).map(|_| mpsc::channel(per_worker)).unzip();
        Self {
            senders,
            receivers: Mutex::new(receivers),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Enqueue without waiting. Returns the job back when its queue is full or closed.
    pub(crate) fn try_enqueue(&self, job: DeliveryJob) -> Result<(), DeliveryJob> {
        let shard = self.shard_for(&job);
        self.senders[shard].try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
        })
    }

    fn shard_for(&self, job: &DeliveryJob) -> usize {
        let mut hasher = DefaultHasher::new();
        job.subscription_id.hash(&mut hasher);
        job.envelope
            .entity_id
            .as_deref()
            .unwrap_or(&job.envelope.correlation_id)
            .hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Spawn the workers. Only the first call has an effect.
    pub(crate) fn spawn(&self, tracker: &TaskTracker, cancel: &CancellationToken) {
        let receivers = std::mem::take(&mut *self.receivers.lock());
        for (index, receiver) in receivers.into_iter().enumerate() {
            tracker.spawn(run_worker(
                index,
                receiver,
                cancel.clone(),
                self.counters.clone(),
            ));
        }
    }

    pub(crate) fn counters(&self) -> &PoolCounters {
        &self.counters
    }

    pub(crate) fn workers(&self) -> usize {
        self.senders.len()
    }
}

async fn run_worker(
    index: usize,
    mut receiver: mpsc::Receiver<DeliveryJob>,
    cancel: CancellationToken,
    counters: Arc<PoolCounters>,
) {
    debug!(worker = index, "Delivery worker started");
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let outcome = AssertUnwindSafe(job.handler.handle(job.envelope.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                metric_inc!(EVENTS_DELIVERED);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker = index,
                    subscription = job.subscription_id,
                    event_id = %job.envelope.event_id,
                    event_type = %job.envelope.event_type,
                    error = %e,
                    "Handler returned error"
                );
            }
            Err(panic) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                metric_inc!(HANDLER_PANICS);
                error!(
                    worker = index,
                    subscription = job.subscription_id,
                    event_id = %job.envelope.event_id,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked, worker continues"
                );
            }
        }
    }
    debug!(worker = index, "Delivery worker stopped");
}
