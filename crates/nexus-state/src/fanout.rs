//! # Subscriber Registry & Fan-out
//!
//! Per-entity set of live consumer channels. Each subscriber owns one
//! bounded channel; the gateway reads it and writes to the client socket.
//!
//! ## Delivery Policy
//!
//! ```text
//! notify(entity, env)
//!   ├─ snapshot senders (registry lock released before any await)
//!   ├─ send to all subscribers concurrently, each bounded by send_timeout
//!   │     ├─ ok       ──► delivered
//!   │     ├─ timeout  ──► dropped for this subscriber only, slow consumer
//!   │     └─ closed   ──► subscriber removed
//!   └─ NotifyReport { delivered, slow, closed }
//! ```
//!
//! A subscriber whose channel stays full delays a notify by at most one
//! `send_timeout`, never longer, and never blocks other subscribers.

use crate::config::FanoutConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use nexus_telemetry::{time_histogram, FANOUT_DURATION, SLOW_CONSUMERS, SUBSCRIBERS_ACTIVE};
use nexus_types::{EventEnvelope, NexusError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

struct Subscriber {
    generation: u64,
    sender: mpsc::Sender<Arc<EventEnvelope>>,
    created_at: DateTime<Utc>,
    last_delivered_at: Mutex<Option<DateTime<Utc>>>,
}

/// Public view of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberInfo {
    pub subscriber_id: String,
    pub created_at: DateTime<Utc>,
    pub last_delivered_at: Option<DateTime<Utc>>,
}

/// Outcome of one [`SubscriberRegistry::notify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    pub slow: usize,
    pub closed: usize,
}

/// Entity id → subscriber id → channel.
pub struct SubscriberRegistry {
    config: FanoutConfig,
    entities: DashMap<String, HashMap<String, Arc<Subscriber>>>,
    next_generation: AtomicU64,
    slow_consumers: AtomicU64,
    delivered: AtomicU64,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new(config: FanoutConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entities: DashMap::new(),
            next_generation: AtomicU64::new(0),
            slow_consumers: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Register `subscriber_id` on `entity_id`.
    ///
    /// An existing subscription under the same id is torn down first: its
    /// channel closes once in-flight sends finish, so the old reader sees
    /// the end of its stream instead of duplicate events.
    ///
    /// # Errors
    ///
    /// `Validation` when either id is empty.
    pub fn subscribe(
        self: &Arc<Self>,
        entity_id: &str,
        subscriber_id: &str,
    ) -> Result<EntitySubscription, NexusError> {
        if entity_id.is_empty() {
            return Err(NexusError::Validation("entity_id must not be empty".into()));
        }
        if subscriber_id.is_empty() {
            return Err(NexusError::Validation("subscriber_id must not be empty".into()));
        }

        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let subscriber = Arc::new(Subscriber {
            generation,
            sender,
            created_at: Utc::now(),
            last_delivered_at: Mutex::new(None),
        });

        let replaced = self
            .entities
            .entry(entity_id.to_string())
            .or_default()
            .insert(subscriber_id.to_string(), subscriber);

        if replaced.is_some() {
            debug!(entity_id, subscriber_id, "Replaced existing subscription");
        } else {
            SUBSCRIBERS_ACTIVE.inc();
            debug!(entity_id, subscriber_id, "Subscriber added");
        }

        Ok(EntitySubscription {
            receiver,
            handle: Unsubscribe {
                registry: Arc::downgrade(self),
                entity_id: entity_id.to_string(),
                subscriber_id: subscriber_id.to_string(),
                generation,
            },
        })
    }

    /// Remove a subscriber and close its channel. Returns `false` if absent.
    pub fn unsubscribe(&self, entity_id: &str, subscriber_id: &str) -> bool {
        self.remove_matching(entity_id, subscriber_id, None)
    }

    /// Remove only if the registered subscriber is still `generation`.
    fn remove_matching(&self, entity_id: &str, subscriber_id: &str, generation: Option<u64>) -> bool {
        let mut removed = false;
        if let Some(mut subscribers) = self.entities.get_mut(entity_id) {
            let current = subscribers.get(subscriber_id).map(|s| s.generation);
            if current.is_some() && (generation.is_none() || current == generation) {
                subscribers.remove(subscriber_id);
                removed = true;
            }
        }
        if removed {
            self.entities.remove_if(entity_id, |_, subscribers| subscribers.is_empty());
            SUBSCRIBERS_ACTIVE.dec();
            debug!(entity_id, subscriber_id, "Subscriber removed");
        }
        removed
    }

    /// Deliver `envelope` to every subscriber of `entity_id`.
    pub async fn notify(&self, entity_id: &str, envelope: Arc<EventEnvelope>) -> NotifyReport {
        let snapshot: Vec<(String, Arc<Subscriber>)> = match self.entities.get(entity_id) {
            Some(subscribers) => subscribers
                .iter()
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect(),
            None => return NotifyReport::default(),
        };

        let _timer = time_histogram!(FANOUT_DURATION);
        let timeout = self.config.send_timeout;
        let sends = snapshot.iter().map(|(_, subscriber)| {
            let envelope = envelope.clone();
            async move { subscriber.sender.send_timeout(envelope, timeout).await }
        });
        let results = join_all(sends).await;

        let mut report = NotifyReport::default();
        for ((subscriber_id, subscriber), result) in snapshot.iter().zip(results) {
            match result {
                Ok(()) => {
                    report.delivered += 1;
                    *subscriber.last_delivered_at.lock() = Some(Utc::now());
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    report.slow += 1;
                    self.slow_consumers.fetch_add(1, Ordering::Relaxed);
                    SLOW_CONSUMERS.inc();
                    let err = NexusError::SlowConsumer {
                        subscriber_id: subscriber_id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    warn!(
                        entity_id,
                        event_id = %envelope.event_id,
                        error = %err,
                        "Event dropped for slow subscriber"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => {
                    report.closed += 1;
                    self.remove_matching(entity_id, subscriber_id, Some(subscriber.generation));
                }
            }
        }

        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        debug!(
            entity_id,
            event_type = %envelope.event_type,
            delivered = report.delivered,
            slow = report.slow,
            closed = report.closed,
            "Fan-out complete"
        );
        report
    }

    #[must_use]
    pub fn subscriber_count(&self, entity_id: &str) -> usize {
        self.entities.get(entity_id).map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn total_subscribers(&self) -> usize {
        self.entities.iter().map(|e| e.value().len()).sum()
    }

    /// Events dropped for slow subscribers since start.
    #[must_use]
    pub fn slow_consumer_count(&self) -> u64 {
        self.slow_consumers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn subscribers(&self, entity_id: &str) -> Vec<SubscriberInfo> {
        let mut infos: Vec<SubscriberInfo> = self
            .entities
            .get(entity_id)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .map(|(id, s)| SubscriberInfo {
                        subscriber_id: id.clone(),
                        created_at: s.created_at,
                        last_delivered_at: *s.last_delivered_at.lock(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        infos.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
        infos
    }
}

/// Removes its subscription when dropped, unless a newer subscription
/// under the same id has replaced it.
#[derive(Debug)]
pub struct Unsubscribe {
    registry: Weak<SubscriberRegistry>,
    entity_id: String,
    subscriber_id: String,
    generation: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_matching(&self.entity_id, &self.subscriber_id, Some(self.generation));
        }
    }
}

/// A live entity subscription: the receiving end plus its removal handle.
#[derive(Debug)]
pub struct EntitySubscription {
    receiver: mpsc::Receiver<Arc<EventEnvelope>>,
    handle: Unsubscribe,
}

impl EntitySubscription {
    /// Next event; `None` after unsubscribe or replacement.
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.receiver.try_recv().ok()
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.handle.entity_id
    }

    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        &self.handle.subscriber_id
    }

    /// Split into receiver and handle, e.g. to move the receiver into a task.
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<Arc<EventEnvelope>>, Unsubscribe) {
        (self.receiver, self.handle)
    }
}
