//! # Transport Gateway
//!
//! The boundary between sockets and the core. The socket layer reports
//! connects and disconnects and hands over raw client messages; the gateway
//! turns messages into validated envelopes and pushes entity events back
//! through a [`DeliverySink`].
//!
//! ```text
//!  socket ──raw──► ingest ──► EventPublisher
//!  socket ◄─on_deliver── forwarder ◄── SubscriberRegistry (entity channel)
//! ```
//!
//! Each connection gets one forwarder task. It ends when the socket layer
//! disconnects, when delivery fails, or when a newer connection of the same
//! actor replaces the subscription; in every case the subscription is
//! released and the connection slot freed.

use crate::config::GatewayConfig;
use crate::connection::ConnectionContext;
use async_trait::async_trait;
use dashmap::DashMap;
use nexus_bus::{EventPublisher, PublishOutcome};
use nexus_state::SubscriberRegistry;
use nexus_telemetry::{log_event, INGEST_ERRORS, WS_CONNECTIONS};
use nexus_types::{EventEnvelope, EventState, NexusError};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Source stamped on envelopes that arrive through the gateway.
pub const GATEWAY_SOURCE: &str = "gateway";

/// Pushes one event down one client connection.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    /// An error ends the connection's forwarder.
    async fn on_deliver(&self, subscriber_id: &str, event: &EventEnvelope) -> Result<(), NexusError>;
}

/// Receipt for an ingested message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestAck {
    pub event_id: String,
    pub correlation_id: String,
    pub event_type: String,
    pub duplicate: bool,
}

/// Returned by [`TransportGateway::connect`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: String,
    closed: CancellationToken,
}

impl ConnectionHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Resolves once the gateway has dropped the connection.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected_connections: AtomicU64,
    ingested: AtomicU64,
    ingest_rejected: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Gateway counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub active_connections: usize,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub ingested: u64,
    pub ingest_rejected: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
}

struct Connection {
    context: ConnectionContext,
    cancel: CancellationToken,
}

/// Connection bookkeeping, ingest and per-connection delivery.
pub struct TransportGateway {
    config: GatewayConfig,
    publisher: Arc<dyn EventPublisher>,
    registry: Arc<SubscriberRegistry>,
    connections: DashMap<String, Connection>,
    active: AtomicUsize,
    per_ip: DashMap<IpAddr, usize>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    counters: Counters,
}

impl TransportGateway {
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        publisher: Arc<dyn EventPublisher>,
        registry: Arc<SubscriberRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            publisher,
            registry,
            connections: DashMap::new(),
            active: AtomicUsize::new(0),
            per_ip: DashMap::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // =========================================================================
    // INGEST
    // =========================================================================

    /// Parse a client message, fill what the connection knows and publish it.
    ///
    /// Missing `event_id` and `correlation_id` are generated; missing
    /// `entity_id`, `metadata.actor_id`, `metadata.session_id` and
    /// `metadata.device_id` come from `conn`. Clients may only send
    /// `requested` events; every later state is produced server-side.
    ///
    /// # Errors
    ///
    /// - `Serialization` for malformed JSON
    /// - `InvalidEventType` for a bad or unregistered type
    /// - `Validation` for a non-`requested` state
    pub async fn ingest(&self, raw: &str, conn: &ConnectionContext) -> Result<IngestAck, NexusError> {
        match self.ingest_inner(raw, conn).await {
            Ok(ack) => {
                self.counters.ingested.fetch_add(1, Ordering::Relaxed);
                Ok(ack)
            }
            Err(err) => {
                self.counters.ingest_rejected.fetch_add(1, Ordering::Relaxed);
                INGEST_ERRORS.with_label_values(&[err.reason().as_str()]).inc();
                debug!(
                    connection_id = %conn.connection_id,
                    entity_id = %conn.entity_id,
                    error = %err,
                    "Client message rejected"
                );
                Err(err)
            }
        }
    }

    async fn ingest_inner(&self, raw: &str, conn: &ConnectionContext) -> Result<IngestAck, NexusError> {
        let mut envelope = EventEnvelope::from_json(raw)?;
        if envelope.state() != EventState::Requested {
            return Err(NexusError::Validation(format!(
                "clients may only send requested events, got '{}'",
                envelope.event_type
            )));
        }

        if envelope.entity_id.is_none() {
            envelope.entity_id = Some(conn.entity_id.clone());
        }
        let metadata = &mut envelope.metadata;
        metadata.actor_id.get_or_insert_with(|| conn.actor_id.clone());
        metadata.session_id.get_or_insert_with(|| conn.session_id.clone());
        if metadata.device_id.is_none() {
            metadata.device_id = conn.device_id.clone();
        }
        metadata.source.get_or_insert_with(|| GATEWAY_SOURCE.to_string());
        // Origin is assigned by the bus, never by a client.
        metadata.origin_instance = None;

        let ack = IngestAck {
            event_id: envelope.event_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            event_type: envelope.event_type.to_string(),
            duplicate: false,
        };
        log_event!(debug, "gateway", "Client event ingested", &envelope, connection_id = %conn.connection_id);

        match self.publisher.publish(envelope).await? {
            PublishOutcome::Delivered { .. } => Ok(ack),
            PublishOutcome::Duplicate => Ok(IngestAck { duplicate: true, ..ack }),
        }
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Register a connection and start delivering its entity's events to `sink`.
    ///
    /// # Errors
    ///
    /// - `Busy` when the total or per-address connection limit is reached
    /// - `Validation` for empty entity or actor ids
    /// - `Closed` after [`shutdown`](Self::shutdown)
    pub fn connect(
        self: &Arc<Self>,
        context: ConnectionContext,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<ConnectionHandle, NexusError> {
        if self.cancel.is_cancelled() {
            return Err(NexusError::Closed);
        }
        self.reserve_slot(context.remote_addr)?;

        let subscription = match self
            .registry
            .subscribe(&context.entity_id, context.subscriber_id())
        {
            Ok(subscription) => subscription,
            Err(err) => {
                self.release_slot(context.remote_addr);
                return Err(err);
            }
        };

        let cancel = self.cancel.child_token();
        let connection_id = context.connection_id.clone();
        self.connections.insert(
            connection_id.clone(),
            Connection {
                context: context.clone(),
                cancel: cancel.clone(),
            },
        );
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        WS_CONNECTIONS.inc();
        info!(
            connection_id = %connection_id,
            entity_id = %context.entity_id,
            actor_id = %context.actor_id,
            "Client connected"
        );

        let gateway = Arc::clone(self);
        let token = cancel.clone();
        let (mut receiver, unsubscribe) = subscription.into_parts();
        self.tracker.spawn(async move {
            let subscriber_id = context.subscriber_id().to_string();
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(event) => match sink.on_deliver(&subscriber_id, &event).await {
                            Ok(()) => {
                                gateway.counters.delivered.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                gateway.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    connection_id = %context.connection_id,
                                    error = %err,
                                    "Delivery failed, dropping connection"
                                );
                                break;
                            }
                        },
                        None => {
                            debug!(connection_id = %context.connection_id, "Subscription closed");
                            break;
                        }
                    },
                }
            }
            drop(unsubscribe);
            token.cancel();
            gateway.release(&context.connection_id);
        });

        Ok(ConnectionHandle {
            connection_id,
            closed: cancel,
        })
    }

    /// Stop delivery to a connection. Returns `false` if it is unknown.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let Some(cancel) = self
            .connections
            .get(connection_id)
            .map(|c| c.cancel.clone())
        else {
            return false;
        };
        cancel.cancel();
        self.release(connection_id);
        true
    }

    fn reserve_slot(&self, addr: Option<IpAddr>) -> Result<(), NexusError> {
        let max = self.config.max_connections;
        if self.active.fetch_add(1, Ordering::AcqRel) >= max {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(self.reject("connections", max));
        }
        if let Some(ip) = addr {
            let max_per_ip = self.config.max_connections_per_ip;
            let mut count = self.per_ip.entry(ip).or_insert(0);
            if *count >= max_per_ip {
                drop(count);
                self.active.fetch_sub(1, Ordering::AcqRel);
                return Err(self.reject("connections per address", max_per_ip));
            }
            *count += 1;
        }
        Ok(())
    }

    fn reject(&self, resource: &str, limit: usize) -> NexusError {
        self.counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
        warn!(resource, limit, "Connection rejected");
        NexusError::busy(resource, limit)
    }

    fn release_slot(&self, addr: Option<IpAddr>) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(ip) = addr {
            if let Some(mut count) = self.per_ip.get_mut(&ip) {
                *count = count.saturating_sub(1);
            }
            self.per_ip.remove_if(&ip, |_, count| *count == 0);
        }
    }

    fn release(&self, connection_id: &str) {
        if let Some((_, connection)) = self.connections.remove(connection_id) {
            self.release_slot(connection.context.remote_addr);
            WS_CONNECTIONS.dec();
            info!(
                connection_id,
                entity_id = %connection.context.entity_id,
                "Client disconnected"
            );
        }
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn connections_from(&self, addr: IpAddr) -> usize {
        self.per_ip.get(&addr).map_or(0, |c| *c)
    }

    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    #[must_use]
    pub fn connection(&self, connection_id: &str) -> Option<ConnectionContext> {
        self.connections.get(connection_id).map(|c| c.context.clone())
    }

    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let c = &self.counters;
        GatewayStats {
            active_connections: self.connections.len(),
            connections_accepted: c.accepted.load(Ordering::Relaxed),
            connections_rejected: c.rejected_connections.load(Ordering::Relaxed),
            ingested: c.ingested.load(Ordering::Relaxed),
            ingest_rejected: c.ingest_rejected.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
        }
    }

    /// Drop every connection and wait for the forwarders to finish.
    pub async fn shutdown(&self) {
        info!(connections = self.connections.len(), "Stopping gateway");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
