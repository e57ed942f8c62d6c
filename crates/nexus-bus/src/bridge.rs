//! # Cross-Instance Bridge
//!
//! Two background tasks per bus connect it to the [`ClusterTransport`]:
//!
//! - **Forwarder**: drains the bounded outbound queue and publishes each
//!   serialized envelope on its topic channel. Best-effort: a failed publish
//!   is logged and counted, never retried.
//! - **Receiver**: one subscription for the whole process. Decodes envelopes
//!   and hands them to [`EventBus::ingest_remote`], which drops this
//!   instance's own echoes and ids it already delivered. Decode errors skip
//!   the message; a failed subscribe or an ended stream restarts the loop
//!   with exponential backoff.

use crate::bus::EventBus;
use crate::transport::ClusterTransport;
use futures::StreamExt;
use nexus_telemetry::{BRIDGE_RESTARTS, EVENTS_DROPPED};
use nexus_types::{EventEnvelope, ExponentialBackoff};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters owned by the bridge tasks.
#[derive(Debug, Default)]
pub(crate) struct BridgeCounters {
    pub(crate) forwarded: AtomicU64,
    pub(crate) forward_failures: AtomicU64,
    pub(crate) received: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) restarts: AtomicU64,
}

/// One outbound item: channel name plus the envelope to serialize.
pub(crate) struct Outbound {
    pub(crate) channel: String,
    pub(crate) envelope: Arc<EventEnvelope>,
}

pub(crate) async fn run_forwarder(
    mut outbound: mpsc::Receiver<Outbound>,
    transport: Arc<dyn ClusterTransport>,
    counters: Arc<BridgeCounters>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = outbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let bytes = match serde_json::to_vec(item.envelope.as_ref()) {
            Ok(bytes) => bytes,
            Err(e) => {
                counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %item.envelope.event_id, error = %e, "Envelope serialization failed");
                continue;
            }
        };

        match transport.publish(&item.channel, bytes).await {
            Ok(()) => {
                counters.forwarded.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %item.channel, event_id = %item.envelope.event_id, "Forwarded to peers");
            }
            Err(e) => {
                counters.forward_failures.fetch_add(1, Ordering::Relaxed);
                EVENTS_DROPPED.with_label_values(&["bridge_outbound"]).inc();
                warn!(
                    channel = %item.channel,
                    event_id = %item.envelope.event_id,
                    error = %e,
                    "Cross-instance publish failed"
                );
            }
        }
    }
    debug!("Bridge forwarder stopped");
}

/// Reconnect schedule for the receiver loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReconnectPolicy {
    pub(crate) min: Duration,
    pub(crate) max: Duration,
}

pub(crate) async fn run_receiver(
    bus: Weak<EventBus>,
    transport: Arc<dyn ClusterTransport>,
    channels: Vec<String>,
    counters: Arc<BridgeCounters>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::new(policy.min, policy.max, 2.0, 0.2);

    loop {
        match transport.subscribe(&channels).await {
            Ok(mut stream) => {
                info!(channels = channels.len(), "Bridge receiver subscribed");
                backoff.reset();
                loop {
                    let message = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        message = stream.next() => message,
                    };
                    let Some(message) = message else {
                        warn!("Transport stream ended");
                        break;
                    };

                    let envelope = match serde_json::from_slice::<EventEnvelope>(&message.payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(channel = %message.channel, error = %e, "Undecodable envelope skipped");
                            continue;
                        }
                    };

                    let Some(live) = bus.upgrade() else {
                        return;
                    };
                    live.ingest_remote(envelope);
                }
            }
            Err(e) => warn!(error = %e, "Bridge subscribe failed"),
        }

        counters.restarts.fetch_add(1, Ordering::Relaxed);
        BRIDGE_RESTARTS.inc();
        let delay = backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempts(), "Restarting bridge receiver");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}
