//! WebSocket surface of the gateway.
//!
//! `GET /ws/:entity_id/:actor_id` joins an entity as an actor; `GET /ws`
//! joins the default entity as a generated guest. Text frames are ingested
//! as events; entity events come back as text frames holding the envelope.
//!
//! Security features:
//! - Message size limits (default 1MB)
//! - Rate limiting per connection
//! - Connection limits, total and per remote address

use crate::config::WebSocketConfig;
use crate::connection::ConnectionContext;
use crate::gateway::{DeliverySink, TransportGateway};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use nexus_types::{EventEnvelope, NexusError, DEFAULT_ENTITY_ID};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Router with the two WebSocket routes.
pub fn routes(gateway: Arc<TransportGateway>) -> Router {
    Router::new()
        .route("/ws", get(default_entity_handler))
        .route("/ws/:entity_id/:actor_id", get(entity_handler))
        .with_state(gateway)
}

async fn entity_handler(
    ws: WebSocketUpgrade,
    Path((entity_id, actor_id)): Path<(String, String)>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(gateway): State<Arc<TransportGateway>>,
) -> Response {
    let context = if actor_id == "guest" {
        ConnectionContext::guest(entity_id)
    } else {
        ConnectionContext::new(entity_id, actor_id)
    };
    upgrade(ws, gateway, context, connect_info)
}

async fn default_entity_handler(
    ws: WebSocketUpgrade,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(gateway): State<Arc<TransportGateway>>,
) -> Response {
    upgrade(ws, gateway, ConnectionContext::guest(DEFAULT_ENTITY_ID), connect_info)
}

fn upgrade(
    ws: WebSocketUpgrade,
    gateway: Arc<TransportGateway>,
    mut context: ConnectionContext,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if let Some(ConnectInfo(addr)) = connect_info {
        context = context.with_remote_addr(addr.ip());
    }
    ws.on_upgrade(move |socket| WebSocketHandler::new(gateway, context).handle(socket))
}

/// Error frame sent for rejected client messages.
#[must_use]
pub fn error_frame(err: &NexusError) -> String {
    json!({
        "event_type": "error",
        "error": {
            "kind": err.reason().as_str(),
            "message": err.to_string(),
        }
    })
    .to_string()
}

/// Queues envelopes as text frames for the connection's writer.
struct SocketSink {
    outbound: mpsc::Sender<Message>,
}

#[async_trait]
impl DeliverySink for SocketSink {
    async fn on_deliver(&self, _subscriber_id: &str, event: &EventEnvelope) -> Result<(), NexusError> {
        let text = event.to_json()?;
        self.outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| NexusError::Closed)
    }
}

/// WebSocket connection handler
struct WebSocketHandler {
    gateway: Arc<TransportGateway>,
    context: ConnectionContext,
    config: WebSocketConfig,
    /// Message counter for rate limiting
    message_count: u32,
    /// Rate limit window start
    rate_limit_window: Instant,
}

impl WebSocketHandler {
    fn new(gateway: Arc<TransportGateway>, context: ConnectionContext) -> Self {
        let config = gateway.config().websocket.clone();
        Self {
            gateway,
            context,
            config,
            message_count: 0,
            rate_limit_window: Instant::now(),
        }
    }

    /// Check rate limit, returns true if request is allowed
    fn check_rate_limit(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.rate_limit_window);

        // Reset window every second
        if elapsed >= Duration::from_secs(1) {
            self.rate_limit_window = now;
            self.message_count = 0;
        }

        self.message_count += 1;
        self.message_count <= self.config.rate_limit
    }

    /// Check message size, returns an error if too large
    fn check_message_size(&self, size: usize) -> Result<(), NexusError> {
        if size > self.config.max_message_size {
            warn!(
                connection_id = %self.context.connection_id,
                size = size,
                max = self.config.max_message_size,
                "Message exceeds size limit"
            );
            return Err(NexusError::Validation(format!(
                "Message too large: {} bytes (max: {})",
                size, self.config.max_message_size
            )));
        }
        Ok(())
    }

    /// Handle a WebSocket connection
    async fn handle(mut self, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();
        let (outbound, mut queue) = mpsc::channel::<Message>(self.config.outbound_buffer.max(1));

        let sink = Arc::new(SocketSink {
            outbound: outbound.clone(),
        });
        let handle = match self.gateway.connect(self.context.clone(), sink) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = sender.send(Message::Text(error_frame(&err))).await;
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        };

        // Writer: queued frames and pings until the gateway drops the connection
        let writer_handle = handle.clone();
        let ping_interval = self.config.ping_interval;
        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
            loop {
                tokio::select! {
                    () = writer_handle.closed() => break,
                    frame = queue.recv() => match frame {
                        Some(frame) => {
                            if sender.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ping.tick() => {
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = sender.send(Message::Close(None)).await;
        });

        loop {
            let next = tokio::select! {
                () = handle.closed() => break,
                next = tokio::time::timeout(self.config.idle_timeout, receiver.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    info!(
                        connection_id = %self.context.connection_id,
                        "Closing idle WebSocket connection"
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match frame {
                Message::Text(text) => self.handle_text(&text, &outbound).await,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => self.handle_text(&text, &outbound).await,
                    Err(_) => {
                        let err = NexusError::Validation("binary frames must be UTF-8 JSON".into());
                        let _ = outbound.send(Message::Text(error_frame(&err))).await;
                    }
                },
                Message::Ping(data) => {
                    let _ = outbound.send(Message::Pong(data)).await;
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    debug!(connection_id = %self.context.connection_id, "WebSocket close received");
                    break;
                }
            }
        }

        // Cleanup subscription on disconnect
        self.gateway.disconnect(&self.context.connection_id);
        drop(outbound);
        let _ = writer.await;
    }

    async fn handle_text(&mut self, text: &str, outbound: &mpsc::Sender<Message>) {
        if let Err(err) = self.check_message_size(text.len()) {
            let _ = outbound.send(Message::Text(error_frame(&err))).await;
            return;
        }
        if !self.check_rate_limit() {
            let err = NexusError::busy("messages per second", self.config.rate_limit as usize);
            let _ = outbound.send(Message::Text(error_frame(&err))).await;
            return;
        }
        if is_ping(text) {
            let _ = outbound.send(Message::Text(json!({"type": "pong"}).to_string())).await;
            return;
        }
        if let Err(err) = self.gateway.ingest(text, &self.context).await {
            let _ = outbound.send(Message::Text(error_frame(&err))).await;
        }
    }
}

/// Application-level keep-alive: `{"type": "ping"}`.
fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use nexus_bus::{EventPublisher, PublishOutcome};
    use nexus_state::{FanoutConfig, SubscriberRegistry};
    use nexus_types::{EventType, FailureReason};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    struct AcceptAll;

    #[async_trait]
    impl EventPublisher for AcceptAll {
        async fn publish(&self, envelope: EventEnvelope) -> Result<PublishOutcome, NexusError> {
            if envelope.event_type.service() != "campaign" {
                return Err(NexusError::invalid_type(envelope.event_type.to_string(), "unregistered"));
            }
            Ok(PublishOutcome::Delivered { receivers: 0 })
        }

        fn events_published(&self) -> u64 {
            0
        }
    }

    async fn spawn_server(config: GatewayConfig) -> (SocketAddr, Arc<TransportGateway>, Arc<SubscriberRegistry>) {
        let registry = SubscriberRegistry::new(FanoutConfig::default());
        let gateway = TransportGateway::new(config, Arc::new(AcceptAll), registry.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = routes(gateway.clone());
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        (addr, gateway, registry)
    }

    async fn next_text<S>(ws: &mut S) -> serde_json::Value
    where
        S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let WsMessage::Text(text) = ws.next().await.unwrap().unwrap() {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_entity_events_reach_socket() {
        let (addr, gateway, registry) = spawn_server(GatewayConfig::default()).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws/42/u1")).await.unwrap();
        wait_until(|| registry.subscriber_count("42") == 1).await;

        let event = EventEnvelope::new(
            EventType::parse("campaign:state:v1:success").unwrap(),
            json!({"version": 3}),
        )
        .with_entity("42");
        registry.notify("42", Arc::new(event.clone())).await;

        let frame = next_text(&mut ws).await;
        assert_eq!(frame["event_id"], json!(event.event_id));
        assert_eq!(frame["event_type"], json!("campaign:state:v1:success"));

        let ctx = gateway.connection(&gateway.connection_ids()[0]).unwrap();
        assert_eq!(ctx.actor_id, "u1");
        assert!(ctx.remote_addr.is_some());

        ws.close(None).await.unwrap();
        wait_until(|| gateway.connection_count() == 0).await;
        wait_until(|| registry.subscriber_count("42") == 0).await;
    }

    #[tokio::test]
    async fn test_rejected_message_gets_error_frame() {
        let (addr, _gateway, _) = spawn_server(GatewayConfig::default()).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

        ws.send(WsMessage::Text(r#"{"event_type": "nope"}"#.into())).await.unwrap();
        let frame = next_text(&mut ws).await;
        assert_eq!(frame["event_type"], json!("error"));
        assert_eq!(frame["error"]["kind"], json!(FailureReason::InvalidEventType.as_str()));

        ws.send(WsMessage::Text(r#"{"type": "ping"}"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, json!({"type": "pong"}));

        ws.send(WsMessage::Text(r#"{"event_type": "campaign:update:v1:requested"}"#.into()))
            .await
            .unwrap();
        ws.send(WsMessage::Text(r#"{"type": "ping"}"#.into())).await.unwrap();
        // accepted ingest sends nothing back, so the next frame is the pong
        assert_eq!(next_text(&mut ws).await, json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn test_oversized_and_rate_limited() {
        let mut config = GatewayConfig::default();
        config.websocket.max_message_size = 64;
        config.websocket.rate_limit = 1;
        let (addr, _gateway, _) = spawn_server(config).await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws/1/u1")).await.unwrap();

        ws.send(WsMessage::Text("x".repeat(65))).await.unwrap();
        let frame = next_text(&mut ws).await;
        assert_eq!(frame["error"]["kind"], json!("validation"));

        ws.send(WsMessage::Text(r#"{"type": "ping"}"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, json!({"type": "pong"}));
        ws.send(WsMessage::Text(r#"{"type": "ping"}"#.into())).await.unwrap();
        let frame = next_text(&mut ws).await;
        assert_eq!(frame["error"]["kind"], json!("busy"));
    }

    #[tokio::test]
    async fn test_connection_limit_refuses_socket() {
        let config = GatewayConfig {
            max_connections: 1,
            ..GatewayConfig::default()
        };
        let (addr, gateway, _) = spawn_server(config).await;
        let (_first, _) = connect_async(format!("ws://{addr}/ws/1/a")).await.unwrap();
        wait_until(|| gateway.connection_count() == 1).await;

        let (mut second, _) = connect_async(format!("ws://{addr}/ws/1/b")).await.unwrap();
        let frame = next_text(&mut second).await;
        assert_eq!(frame["error"]["kind"], json!("busy"));
        assert_eq!(gateway.connection_count(), 1);
    }

    #[test]
    fn test_is_ping() {
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"pong"}"#));
        assert!(!is_ping("ping"));
    }
}
