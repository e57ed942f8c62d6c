//! # WebSocket Round Trip
//!
//! A real socket against a served node: send a client message, receive the
//! lifecycle frames, then shut the node down under an open connection.

use super::support::{client_request, eventually, test_config, WAIT};
use futures::{SinkExt, StreamExt};
use nexus_node::NexusRuntime;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(instance_id: &str) -> (NexusRuntime, SocketAddr) {
    let runtime = NexusRuntime::new(test_config(instance_id)).await.unwrap();
    runtime.start();
    let addr = runtime.serve().await.unwrap();
    (runtime, addr)
}

async fn open(runtime: &NexusRuntime, url: String) -> Socket {
    let before = runtime.container().gateway.connection_count();
    let (socket, _) = connect_async(url).await.unwrap();
    let gateway = runtime.container().gateway.clone();
    eventually("socket registered", || gateway.connection_count() > before).await;
    socket
}

/// Next JSON text frame, skipping pings.
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Collect frames until one of type `last` arrives.
async fn frames_until(socket: &mut Socket, last: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_json(socket).await;
        let done = frame["event_type"] == last;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

#[tokio::test]
async fn test_update_over_websocket() {
    let (runtime, addr) = serve("ws-update").await;
    let mut socket = open(&runtime, format!("ws://{addr}/ws/42/u1")).await;

    socket
        .send(Message::Text(client_request(
            "campaign:update:v1:requested",
            json!({"patch": {"title": "X"}}),
        )))
        .await
        .unwrap();

    let frames = frames_until(&mut socket, "campaign:update:v1:success").await;
    let types: Vec<&str> = frames
        .iter()
        .filter_map(|f| f["event_type"].as_str())
        .collect();
    assert_eq!(
        types,
        vec![
            "campaign:update:v1:started",
            "campaign:state:v1:success",
            "campaign:update:v1:success",
        ]
    );
    let success = frames.last().unwrap();
    assert_eq!(success["entity_id"], "42");
    assert_eq!(success["metadata"]["actor_id"], "u1");
    assert_eq!(success["payload"]["state"]["title"], "X");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_second_socket_sees_first_sockets_update() {
    let (runtime, addr) = serve("ws-broadcast").await;
    let mut writer = open(&runtime, format!("ws://{addr}/ws/42/alice")).await;
    let mut reader = open(&runtime, format!("ws://{addr}/ws/42/bob")).await;

    writer
        .send(Message::Text(client_request(
            "campaign:update:v1:requested",
            json!({"title": "shared"}),
        )))
        .await
        .unwrap();

    let frames = frames_until(&mut reader, "campaign:update:v1:success").await;
    assert!(frames
        .iter()
        .any(|f| f["event_type"] == "campaign:state:v1:success"
            && f["payload"]["state"]["title"] == "shared"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_rejected_message_gets_error_frame() {
    let (runtime, addr) = serve("ws-error").await;
    let mut socket = open(&runtime, format!("ws://{addr}/ws/42/u1")).await;

    socket
        .send(Message::Text(client_request("billing:charge:v1:requested", json!({}))))
        .await
        .unwrap();
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["event_type"], "error");
    assert_eq!(frame["error"]["kind"], "invalid_event_type");

    socket
        .send(Message::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut socket).await, json!({"type": "pong"}));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_sockets() {
    let (runtime, addr) = serve("ws-shutdown").await;
    let mut socket = open(&runtime, format!("ws://{addr}/ws")).await;

    tokio::time::timeout(std::time::Duration::from_secs(10), runtime.shutdown())
        .await
        .unwrap();

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    let gateway = runtime.container().gateway.clone();
    eventually("connections released", || gateway.connection_count() == 0).await;
}
