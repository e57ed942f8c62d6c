//! # Streaming Sessions
//!
//! `requested` → `started` → `stream`* → `success` | `failed`, driven from
//! a client message all the way to the client's delivery sink.

use super::support::{client_request, eventually, node, test_config, Recorder};
use nexus_gateway::ConnectionContext;
use nexus_types::{Failure, FailureReason, StreamChunk};
use serde_json::json;

fn lifecycle(recorder: &Recorder, correlation_id: &str) -> Vec<String> {
    recorder
        .correlated(correlation_id)
        .iter()
        .map(|e| e.event_type.to_string())
        .collect()
}

#[tokio::test]
async fn test_state_stream_runs_to_completion() {
    let node = node(test_config("stream")).await;
    node.store
        .seed("42", json!({"title": "X"}).as_object().unwrap().clone())
        .unwrap();
    let client = Recorder::new();
    let ctx = ConnectionContext::new("42", "u1");
    let _conn = node.gateway.connect(ctx.clone(), client.clone()).unwrap();

    let ack = node
        .gateway
        .ingest(
            &client_request(
                "campaign:stream_state:v1:requested",
                json!({"duration_ms": 300, "interval_ms": 50}),
            ),
            &ctx,
        )
        .await
        .unwrap();

    let success = client.wait_for("campaign:stream_state:v1:success").await;
    assert_eq!(success.correlation_id, ack.correlation_id);
    // Unchanged state is emitted once.
    assert_eq!(success.payload["snapshots"], json!(1));

    let types = lifecycle(&client, &ack.correlation_id);
    assert_eq!(types.first().map(String::as_str), Some("campaign:stream_state:v1:started"));
    assert_eq!(types.last().map(String::as_str), Some("campaign:stream_state:v1:success"));

    let chunk = client
        .correlated(&ack.correlation_id)
        .into_iter()
        .find(|e| e.event_type.to_string() == "campaign:stream_state:v1:stream")
        .unwrap();
    let chunk: StreamChunk = chunk.decode_payload().unwrap();
    assert_eq!(chunk.sequence, 1);
    assert_eq!(chunk.data["state"]["title"], json!("X"));

    eventually("session released", || node.streams.active_count() == 0).await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_state_stream_follows_updates() {
    let node = node(test_config("stream-updates")).await;
    let client = Recorder::new();
    let ctx = ConnectionContext::new("42", "u1");
    let _conn = node.gateway.connect(ctx.clone(), client.clone()).unwrap();

    let ack = node
        .gateway
        .ingest(
            &client_request(
                "campaign:stream_state:v1:requested",
                json!({"duration_ms": 2000, "interval_ms": 20}),
            ),
            &ctx,
        )
        .await
        .unwrap();
    client.wait_for("campaign:stream_state:v1:stream").await;

    node.gateway
        .ingest(&client_request("campaign:update:v1:requested", json!({"title": "Y"})), &ctx)
        .await
        .unwrap();

    eventually("updated snapshot streamed", || {
        client
            .correlated(&ack.correlation_id)
            .iter()
            .filter_map(|e| e.decode_payload::<StreamChunk>().ok())
            .any(|c| c.data["state"]["title"] == json!("Y"))
    })
    .await;

    assert!(node.streams.cancel(&ack.event_id));
    node.shutdown().await;
}

#[tokio::test]
async fn test_busy_and_cancel() {
    let mut config = test_config("stream-busy");
    config.stream.max_sessions = 1;
    let node = node(config).await;
    let client = Recorder::new();
    let ctx = ConnectionContext::new("42", "u1");
    let _conn = node.gateway.connect(ctx.clone(), client.clone()).unwrap();

    let long = node
        .gateway
        .ingest(
            &client_request("campaign:stream_analytics:v1:requested", json!({"interval_ms": 50})),
            &ctx,
        )
        .await
        .unwrap();
    eventually("first session running", || node.streams.active_count() == 1).await;

    let rejected = node
        .gateway
        .ingest(&client_request("campaign:stream_state:v1:requested", json!({})), &ctx)
        .await
        .unwrap();
    eventually("busy reply", || {
        lifecycle(&client, &rejected.correlation_id).contains(&"campaign:stream_state:v1:failed".to_string())
    })
    .await;
    let failed = client.correlated(&rejected.correlation_id).pop().unwrap();
    let failure: Failure = failed.decode_payload().unwrap();
    assert_eq!(failure.reason, FailureReason::Busy);

    assert!(node.streams.cancel(&long.event_id));
    eventually("cancelled reply", || {
        lifecycle(&client, &long.correlation_id)
            .last()
            .is_some_and(|t| t == "campaign:stream_analytics:v1:failed")
    })
    .await;
    let failed = client.correlated(&long.correlation_id).pop().unwrap();
    let failure: Failure = failed.decode_payload().unwrap();
    assert_eq!(failure.reason, FailureReason::Cancelled);

    eventually("slot released", || node.streams.active_count() == 0).await;
    assert!(!node.streams.cancel(&long.event_id));
    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_sessions() {
    let node = node(test_config("stream-shutdown")).await;
    let client = Recorder::new();
    let ctx = ConnectionContext::new("42", "u1");
    let _conn = node.gateway.connect(ctx.clone(), client.clone()).unwrap();

    node.gateway
        .ingest(
            &client_request("campaign:stream_analytics:v1:requested", json!({"interval_ms": 50})),
            &ctx,
        )
        .await
        .unwrap();
    eventually("session running", || node.streams.active_count() == 1).await;

    node.streams.shutdown().await;
    assert_eq!(node.streams.active_count(), 0);
    node.shutdown().await;
}
