//! # End-to-End Entity Update
//!
//! ```text
//! client ──ingest──► gateway ──► bus ──► EntityCommandHandler
//!                                             │ started
//!                                             │ apply_update ──► store ──► state event
//!                                             │ success
//! client ◄──────────── fan-out ◄──────────────┘
//! ```

use super::support::{client_request, eventually, node, test_config, Recorder};
use nexus_gateway::ConnectionContext;
use nexus_types::{EventEnvelope, EventState, EventType, Failure, FailureReason};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_update_flow_reaches_subscriber() {
    let node = node(test_config("e2e")).await;
    let watcher = Recorder::new();
    let _conn = node
        .gateway
        .connect(ConnectionContext::new("42", "watcher"), watcher.clone())
        .unwrap();

    let request = EventEnvelope::new(
        EventType::parse("campaign:update:v1:requested").unwrap(),
        json!({"patch": {"title": "X"}}),
    )
    .with_entity("42")
    .with_actor("u1");
    let correlation_id = request.correlation_id.clone();
    node.bus.publish(request).await.unwrap();

    let success = watcher.wait_for("campaign:update:v1:success").await;
    assert_eq!(success.correlation_id, correlation_id);

    let lifecycle: Vec<String> = watcher
        .correlated(&correlation_id)
        .iter()
        .map(|e| e.event_type.to_string())
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            "campaign:update:v1:started",
            "campaign:state:v1:success",
            "campaign:update:v1:success",
        ]
    );

    let snapshot = node.store.snapshot("42").unwrap();
    assert_eq!(snapshot.state.get("title"), Some(&json!("X")));
    assert_eq!(snapshot.version, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_client_ingest_drives_update() {
    let node = node(test_config("e2e-ingest")).await;
    let client = Recorder::new();
    let ctx = ConnectionContext::new("42", "u1");
    let _conn = node.gateway.connect(ctx.clone(), client.clone()).unwrap();

    let ack = node
        .gateway
        .ingest(
            &client_request("campaign:update:v1:requested", json!({"title": "X", "budget": 5})),
            &ctx,
        )
        .await
        .unwrap();
    assert!(!ack.duplicate);

    let success = client.wait_for("campaign:update:v1:success").await;
    assert_eq!(success.correlation_id, ack.correlation_id);
    assert_eq!(success.entity_id.as_deref(), Some("42"));
    assert_eq!(success.metadata.actor_id.as_deref(), Some("u1"));
    assert_eq!(success.payload["state"]["budget"], json!(5));

    let state = client.wait_for("campaign:state:v1:success").await;
    assert_eq!(state.payload["actor_id"], json!("u1"));

    node.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_updates_all_applied() {
    let mut config = test_config("e2e-concurrent");
    // Requests and their lifecycle events for one entity share worker shards.
    config.bus.queue_capacity = 4096;
    let node = node(config).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            let request = EventEnvelope::new(
                EventType::parse("campaign:update:v1:requested").unwrap(),
                json!({ format!("k{i}"): i }),
            )
            .with_entity("42");
            node.bus.publish(request).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    eventually("20 updates applied", || {
        node.store.snapshot("42").is_some_and(|s| s.version == 20)
    })
    .await;
    let snapshot = node.store.snapshot("42").unwrap();
    assert_eq!(snapshot.state.len(), 20);

    node.shutdown().await;
}

#[tokio::test]
async fn test_bad_patch_yields_failed_event() {
    let node = node(test_config("e2e-failed")).await;
    let client = Recorder::new();
    let ctx = ConnectionContext::new("42", "u1");
    let _conn = node.gateway.connect(ctx.clone(), client.clone()).unwrap();

    node.gateway
        .ingest(
            &client_request("campaign:update:v1:requested", json!({"patch": "not an object"})),
            &ctx,
        )
        .await
        .unwrap();

    let failed = client.wait_for("campaign:update:v1:failed").await;
    let failure: Failure = failed.decode_payload().unwrap();
    assert_eq!(failure.reason, FailureReason::Validation);
    assert_eq!(node.store.snapshot("42").unwrap().version, 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_rejected_client_messages_publish_nothing() {
    let node = node(test_config("e2e-rejected")).await;
    let ctx = ConnectionContext::new("42", "u1");
    let mut all = node.bus.subscribe_stream(&["*"]).unwrap();

    assert!(node.gateway.ingest("{not json", &ctx).await.is_err());
    assert!(node
        .gateway
        .ingest(&client_request("campaign:Update:v1:requested", json!({})), &ctx)
        .await
        .is_err());
    assert!(node
        .gateway
        .ingest(&client_request("billing:charge:v1:requested", json!({})), &ctx)
        .await
        .is_err());
    assert!(node
        .gateway
        .ingest(&client_request("campaign:update:v1:success", json!({})), &ctx)
        .await
        .is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(all.try_recv().unwrap().is_none());
    assert_eq!(node.gateway.stats().ingest_rejected, 4);

    node.shutdown().await;
}

#[tokio::test]
async fn test_state_request_returns_snapshot() {
    let node = node(test_config("e2e-state")).await;
    node.store
        .seed("7", json!({"title": "seeded"}).as_object().unwrap().clone())
        .unwrap();
    let client = Recorder::new();
    let ctx = ConnectionContext::new("7", "u1");
    let _conn = node.gateway.connect(ctx.clone(), client.clone()).unwrap();

    node.gateway
        .ingest(&client_request("campaign:state:v1:requested", json!({})), &ctx)
        .await
        .unwrap();

    let reply = client.wait_for("campaign:state:v1:success").await;
    assert_eq!(reply.payload["state"]["title"], json!("seeded"));
    assert_eq!(reply.state(), EventState::Success);

    node.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart_with_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config("e2e-restart");
    config.data_dir = Some(dir.path().to_path_buf());

    let first = node(config.clone()).await;
    let request = EventEnvelope::new(
        EventType::parse("campaign:update:v1:requested").unwrap(),
        json!({"title": "persisted"}),
    )
    .with_entity("42");
    first.bus.publish(request).await.unwrap();

    let file = dir.path().join("42.json");
    eventually("snapshot written", || {
        std::fs::read_to_string(&file).is_ok_and(|s| s.contains("persisted"))
    })
    .await;
    first.shutdown().await;

    let second = node(config).await;
    assert!(second.store.snapshot("42").is_none());
    let restored = second.store.load_or_create("42").await.unwrap();
    assert_eq!(restored.state.get("title"), Some(&json!("persisted")));

    second.shutdown().await;
}
