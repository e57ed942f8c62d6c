//! # Cross-Instance Replication
//!
//! Two nodes share one in-memory transport and one dedup store. An update
//! handled on node A must reach node B's store and B's connected clients.

use super::support::{client_request, cluster, eventually, test_config, Recorder};
use nexus_bus::PublishOutcome;
use nexus_gateway::ConnectionContext;
use nexus_types::{EventEnvelope, EventType};
use serde_json::json;

#[tokio::test]
async fn test_update_replicates_to_peer_store() {
    let (_transport, nodes) = cluster(vec![test_config("node-a"), test_config("node-b")]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let request = EventEnvelope::new(
        EventType::parse("campaign:update:v1:requested").unwrap(),
        json!({"patch": {"title": "X", "budget": 100}}),
    )
    .with_entity("42");
    a.bus.publish(request).await.unwrap();

    eventually("peer store caught up", || {
        b.store.snapshot("42").is_some_and(|s| s.version == 1)
    })
    .await;
    let replica = b.store.snapshot("42").unwrap();
    let primary = a.store.snapshot("42").unwrap();
    assert_eq!(replica.state, primary.state);
    assert_eq!(replica.state.get("budget"), Some(&json!(100)));

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_peer_clients_receive_lifecycle() {
    let (_transport, nodes) = cluster(vec![test_config("node-a"), test_config("node-b")]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let on_a = Recorder::new();
    let on_b = Recorder::new();
    let ctx_a = ConnectionContext::new("42", "alice");
    let _conn_a = a.gateway.connect(ctx_a.clone(), on_a.clone()).unwrap();
    let _conn_b = b
        .gateway
        .connect(ConnectionContext::new("42", "bob"), on_b.clone())
        .unwrap();

    let ack = a
        .gateway
        .ingest(&client_request("campaign:update:v1:requested", json!({"title": "X"})), &ctx_a)
        .await
        .unwrap();

    on_b.wait_for("campaign:update:v1:success").await;
    on_b.wait_for("campaign:state:v1:success").await;
    on_b.wait_for("campaign:update:v1:started").await;

    // Channels are not ordered against each other across instances; only
    // the set of events is compared on the peer.
    let mut seen_on_b: Vec<String> = on_b
        .correlated(&ack.correlation_id)
        .iter()
        .map(|e| e.event_type.to_string())
        .collect();
    seen_on_b.sort();
    assert_eq!(
        seen_on_b,
        vec![
            "campaign:state:v1:success",
            "campaign:update:v1:started",
            "campaign:update:v1:success",
        ]
    );
    assert!(on_b.event_types().iter().all(|t| !t.ends_with(":requested")));

    on_a.wait_for("campaign:update:v1:success").await;
    let on_a_types: Vec<String> = on_a
        .correlated(&ack.correlation_id)
        .iter()
        .map(|e| e.event_type.to_string())
        .collect();
    assert_eq!(
        on_a_types,
        vec![
            "campaign:update:v1:started",
            "campaign:state:v1:success",
            "campaign:update:v1:success",
        ]
    );

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_clients_on_other_entities_not_notified() {
    let (_transport, nodes) = cluster(vec![test_config("node-a"), test_config("node-b")]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let other = Recorder::new();
    let _conn = b
        .gateway
        .connect(ConnectionContext::new("7", "bob"), other.clone())
        .unwrap();
    let watcher = Recorder::new();
    let _watch = b
        .gateway
        .connect(ConnectionContext::new("42", "carol"), watcher.clone())
        .unwrap();

    let request = EventEnvelope::new(
        EventType::parse("campaign:update:v1:requested").unwrap(),
        json!({"title": "X"}),
    )
    .with_entity("42");
    a.bus.publish(request).await.unwrap();

    watcher.wait_for("campaign:update:v1:success").await;
    assert!(other.events().is_empty());

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_same_event_id_on_second_node_is_duplicate() {
    let (_transport, nodes) = cluster(vec![test_config("node-a"), test_config("node-b")]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let request = EventEnvelope::new(
        EventType::parse("campaign:update:v1:requested").unwrap(),
        json!({"title": "once"}),
    )
    .with_entity("42")
    .with_event_id("evt-retried");

    let first = a.bus.publish(request.clone()).await.unwrap();
    assert!(matches!(first, PublishOutcome::Delivered { .. }));
    let second = b.bus.publish(request).await.unwrap();
    assert_eq!(second, PublishOutcome::Duplicate);

    eventually("update applied once", || {
        a.store.snapshot("42").is_some_and(|s| s.version == 1)
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(a.store.snapshot("42").unwrap().version, 1);
    assert_eq!(b.bus.stats().duplicates, 1);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_gateway_retry_reports_duplicate() {
    let (_transport, nodes) = cluster(vec![test_config("node-a"), test_config("node-b")]).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    let ctx = ConnectionContext::new("42", "u1");

    let raw = json!({
        "event_id": "client-1",
        "event_type": "campaign:update:v1:requested",
        "payload": {"title": "X"},
    })
    .to_string();

    assert!(!a.gateway.ingest(&raw, &ctx).await.unwrap().duplicate);
    // Reconnected to another instance and retried.
    assert!(b.gateway.ingest(&raw, &ctx).await.unwrap().duplicate);

    for node in &nodes {
        node.shutdown().await;
    }
}
