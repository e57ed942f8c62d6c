//! # HTTP Surface
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /health` | liveness plus persistence status |
//! | `GET /metrics` | Prometheus text format |
//! | `GET /stats` | component counters as JSON |
//! | `GET /entities` | ids of entities in memory |
//! | `GET /entities/:id` | entity snapshot |
//! | `GET /entities/:id/analytics` | entity analytics |
//! | `GET /streams` | active stream sessions |
//! | `DELETE /streams/:id` | cancel a stream session |
//! | `GET /ws`, `GET /ws/:entity_id/:actor_id` | WebSocket gateway |

use crate::container::NexusContainer;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use nexus_telemetry::encode_metrics;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Full router: HTTP endpoints merged with the WebSocket routes.
pub fn router(container: Arc<NexusContainer>) -> Router {
    let gateway = container.gateway.clone();
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .route("/entities", get(list_entities))
        .route("/entities/:id", get(get_entity))
        .route("/entities/:id/analytics", get(entity_analytics))
        .route("/streams", get(list_streams))
        .route("/streams/:id", delete(cancel_stream))
        .with_state(container)
        .merge(nexus_gateway::routes(gateway))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

type AppState = State<Arc<NexusContainer>>;

async fn health_check(State(c): AppState) -> impl IntoResponse {
    let degraded = c.store.is_degraded();
    Json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "service": "nexus",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": c.bus.instance_id(),
        "persistence_degraded": degraded,
    }))
}

async fn metrics() -> Response {
    match encode_metrics() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn stats(State(c): AppState) -> impl IntoResponse {
    Json(json!({
        "bus": c.bus.stats(),
        "store": c.store.stats(),
        "streams": c.streams.stats(),
        "gateway": c.gateway.stats(),
    }))
}

async fn list_entities(State(c): AppState) -> impl IntoResponse {
    Json(json!({ "entities": c.store.list_entities() }))
}

async fn get_entity(State(c): AppState, Path(id): Path<String>) -> Response {
    match c.store.snapshot(&id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => not_found("entity", &id),
    }
}

async fn entity_analytics(State(c): AppState, Path(id): Path<String>) -> Response {
    match c.store.analytics(&id) {
        Some(analytics) => Json(analytics).into_response(),
        None => not_found("entity", &id),
    }
}

async fn list_streams(State(c): AppState) -> impl IntoResponse {
    Json(json!({ "sessions": c.streams.active_sessions() }))
}

async fn cancel_stream(State(c): AppState, Path(id): Path<String>) -> Response {
    if c.streams.cancel(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found("stream session", &id)
    }
}

fn not_found(kind: &str, id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("{kind} {id} not found") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::NodeConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn container() -> Arc<NexusContainer> {
        let container = NexusContainer::build(&NodeConfig::default()).await.unwrap();
        container.start();
        Arc::new(container)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let c = container().await;
        let (status, body) = get_json(router(c.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["instance_id"], c.bus.instance_id());
    }

    #[tokio::test]
    async fn test_entity_routes() {
        let c = container().await;
        c.store
            .seed("42", json!({"title": "X"}).as_object().unwrap().clone())
            .unwrap();

        let (status, body) = get_json(router(c.clone()), "/entities/42").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["title"], "X");

        let (status, _) = get_json(router(c.clone()), "/entities/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get_json(router(c.clone()), "/entities").await;
        assert_eq!(body["entities"], json!(["42"]));

        let (status, body) = get_json(router(c.clone()), "/entities/42/analytics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state_keys"], json!(["title"]));
    }

    #[tokio::test]
    async fn test_stats_and_streams() {
        let c = container().await;
        let (status, body) = get_json(router(c.clone()), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["bus"]["published"].is_u64());
        assert_eq!(body["gateway"]["active_connections"], 0);

        let (_, body) = get_json(router(c.clone()), "/streams").await;
        assert_eq!(body["sessions"], json!([]));

        let response = router(c.clone())
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/streams/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_text() {
        nexus_telemetry::register_metrics().unwrap();
        let response = router(container().await)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("nexus_"));
    }
}
