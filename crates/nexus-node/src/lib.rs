//! # Nexus Node
//!
//! Runtime that assembles the Nexus components into one process:
//!
//! ```text
//!            ┌──────────── HTTP / WebSocket (axum) ────────────┐
//!            │  /health /metrics /entities /streams   /ws/...  │
//!            └───────────────┬──────────────────────────┬──────┘
//!                            │                          │ ingest
//!   ┌────────────┐     ┌─────▼─────┐   publish   ┌──────▼─────┐
//!   │ EntityState│◄────│  handlers │◄────────────│  EventBus  │◄──► peers
//!   │   Store    │     └─────┬─────┘             └────────────┘
//!   └─────┬──────┘           │ start
//!         │ fan-out    ┌─────▼──────┐
//!         └──► sockets │  Streams   │
//!                      └────────────┘
//! ```
//!
//! The binary in `main.rs` loads configuration, initializes telemetry and
//! runs a [`NexusRuntime`] until Ctrl+C.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod container;
pub mod handlers;
pub mod http;

pub use container::{ConfigError, NexusContainer, NodeConfig};

use nexus_state::PersistenceError;
use nexus_telemetry::TelemetryError;
use nexus_types::NexusError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long open HTTP requests may take to finish after shutdown begins.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Startup and runtime errors of the node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Component(#[from] NexusError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running Nexus node.
pub struct NexusRuntime {
    config: NodeConfig,
    container: Arc<NexusContainer>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
}

impl NexusRuntime {
    /// Build all components. Nothing runs until [`start`](Self::start).
    pub async fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let container = NexusContainer::build(&config).await?;
        Ok(Self::from_container(config, container))
    }

    /// Wrap an already built container, e.g. one sharing a transport with peers.
    #[must_use]
    pub fn from_container(config: NodeConfig, container: NexusContainer) -> Self {
        Self {
            config,
            container: Arc::new(container),
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn container(&self) -> &Arc<NexusContainer> {
        &self.container
    }

    /// Start bus workers, the bridge, the idle sweeper and persistence.
    pub fn start(&self) {
        let c = &self.container;
        info!("===========================================");
        info!("  Nexus Node v{}", env!("CARGO_PKG_VERSION"));
        info!("===========================================");
        info!(instance_id = %c.bus.instance_id(), "Instance");
        info!(
            services = c.catalog.service_count(),
            topics = c.catalog.topic_count(),
            "Catalog"
        );
        info!(
            entity_type = %c.store.config().entity_type,
            persistence = self.config.data_dir.is_some(),
            "Entity store"
        );
        info!(streams = ?c.streams.topics(), "Stream handlers");
        c.start();
    }

    /// Bind the HTTP listener and serve in the background.
    ///
    /// Returns the bound address (useful with port `0`).
    pub async fn serve(&self) -> Result<SocketAddr, NodeError> {
        let addr = self.config.http.addr()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let app = http::router(self.container.clone());
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        });
        *self.server.lock().await = Some(handle);

        info!(addr = %local_addr, "HTTP/WebSocket server listening");
        Ok(local_addr)
    }

    /// Close sockets, stop the server, then stop the components.
    pub async fn shutdown(&self) {
        info!("Shutting down Nexus node...");
        self.shutdown.cancel();
        self.container.gateway.shutdown().await;

        if let Some(handle) = self.server.lock().await.take() {
            match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
                Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
                Err(_) => warn!("HTTP server did not drain in time"),
            }
        }

        self.container.shutdown().await;
        info!("Nexus node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.http.host = "127.0.0.1".into();
        config.http.port = 0;
        config
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let runtime = NexusRuntime::new(local_config()).await.unwrap();
        runtime.start();
        let addr = runtime.serve().await.unwrap();
        assert_ne!(addr.port(), 0);

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("healthy"));

        tokio::time::timeout(Duration::from_secs(10), runtime.shutdown())
            .await
            .unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_listen_address() {
        let mut config = local_config();
        config.http.host = "not an address".into();
        let runtime = NexusRuntime::new(config).await.unwrap();
        assert!(matches!(runtime.serve().await, Err(NodeError::Config(_))));
    }
}
