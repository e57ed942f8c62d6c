//! # Nexus Node
//!
//! Entry point: configuration, telemetry, components, HTTP server, and
//! graceful shutdown on Ctrl+C.

use anyhow::{Context, Result};
use nexus_node::{NexusRuntime, NodeConfig};
use nexus_telemetry::init_telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::load().context("loading configuration")?;
    let _telemetry = init_telemetry(&config.telemetry).context("initializing telemetry")?;

    let runtime = NexusRuntime::new(config)
        .await
        .context("building node components")?;
    runtime.start();
    runtime.serve().await.context("starting HTTP server")?;

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown().await;
    Ok(())
}
