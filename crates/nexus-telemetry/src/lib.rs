//! # Nexus Telemetry
//!
//! Observability for the Nexus event bus.
//!
//! ## Components
//!
//! - **Logging**: `tracing` subscriber with env filter, JSON or pretty output
//! - **Metrics**: Prometheus registry scraped from the node's `/metrics` route
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nexus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! let _guard = init_telemetry(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NEXUS_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `NEXUS_JSON_LOGS` | `false` | JSON log lines |
//! | `NEXUS_INSTANCE_ID` | `local` | Instance id in log context |

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, LoggingGuard};
pub use metrics::{
    encode_metrics, register_metrics, HistogramTimer, BRIDGE_RECEIVED, BRIDGE_RESTARTS,
    ENTITIES_ACTIVE, ENTITIES_EVICTED, ENTITY_UPDATES, EVENTS_DELIVERED, EVENTS_DROPPED,
    EVENTS_DUPLICATE, EVENTS_INVALID, EVENTS_PUBLISHED, FANOUT_DURATION, HANDLER_PANICS,
    INGEST_ERRORS, PERSISTENCE_DEGRADED, PERSIST_FAILURES, SLOW_CONSUMERS, STREAM_OUTCOMES,
    STREAM_REJECTED, STREAM_SESSIONS_ACTIVE, SUBSCRIBERS_ACTIVE, WS_CONNECTIONS,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and register metrics.
///
/// Returns a guard to hold for the lifetime of the application.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    register_metrics()?;
    let logging = init_logging(config)?;
    Ok(TelemetryGuard { _logging: logging })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logging: LoggingGuard,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry");
    }
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
