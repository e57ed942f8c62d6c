//! Structured logging setup.
//!
//! Builds a `tracing_subscriber` registry with an `EnvFilter` and either a
//! JSON layer (containers, log shipping) or a pretty layer (development).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Marker returned once the global subscriber is installed.
#[derive(Debug)]
pub struct LoggingGuard {
    pub json: bool,
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// `TelemetryError::LoggingInit` when the filter is invalid or a global
/// subscriber is already installed.
pub fn init_logging(config: &TelemetryConfig) -> Result<LoggingGuard, TelemetryError> {
    let env_filter = EnvFilter::try_new(&config.log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;

    if !config.console_output {
        tracing_subscriber::registry()
            .with(env_filter)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.full_service_name(),
        json_logs = config.json_logs,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        json: config.json_logs,
    })
}

/// Log a bus event with the standard component / event fields.
///
/// ```rust,ignore
/// log_event!(debug, "bus", "Event delivered", &envelope, receivers = 3);
/// ```
#[macro_export]
macro_rules! log_event {
    ($level:ident, $component:expr, $msg:expr, $envelope:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            component = $component,
            event_id = %$envelope.event_id,
            event_type = %$envelope.event_type,
            correlation_id = %$envelope.correlation_id,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an entity-scoped event with the standard component / entity fields.
#[macro_export]
macro_rules! log_entity_event {
    ($level:ident, $component:expr, $msg:expr, $entity_id:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            component = $component,
            entity_id = %$entity_id,
            $($($field)*,)?
            $msg
        )
    };
}
