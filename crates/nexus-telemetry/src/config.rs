//! Telemetry configuration from environment variables.

use serde::{Deserialize, Serialize};
use std::env;

/// Logging and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Bus instance identifier (one per process)
    pub instance_id: String,

    /// Log level filter (trace, debug, info, warn, error) or a full `EnvFilter` directive
    pub log_level: String,

    /// Whether to write logs to stdout at all
    pub console_output: bool,

    /// JSON formatted logs instead of the pretty development format
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "nexus".to_string(),
            instance_id: "local".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `NEXUS_SERVICE_NAME`: Service name (default: nexus)
    /// - `NEXUS_INSTANCE_ID`: Instance id (default: local)
    /// - `NEXUS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `NEXUS_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `NEXUS_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("NEXUS_SERVICE_NAME").unwrap_or_else(|_| "nexus".to_string()),

            instance_id: env::var("NEXUS_INSTANCE_ID").unwrap_or_else(|_| "local".to_string()),

            log_level: env::var("NEXUS_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("NEXUS_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("NEXUS_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(is_container),
        }
    }

    /// Service name qualified with the instance id.
    pub fn full_service_name(&self) -> String {
        if self.instance_id == "local" {
            self.service_name.clone()
        } else {
            format!("{}-{}", self.service_name, self.instance_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "nexus");
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_full_service_name() {
        let mut config = TelemetryConfig::default();
        assert_eq!(config.full_service_name(), "nexus");
        config.instance_id = "node-b".to_string();
        assert_eq!(config.full_service_name(), "nexus-node-b");
    }

    #[test]
    fn test_partial_deserialize() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"json_logs": true}"#).unwrap();
        assert!(config.json_logs);
        assert_eq!(config.service_name, "nexus");
    }
}
