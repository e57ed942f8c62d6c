//! # Node Configuration
//!
//! Unified configuration for every component plus the runtime's own settings.
//!
//! ## Sources
//!
//! 1. Built-in defaults
//! 2. TOML file named by `NEXUS_CONFIG` (optional)
//! 3. Environment overrides (`NEXUS_INSTANCE_ID`, `NEXUS_HOST`, `NEXUS_PORT`,
//!    `NEXUS_CATALOG`, `NEXUS_SEED_FILE`, `NEXUS_DATA_DIR`, `NEXUS_LOG_LEVEL`,
//!    `NEXUS_JSON_LOGS`)
//!
//! ```toml
//! catalog = "config/services.json"
//! data_dir = "./data"
//!
//! [http]
//! port = 8080
//!
//! [stream]
//! heartbeat_interval = "1s"
//! deadline = "30m"
//! ```

use nexus_bus::BusConfig;
use nexus_gateway::GatewayConfig;
use nexus_state::StoreConfig;
use nexus_stream::StreamConfig;
use nexus_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the TOML configuration file.
pub const CONFIG_ENV: &str = "NEXUS_CONFIG";

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP/WebSocket listener.
    pub http: HttpConfig,
    /// Service capability manifest. The built-in entity catalog is used when absent.
    pub catalog: Option<PathBuf>,
    /// Default entity state loaded at startup.
    pub seed_file: Option<PathBuf>,
    /// Directory for entity snapshots. Persistence is disabled when absent.
    pub data_dir: Option<PathBuf>,
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub stream: StreamConfig,
    pub gateway: GatewayConfig,
    pub telemetry: TelemetryConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl HttpConfig {
    /// Socket address to bind.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad listen address {}:{}", self.host, self.port)))
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Load defaults, the optional `NEXUS_CONFIG` file and environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }

    /// Apply `NEXUS_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("NEXUS_INSTANCE_ID") {
            self.telemetry.instance_id = id.clone();
            self.bus.instance_id = id;
        }
        if let Some(host) = lookup("NEXUS_HOST") {
            self.http.host = host;
        }
        if let Some(port) = lookup("NEXUS_PORT") {
            self.http.port = port.parse().map_err(|_| ConfigError::Env {
                var: "NEXUS_PORT",
                value: port,
            })?;
        }
        if let Some(path) = lookup("NEXUS_CATALOG") {
            self.catalog = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("NEXUS_SEED_FILE") {
            self.seed_file = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("NEXUS_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("NEXUS_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        if let Some(json) = lookup("NEXUS_JSON_LOGS") {
            self.telemetry.json_logs = json.eq_ignore_ascii_case("true") || json == "1";
        }
        Ok(())
    }

    /// Check bounds that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.http.addr()?;

        let entity_type = &self.store.entity_type;
        if entity_type.is_empty() || !entity_type.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
            return Err(ConfigError::Invalid(format!(
                "store.entity_type '{entity_type}' must match [a-z_]+"
            )));
        }

        let positive = [
            ("bus.workers", self.bus.workers),
            ("bus.queue_capacity", self.bus.queue_capacity),
            ("store.fanout.channel_capacity", self.store.fanout.channel_capacity),
            ("stream.max_sessions", self.stream.max_sessions),
            ("gateway.max_connections", self.gateway.max_connections),
            ("gateway.max_connections_per_ip", self.gateway.max_connections_per_ip),
            ("gateway.websocket.max_message_size", self.gateway.websocket.max_message_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }

        if self.stream.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("stream.heartbeat_interval must be non-zero".into()));
        }
        if self.stream.heartbeat_interval >= self.stream.deadline {
            return Err(ConfigError::Invalid(
                "stream.heartbeat_interval must be shorter than stream.deadline".into(),
            ));
        }
        if self.bus.reconnect_min > self.bus.reconnect_max {
            return Err(ConfigError::Invalid("bus.reconnect_min exceeds bus.reconnect_max".into()));
        }
        Ok(())
    }
}
