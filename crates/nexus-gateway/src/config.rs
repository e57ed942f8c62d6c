//! Gateway configuration.

use nexus_types::duration_serde;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum message size (1MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default rate limit (100 messages per second)
pub const DEFAULT_RATE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Open connections across all clients.
    pub max_connections: usize,
    /// Open connections from one remote address.
    pub max_connections_per_ip: usize,
    /// Per-socket settings.
    pub websocket: WebSocketConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_connections_per_ip: 64,
            websocket: WebSocketConfig::default(),
        }
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// Rate limit (messages per second per connection)
    pub rate_limit: u32,
    /// Outbound frames buffered per connection before delivery waits
    pub outbound_buffer: usize,
    /// Ping interval
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,
    /// Idle timeout (disconnect if no activity)
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            rate_limit: DEFAULT_RATE_LIMIT,
            outbound_buffer: 256,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}
