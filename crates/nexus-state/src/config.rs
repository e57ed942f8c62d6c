//! Store, fan-out and persistence configuration.

use nexus_types::duration_serde;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Entity state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Entity type stamped on state events (`{entity_type}:state:v1:success`).
    pub entity_type: String,

    /// Longest wait for a per-entity lock before failing with `Busy`.
    #[serde(with = "duration_serde")]
    pub lock_timeout: Duration,

    /// Entities without subscribers or updates for this long are evicted.
    #[serde(with = "duration_serde")]
    pub idle_ttl: Duration,

    /// How often the idle sweeper runs.
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    pub fanout: FanoutConfig,

    pub persistence: PersistConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            entity_type: "campaign".to_string(),
            lock_timeout: Duration::from_millis(250),
            idle_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            fanout: FanoutConfig::default(),
            persistence: PersistConfig::default(),
        }
    }
}

/// Subscriber channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Buffer of each subscriber channel.
    pub channel_capacity: usize,

    /// Per-subscriber send timeout. Exceeding it drops the event for that subscriber.
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            send_timeout: Duration::from_secs(2),
        }
    }
}

/// Persistence worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Pending writes before new ones are folded into the dirty set.
    pub queue_capacity: usize,

    #[serde(with = "duration_serde")]
    pub base_delay: Duration,

    #[serde(with = "duration_serde")]
    pub max_delay: Duration,

    /// Attempts per write, including the first.
    pub max_attempts: u32,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}
