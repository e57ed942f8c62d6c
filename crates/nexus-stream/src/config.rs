//! Stream controller configuration.

use nexus_types::duration_serde;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Concurrent sessions per instance. Further requests fail with `Busy`.
    pub max_sessions: usize,

    /// Keep-alive period for sessions that emit no chunks.
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Hard limit on a session's lifetime.
    #[serde(with = "duration_serde")]
    pub deadline: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            heartbeat_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(30 * 60),
        }
    }
}
