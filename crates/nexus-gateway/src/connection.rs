//! Connection identity as reported by the socket layer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use uuid::Uuid;

/// Prefix of generated actor ids for unauthenticated clients.
pub const GUEST_PREFIX: &str = "guest_";

/// Who is on the other end of a socket, and which entity they watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionContext {
    /// Unique per socket.
    pub connection_id: String,
    pub entity_id: String,
    pub actor_id: String,
    /// Stamped into `metadata.session_id` of ingested events.
    pub session_id: String,
    pub device_id: Option<String>,
    pub remote_addr: Option<IpAddr>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionContext {
    pub fn new(entity_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        let connection_id = Uuid::new_v4().simple().to_string();
        Self {
            session_id: connection_id.clone(),
            connection_id,
            entity_id: entity_id.into(),
            actor_id: actor_id.into(),
            device_id: None,
            remote_addr: None,
            connected_at: Utc::now(),
        }
    }

    /// Context for a client without an actor id.
    pub fn guest(entity_id: impl Into<String>) -> Self {
        Self::new(entity_id, guest_id())
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Key of this connection in the entity's subscriber set. A second socket
    /// of the same actor on the same entity replaces the first.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        &self.actor_id
    }

    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.actor_id.starts_with(GUEST_PREFIX)
    }
}

/// `guest_` followed by 16 hex characters.
#[must_use]
pub fn guest_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    format!("{GUEST_PREFIX}{id}")
}
