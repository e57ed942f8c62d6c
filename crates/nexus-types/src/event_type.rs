//! # Canonical Event Types
//!
//! Every event moving through Nexus is named `{service}:{action}:v{version}:{state}`.
//!
//! ```text
//! campaign:update:v1:requested
//! ────┬─── ──┬─── ┬─ ────┬────
//!     │      │    │      └── lifecycle state (finite set)
//!     │      │    └── version, `v` followed by digits
//!     │      └── action  [a-z_]+
//!     └── service        [a-z_]+
//! ```
//!
//! The grammar is case-sensitive. Parsing is a hand-written scanner; the
//! catalog check (is `service:action` registered?) lives in [`crate::catalog`].

use crate::errors::NexusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state suffix of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Requested,
    Started,
    Stream,
    Success,
    Failed,
    Completed,
}

impl EventState {
    /// All allowed states, in lifecycle order.
    pub const ALL: [EventState; 6] = [
        EventState::Requested,
        EventState::Started,
        EventState::Stream,
        EventState::Success,
        EventState::Failed,
        EventState::Completed,
    ];

    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Started => "started",
            Self::Stream => "stream",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Terminal states end a request's lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Completed)
    }
}

impl FromStr for EventState {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| NexusError::invalid_type(s, "unknown state"))
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A grammar-valid event type.
///
/// Construction goes through [`EventType::parse`] or [`EventType::new`], so a
/// value of this type always renders to a string matching the wire grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType {
    service: String,
    action: String,
    version: u32,
    state: EventState,
}

impl EventType {
    /// Build an event type from parts, checking each segment.
    pub fn new(
        service: impl Into<String>,
        action: impl Into<String>,
        version: u32,
        state: EventState,
    ) -> Result<Self, NexusError> {
        let service = service.into();
        let action = action.into();
        if !is_segment(&service) {
            return Err(NexusError::invalid_type(
                format!("{service}:{action}:v{version}:{state}"),
                "service must match [a-z_]+",
            ));
        }
        if !is_segment(&action) {
            return Err(NexusError::invalid_type(
                format!("{service}:{action}:v{version}:{state}"),
                "action must match [a-z_]+",
            ));
        }
        Ok(Self {
            service,
            action,
            version,
            state,
        })
    }

    /// Parse the canonical `{service}:{action}:v{version}:{state}` form.
    ///
    /// # Errors
    ///
    /// `NexusError::InvalidEventType` naming the first violated rule.
    pub fn parse(raw: &str) -> Result<Self, NexusError> {
        let mut parts = raw.split(':');
        let (Some(service), Some(action), Some(version), Some(state), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(NexusError::invalid_type(
                raw,
                "expected 4 colon-separated parts",
            ));
        };

        if !is_segment(service) {
            return Err(NexusError::invalid_type(raw, "service must match [a-z_]+"));
        }
        if !is_segment(action) {
            return Err(NexusError::invalid_type(raw, "action must match [a-z_]+"));
        }

        let digits = version
            .strip_prefix('v')
            .ok_or_else(|| NexusError::invalid_type(raw, "version must start with 'v'"))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NexusError::invalid_type(raw, "version must be v<digits>"));
        }
        let version = digits
            .parse::<u32>()
            .map_err(|_| NexusError::invalid_type(raw, "version out of range"))?;

        let state = state
            .parse::<EventState>()
            .map_err(|_| NexusError::invalid_type(raw, "state is not an allowed lifecycle state"))?;

        Ok(Self {
            service: service.to_string(),
            action: action.to_string(),
            version,
            state,
        })
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn state(&self) -> EventState {
        self.state
    }

    /// `service:action`, the topic this event is routed on.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{}:{}", self.service, self.action)
    }

    /// Same service, action and version with a different lifecycle state.
    #[must_use]
    pub fn with_state(&self, state: EventState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:v{}:{}",
            self.service, self.action, self.version, self.state
        )
    }
}

impl FromStr for EventType {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EventType {
    type Error = NexusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.to_string()
    }
}

/// `[a-z_]+`
fn is_segment(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_lowercase() || b == b'_')
}
