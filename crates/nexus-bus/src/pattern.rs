//! # Event Patterns
//!
//! Subscription filters over canonical event types.
//!
//! A pattern is colon-separated like an event type. `*` matches any single
//! segment, and a pattern shorter than four segments leaves the remaining
//! segments unconstrained:
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `*` | every event |
//! | `campaign` | every `campaign:*` event |
//! | `campaign:update` | every version and state of `campaign:update` |
//! | `campaign:*:*:requested` | every campaign request |
//! | `campaign:update:v1:success` | exactly that type |

use nexus_types::{EventEnvelope, EventType, NexusError};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Any,
    Exact(String),
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventPattern {
    segments: Vec<Segment>,
}

impl EventPattern {
    /// Pattern matching every event.
    #[must_use]
    pub fn all() -> Self {
        Self {
            segments: vec![Segment::Any],
        }
    }

    /// Parse a pattern.
    ///
    /// # Errors
    ///
    /// `InvalidEventType` for empty segments, more than four segments, or
    /// characters outside `[a-z0-9_]`.
    pub fn parse(raw: &str) -> Result<Self, NexusError> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() > 4 {
            return Err(NexusError::invalid_type(raw, "pattern has more than 4 segments"));
        }
        let segments = parts
            .into_iter()
            .map(|part| match part {
                "*" => Ok(Segment::Any),
                "" => Err(NexusError::invalid_type(raw, "empty pattern segment")),
                s if s
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') =>
                {
                    Ok(Segment::Exact(s.to_string()))
                }
                _ => Err(NexusError::invalid_type(raw, "invalid pattern segment")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    /// Pattern matching exactly one event type.
    #[must_use]
    pub fn exact(event_type: &EventType) -> Self {
        Self {
            segments: vec![
                Segment::Exact(event_type.service().to_string()),
                Segment::Exact(event_type.action().to_string()),
                Segment::Exact(format!("v{}", event_type.version())),
                Segment::Exact(event_type.state().as_str().to_string()),
            ],
        }
    }

    /// Check an event type against this pattern.
    #[must_use]
    pub fn matches(&self, event_type: &EventType) -> bool {
        let version = format!("v{}", event_type.version());
        let parts = [
            event_type.service(),
            event_type.action(),
            version.as_str(),
            event_type.state().as_str(),
        ];
        let matched = self
            .segments
            .iter()
            .zip(parts)
            .all(|(segment, part)| match segment {
                Segment::Any => true,
                Segment::Exact(expected) => expected == part,
            });
        matched
    }

    /// Check an envelope against this pattern.
    #[must_use]
    pub fn matches_envelope(&self, envelope: &EventEnvelope) -> bool {
        self.matches(&envelope.event_type)
    }
}

impl FromStr for EventPattern {
    type Err = NexusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Any => "*",
                Segment::Exact(v) => v.as_str(),
            })
            .collect();
        f.write_str(&rendered.join(":"))
    }
}
