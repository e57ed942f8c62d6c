//! # Service Catalog & Validator
//!
//! The catalog is the registered `service:action` vocabulary, loaded once at
//! startup from a service capability manifest and immutable afterwards.
//! Lookups never take a lock.
//!
//! ## Manifest Format
//!
//! ```json
//! [
//!   {
//!     "name": "campaign",
//!     "endpoints": [
//!       { "path": "/api/campaign", "method": "POST",
//!         "actions": ["update", "state", "list", "stream_state"],
//!         "streaming": ["stream_state"] }
//!     ]
//!   }
//! ]
//! ```
//!
//! An action is streaming-capable when its name contains [`STREAMING_MARKER`]
//! or it is listed under `streaming`.

use crate::errors::NexusError;
use crate::event_type::{EventState, EventType};
use crate::envelope::EventEnvelope;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Substring that marks an action as streaming-capable by naming convention.
pub const STREAMING_MARKER: &str = "stream";

/// Capabilities declared for a single action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSpec {
    /// Explicitly declared as streaming.
    pub streaming: bool,
}

/// One service entry of the capability manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointManifest>,
}

/// One endpoint entry of the capability manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointManifest {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub streaming: Vec<String>,
}

/// Immutable registry of `service -> action -> spec`.
#[derive(Debug, Clone, Default)]
pub struct EventCatalog {
    services: HashMap<String, HashMap<String, ActionSpec>>,
}

impl EventCatalog {
    /// Start building a catalog.
    #[must_use]
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Build from parsed manifest entries.
    ///
    /// # Errors
    ///
    /// `InvalidEventType` when a service or action name violates the grammar.
    pub fn from_manifest(manifest: &[ServiceManifest]) -> Result<Self, NexusError> {
        let mut builder = Self::builder();
        for service in manifest {
            for endpoint in &service.endpoints {
                for action in &endpoint.actions {
                    let streaming = endpoint.streaming.iter().any(|s| s == action);
                    builder = builder.action_with(&service.name, action, ActionSpec { streaming });
                }
            }
        }
        builder.build()
    }

    /// Parse a JSON manifest.
    pub fn from_manifest_json(json: &str) -> Result<Self, NexusError> {
        let manifest: Vec<ServiceManifest> = serde_json::from_str(json)?;
        Self::from_manifest(&manifest)
    }

    /// Read and parse a JSON manifest file.
    pub fn from_manifest_file(path: impl AsRef<Path>) -> Result<Self, NexusError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            NexusError::Validation(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        let catalog = Self::from_manifest_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            services = catalog.service_count(),
            topics = catalog.topic_count(),
            "Service catalog loaded"
        );
        Ok(catalog)
    }

    /// Whether `service:action` is registered.
    #[must_use]
    pub fn contains(&self, service: &str, action: &str) -> bool {
        self.action(service, action).is_some()
    }

    /// Spec for a registered action.
    #[must_use]
    pub fn action(&self, service: &str, action: &str) -> Option<&ActionSpec> {
        self.services.get(service).and_then(|a| a.get(action))
    }

    /// Streaming capability by naming convention or explicit declaration.
    #[must_use]
    pub fn is_streaming(&self, event_type: &EventType) -> bool {
        event_type.action().contains(STREAMING_MARKER)
            || self
                .action(event_type.service(), event_type.action())
                .is_some_and(|spec| spec.streaming)
    }

    /// All registered `service:action` topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .services
            .iter()
            .flat_map(|(service, actions)| {
                actions.keys().map(move |action| format!("{service}:{action}"))
            })
            .collect();
        topics.sort();
        topics
    }

    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }
}

/// Builder for [`EventCatalog`]. Consumed by `build()`; no registration after boot.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entries: Vec<(String, String, ActionSpec)>,
}

impl CatalogBuilder {
    /// Register `service:action`.
    #[must_use]
    pub fn action(self, service: &str, action: &str) -> Self {
        self.action_with(service, action, ActionSpec::default())
    }

    /// Register `service:action` as explicitly streaming.
    #[must_use]
    pub fn streaming_action(self, service: &str, action: &str) -> Self {
        self.action_with(service, action, ActionSpec { streaming: true })
    }

    /// Register `service:action` with a spec. Repeated registrations OR their flags.
    #[must_use]
    pub fn action_with(mut self, service: &str, action: &str, spec: ActionSpec) -> Self {
        self.entries
            .push((service.to_string(), action.to_string(), spec));
        self
    }

    /// Validate names and freeze the catalog.
    pub fn build(self) -> Result<EventCatalog, NexusError> {
        let mut services: HashMap<String, HashMap<String, ActionSpec>> = HashMap::new();
        for (service, action, spec) in self.entries {
            // Reuse the grammar checks on a probe type.
            EventType::new(service.as_str(), action.as_str(), 1, EventState::Requested)?;
            let entry = services
                .entry(service)
                .or_default()
                .entry(action)
                .or_default();
            entry.streaming |= spec.streaming;
        }
        Ok(EventCatalog { services })
    }
}

/// Parts of a validated event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedType {
    pub service: String,
    pub action: String,
    pub version: u32,
    pub state: EventState,
    pub event_type: EventType,
}

/// Grammar + catalog validation. Cheap to clone, shares the catalog.
#[derive(Debug, Clone)]
pub struct EventValidator {
    catalog: Arc<EventCatalog>,
}

impl EventValidator {
    #[must_use]
    pub fn new(catalog: Arc<EventCatalog>) -> Self {
        Self { catalog }
    }

    /// Validate a raw event type string.
    ///
    /// # Errors
    ///
    /// `InvalidEventType` for grammar violations and unregistered `service:action`.
    pub fn validate(&self, raw: &str) -> Result<ValidatedType, NexusError> {
        let event_type = EventType::parse(raw)?;
        self.check_registered(&event_type)?;
        Ok(ValidatedType {
            service: event_type.service().to_string(),
            action: event_type.action().to_string(),
            version: event_type.version(),
            state: event_type.state(),
            event_type,
        })
    }

    /// Check an envelope whose type is already grammar-valid.
    pub fn validate_envelope(&self, envelope: &EventEnvelope) -> Result<(), NexusError> {
        self.check_registered(&envelope.event_type)
    }

    fn check_registered(&self, event_type: &EventType) -> Result<(), NexusError> {
        if self
            .catalog
            .contains(event_type.service(), event_type.action())
        {
            Ok(())
        } else {
            Err(NexusError::invalid_type(
                event_type.to_string(),
                format!("unregistered topic {}", event_type.topic()),
            ))
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<EventCatalog> {
        &self.catalog
    }
}
