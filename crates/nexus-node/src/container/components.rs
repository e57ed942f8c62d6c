//! # Component Container
//!
//! Builds every component in dependency order and wires the built-in
//! handlers onto the bus.
//!
//! ```text
//! catalog ──► bus ──► store ──► sink ──► stream controller ──► gateway
//!                                 │
//!               EntityCommandHandler · EntityRouter · StreamRouter
//! ```

use super::config::NodeConfig;
use crate::adapters::{EntitySink, FileSnapshotHook};
use crate::handlers::{
    AnalyticsStreamHandler, EntityCommandHandler, EntityRouter, StateStreamHandler, StreamRouter,
    LIST_ACTION, STATE_ACTION, STREAM_ANALYTICS_ACTION, STREAM_STATE_ACTION, UPDATE_ACTION,
};
use crate::NodeError;
use nexus_bus::{
    ClusterTransport, DedupStore, DeliveryScope, EventBus, InMemoryDedupStore, InMemoryTransport,
    SubscriptionHandle,
};
use nexus_gateway::TransportGateway;
use nexus_state::EntityStateStore;
use nexus_stream::StreamController;
use nexus_types::{EventCatalog, EventValidator, NexusError};
use std::sync::Arc;
use tracing::{info, warn};

/// Catalog used when no manifest is configured: the entity commands and
/// the two built-in streams.
pub fn builtin_catalog(entity_type: &str) -> Result<EventCatalog, NexusError> {
    EventCatalog::builder()
        .action(entity_type, UPDATE_ACTION)
        .action(entity_type, STATE_ACTION)
        .action(entity_type, LIST_ACTION)
        .streaming_action(entity_type, STREAM_STATE_ACTION)
        .streaming_action(entity_type, STREAM_ANALYTICS_ACTION)
        .build()
}

/// All component instances of one node.
pub struct NexusContainer {
    pub catalog: Arc<EventCatalog>,
    pub bus: Arc<EventBus>,
    pub store: Arc<EntityStateStore>,
    pub sink: Arc<EntitySink>,
    pub streams: Arc<StreamController>,
    pub gateway: Arc<TransportGateway>,
    _subscriptions: Vec<SubscriptionHandle>,
}

impl NexusContainer {
    /// Build a standalone node with its own in-memory transport.
    pub async fn build(config: &NodeConfig) -> Result<Self, NodeError> {
        Self::build_with(
            config,
            Arc::new(InMemoryTransport::new()),
            Arc::new(InMemoryDedupStore::new()),
        )
        .await
    }

    /// Build a node that shares `transport` and `dedup` with its peers.
    pub async fn build_with(
        config: &NodeConfig,
        transport: Arc<dyn ClusterTransport>,
        dedup: Arc<dyn DedupStore>,
    ) -> Result<Self, NodeError> {
        let entity_type = config.store.entity_type.as_str();

        let catalog = match &config.catalog {
            Some(path) => EventCatalog::from_manifest_file(path)?,
            None => builtin_catalog(entity_type)?,
        };
        if !catalog.contains(entity_type, UPDATE_ACTION) {
            warn!(entity_type, "Catalog has no update action; entity updates will be rejected");
        }
        let catalog = Arc::new(catalog);

        let bus = EventBus::builder(EventValidator::new(catalog.clone()))
            .config(config.bus.clone())
            .transport(transport)
            .dedup(dedup)
            .build();

        let store = match &config.data_dir {
            Some(dir) => {
                let hook = FileSnapshotHook::open(dir).await?;
                EntityStateStore::with_persist_hook(config.store.clone(), Arc::new(hook))
            }
            None => EntityStateStore::new(config.store.clone()),
        };
        if let Some(seed) = &config.seed_file {
            let snapshot = store.seed_from_file(seed).await?;
            info!(entity_id = %snapshot.entity_id, keys = snapshot.state.len(), "Seeded default entity");
        }

        let sink = EntitySink::new(bus.clone(), store.clone());

        let streams = StreamController::builder(sink.clone())
            .config(config.stream.clone())
            .catalog(catalog.clone())
            .register(
                format!("{entity_type}:{STREAM_STATE_ACTION}"),
                StateStreamHandler::new(store.clone()),
            )
            .register(
                format!("{entity_type}:{STREAM_ANALYTICS_ACTION}"),
                AnalyticsStreamHandler::new(store.clone()),
            )
            .build();

        let gateway = TransportGateway::new(config.gateway.clone(), sink.clone(), store.fanout().clone());

        let command_patterns = EntityCommandHandler::patterns(entity_type);
        let stream_patterns = StreamRouter::patterns(&streams);
        let subscriptions = vec![
            bus.subscribe_scoped(
                &as_strs(&command_patterns),
                DeliveryScope::LocalOrigin,
                EntityCommandHandler::new(store.clone(), sink.clone()),
            )?,
            bus.subscribe_scoped(
                &as_strs(&stream_patterns),
                DeliveryScope::LocalOrigin,
                StreamRouter::new(streams.clone(), sink.clone()),
            )?,
            bus.subscribe("*", EntityRouter::new(bus.instance_id(), store.clone()))?,
        ];

        Ok(Self {
            catalog,
            bus,
            store,
            sink,
            streams,
            gateway,
            _subscriptions: subscriptions,
        })
    }

    /// Start background workers of the bus and the store.
    pub fn start(&self) {
        self.bus.start();
        self.store.start();
    }

    /// Stop components in reverse dependency order.
    pub async fn shutdown(&self) {
        self.gateway.shutdown().await;
        self.streams.shutdown().await;
        self.bus.shutdown().await;
        self.store.shutdown().await;
    }
}

fn as_strs(patterns: &[String]) -> Vec<&str> {
    patterns.iter().map(String::as_str).collect()
}
