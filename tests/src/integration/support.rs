//! Fixtures shared by the integration scenarios.

use async_trait::async_trait;
use nexus_bus::{DedupStore, InMemoryDedupStore, InMemoryTransport};
use nexus_gateway::DeliverySink;
use nexus_node::{NexusContainer, NodeConfig};
use nexus_types::{EventEnvelope, NexusError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for anything that should happen "promptly".
pub const WAIT: Duration = Duration::from_secs(3);

/// Node configuration for tests: loopback listener on an ephemeral port.
pub fn test_config(instance_id: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.bus.instance_id = instance_id.to_string();
    config.http.host = "127.0.0.1".to_string();
    config.http.port = 0;
    config
}

/// A started standalone node.
pub async fn node(config: NodeConfig) -> Arc<NexusContainer> {
    let container = NexusContainer::build(&config).await.unwrap();
    container.start();
    Arc::new(container)
}

/// Started nodes sharing one transport and one dedup store.
pub async fn cluster(configs: Vec<NodeConfig>) -> (InMemoryTransport, Vec<Arc<NexusContainer>>) {
    let transport = InMemoryTransport::new();
    let dedup: Arc<dyn DedupStore> = Arc::new(InMemoryDedupStore::new());
    let mut nodes = Vec::new();
    for config in &configs {
        let container =
            NexusContainer::build_with(config, Arc::new(transport.clone()), dedup.clone())
                .await
                .unwrap();
        container.start();
        nodes.push(Arc::new(container));
    }
    let expected = nodes.len();
    eventually("bridge receivers subscribed", || transport.receiver_count() >= expected).await;
    (transport, nodes)
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

/// Raw client message, as a browser would send it.
pub fn client_request(event_type: &str, payload: Value) -> String {
    json!({ "event_type": event_type, "payload": payload }).to_string()
}

/// Delivery sink that records what a connected client would receive.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<EventEnvelope>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.event_type.to_string())
            .collect()
    }

    /// Events with `correlation_id`, in delivery order.
    pub fn correlated(&self, correlation_id: &str) -> Vec<EventEnvelope> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Wait until an event of type `event_type` arrived and return it.
    pub async fn wait_for(&self, event_type: &str) -> EventEnvelope {
        eventually(event_type, || self.event_types().iter().any(|t| t == event_type)).await;
        self.events()
            .into_iter()
            .find(|e| e.event_type.to_string() == event_type)
            .unwrap()
    }
}

#[async_trait]
impl DeliverySink for Recorder {
    async fn on_deliver(&self, _subscriber_id: &str, event: &EventEnvelope) -> Result<(), NexusError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
