//! Subscriber callbacks.

use async_trait::async_trait;
use nexus_types::{EventEnvelope, NexusError};
use std::future::Future;
use std::sync::Arc;

/// Which deliveries a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryScope {
    /// Local publishes and replays from peer instances.
    #[default]
    All,
    /// Only events first published on this instance.
    ///
    /// Command handlers use this so a request is handled by exactly one instance.
    LocalOrigin,
}

/// Callback invoked by a delivery worker for every matching event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> Result<(), NexusError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), NexusError>> + Send,
{
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> Result<(), NexusError> {
        (self.f)(envelope).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```rust,ignore
/// let handler = handler_fn(|env| async move {
///     tracing::info!(event_type = %env.event_type, "seen");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), NexusError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
