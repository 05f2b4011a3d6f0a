//! The human-notification bridge contract.
//!
//! The hub emits operational notifications (pending activations, restarts)
//! through a [`NotifyBridge`] and receives free-form command text back from
//! it. The contract lives in its own crate so the hub and the concrete
//! implementation don't depend on each other.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, futures::future::BoxFuture, tracing::debug};

/// Callback invoked with the text of each inbound bridge message.
pub type InboundHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// External notification sink and inbound command channel.
#[async_trait]
pub trait NotifyBridge: Send + Sync {
    /// Deliver a human notification. Best-effort; errors are the caller's to
    /// log, never to propagate to clients.
    async fn send(&self, text: &str) -> Result<()>;

    /// Register the inbound handler and start listening. Called once per
    /// bridge instance; implementations own their polling tasks.
    async fn start_inbound(&self, handler: InboundHandler) -> Result<()>;
}

/// Bridge used when no notification channel is configured.
pub struct NoopBridge;

#[async_trait]
impl NotifyBridge for NoopBridge {
    async fn send(&self, text: &str) -> Result<()> {
        debug!(text, "notify bridge disabled, dropping notification");
        Ok(())
    }

    async fn start_inbound(&self, _handler: InboundHandler) -> Result<()> {
        Ok(())
    }
}
