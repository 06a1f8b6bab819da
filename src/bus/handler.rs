use super::{DeliveryReceipt, MessageBus};
use crate::error::BusError;
use crate::message::Message;
use crate::subscription::SubscriptionId;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Subscriber callback invoked once per matching message.
///
/// Errors and panics are caught by the bus, logged, and counted; they never
/// reach the publisher or other subscribers. A handler runs on its
/// subscription's own worker task, so long-running work only delays later
/// deliveries to the same subscription. Offload it with `tokio::spawn` and
/// report back with a follow-up message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Arc<Message>, ctx: DeliveryContext) -> Result<()>;
}

/// Explicit context handed to a handler at dispatch time.
#[derive(Clone)]
pub struct DeliveryContext {
    pub bus: MessageBus,
    pub subscriber: String,
    pub subscription: SubscriptionId,
}

impl DeliveryContext {
    /// Publishes a message on behalf of the subscriber.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<DeliveryReceipt, BusError> {
        self.bus
            .publish(Message::new(topic, self.subscriber.as_str(), payload))
    }

    /// Answers a request message. The response is routed only to the
    /// waiting caller.
    pub fn reply(&self, request: &Message, payload: Value) -> Result<DeliveryReceipt, BusError> {
        self.bus
            .publish(Message::response_to(request, self.subscriber.as_str(), payload))
    }
}

/// Adapter that turns an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Message>, DeliveryContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Arc<Message>, ctx: DeliveryContext) -> Result<()> {
        (self.0)(message, ctx).await
    }
}

/// Builds a handler from an async closure.
///
/// ```no_run
/// use agentbus::{handler_fn, MessageBus};
/// use agentbus::config::BusConfig;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let bus = MessageBus::new(BusConfig::default());
/// bus.subscribe("audit", "system.alert", handler_fn(|msg, _ctx| async move {
///     tracing::warn!(sender = %msg.sender, "System alert received");
///     Ok(())
/// }))?;
/// # Ok(())
/// # }
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Message>, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
