use crate::manager::{lock, LIFECYCLE_REQUEST_TOPIC};
use agentbus::{
    BusError, DeliveryReceipt, Message, MessageBus, MessageHandler, Priority, SubscriptionHandle,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

struct ContextInner {
    name: String,
    config: Map<String, Value>,
    bus: MessageBus,
    shutdown: watch::Sender<bool>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything a running agent may touch, passed in explicitly.
///
/// Subscriptions and tasks created here belong to the current run of the
/// agent and are removed when it stops, fails, or is restarted.
#[derive(Clone)]
pub struct AgentContext {
    inner: Arc<ContextInner>,
}

impl AgentContext {
    pub(crate) fn new(name: &str, config: Map<String, Value>, bus: MessageBus) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                name: name.to_string(),
                config,
                bus,
                shutdown,
                subscriptions: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.inner.config
    }

    /// Typed config lookup. `None` when the key is missing or has the
    /// wrong shape.
    pub fn config_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.inner
            .config
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Subscribes on behalf of this agent.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        let handle = self.inner.bus.subscribe(self.name(), pattern, handler)?;
        lock(&self.inner.subscriptions).push(handle.clone());
        Ok(handle)
    }

    /// Builds a message with this agent as the sender.
    pub fn message(&self, topic: &str, payload: Value) -> Message {
        Message::new(topic, self.name(), payload)
    }

    pub fn publish(&self, topic: &str, payload: Value) -> Result<DeliveryReceipt, BusError> {
        self.inner.bus.publish(self.message(topic, payload))
    }

    pub fn publish_with_priority(
        &self,
        topic: &str,
        payload: Value,
        priority: Priority,
    ) -> Result<DeliveryReceipt, BusError> {
        self.inner
            .bus
            .publish(self.message(topic, payload).with_priority(priority))
    }

    pub async fn request(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Arc<Message>, BusError> {
        self.inner
            .bus
            .request(Message::request(topic, self.name(), payload), timeout)
            .await
    }

    /// Asks the lifecycle manager to restart this agent.
    pub fn request_restart(&self, reason: &str) -> Result<DeliveryReceipt, BusError> {
        self.lifecycle_request("restart", reason)
    }

    /// Asks the lifecycle manager to stop this agent.
    pub fn request_stop(&self, reason: &str) -> Result<DeliveryReceipt, BusError> {
        self.lifecycle_request("stop", reason)
    }

    fn lifecycle_request(&self, action: &str, reason: &str) -> Result<DeliveryReceipt, BusError> {
        self.publish_with_priority(
            LIFECYCLE_REQUEST_TOPIC,
            json!({ "agent": self.name(), "action": action, "reason": reason }),
            Priority::High,
        )
    }

    /// Spawns background work owned by this run of the agent. It should
    /// watch [`shutdown_signal`](Self::shutdown_signal); tasks still
    /// running after the stop grace period are aborted.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    #[cfg(test)]
    fn task_count(&self) -> usize {
        lock(&self.inner.tasks).len()
    }

    /// Resolves to `true` once the agent is asked to stop.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub(crate) fn signal_shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Removes this run's subscriptions and waits for its tasks until
    /// `deadline`, aborting the rest. Returns false if any task had to be
    /// aborted.
    pub(crate) async fn teardown(&self, deadline: Instant) -> bool {
        self.signal_shutdown();

        let subscriptions: Vec<SubscriptionHandle> =
            lock(&self.inner.subscriptions).drain(..).collect();
        for handle in &subscriptions {
            self.inner.bus.unsubscribe(handle);
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        let mut clean = true;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                clean = false;
            }
        }

        if clean {
            debug!(agent = %self.name(), subscriptions = subscriptions.len(), "Agent context torn down");
        } else {
            warn!(agent = %self.name(), "Agent tasks did not finish in time, aborted");
        }
        clean
    }
}
