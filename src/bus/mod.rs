//! Message bus: the single communication path between agents.
//!
//! Published messages are validated and placed on a bounded ingress queue;
//! `publish` returns as soon as the message is enqueued. A dispatcher task
//! matches each message against the subscription registry and pushes it
//! onto one priority queue per matching subscription. Every subscription
//! has its own worker task, so a slow or failing handler only affects its
//! own subscription.
//!
//! Responses (`MessageKind::Response`) bypass the registry and are routed to
//! the caller waiting in [`MessageBus::request`], and only if both the
//! correlation id and the causation id match the outstanding request.

use crate::config::BusConfig;
use crate::error::BusError;
use crate::message::{Message, MessageKind};
use crate::subscription::{SubscriptionHandle, SubscriptionRegistry, TopicPattern};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod handler;
mod queue;

pub use handler::{handler_fn, DeliveryContext, FnHandler, MessageHandler};
use queue::{DeliveryQueue, QueueRejection};

/// Returned once a message has been accepted onto the ingress queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub topic: String,
    /// Publish order across the whole bus
    pub sequence: u64,
    pub accepted_at: DateTime<Utc>,
}

/// Point-in-time delivery counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub dropped_overflow: u64,
    pub responses_routed: u64,
    pub dropped_responses: u64,
    pub timeouts: u64,
    pub active_subscriptions: usize,
    pub pending_requests: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    dropped_overflow: AtomicU64,
    responses_routed: AtomicU64,
    dropped_responses: AtomicU64,
    timeouts: AtomicU64,
}

struct Envelope {
    seq: u64,
    message: Arc<Message>,
}

struct PendingRequest {
    correlation_id: Uuid,
    reply: oneshot::Sender<Arc<Message>>,
}

struct BusInner {
    config: BusConfig,
    registry: SubscriptionRegistry<Arc<DeliveryQueue>>,
    ingress: mpsc::Sender<Envelope>,
    /// Outstanding requests keyed by the request message id
    pending: DashMap<Uuid, PendingRequest>,
    sequence: AtomicU64,
    accepting: AtomicBool,
    counters: Counters,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a running message bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Creates the bus and spawns its dispatcher task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: BusConfig) -> Self {
        let (ingress, rx) = mpsc::channel(config.ingress_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(BusInner {
            config,
            registry: SubscriptionRegistry::new(),
            ingress,
            pending: DashMap::new(),
            sequence: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            counters: Counters::default(),
            shutdown,
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(run_dispatcher(Arc::clone(&inner), rx, shutdown_rx));
        if let Ok(mut slot) = inner.dispatcher.try_lock() {
            *slot = Some(handle);
        }

        info!(
            ingress_capacity = inner.config.ingress_capacity,
            subscriber_queue_capacity = inner.config.subscriber_queue_capacity,
            "Message bus started"
        );

        Self { inner }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Validates and enqueues a message. Never waits for delivery.
    ///
    /// Fails fast with [`BusError::BusUnavailable`] after shutdown and with
    /// [`BusError::Backpressure`] when the ingress queue is full.
    pub fn publish(&self, message: Message) -> Result<DeliveryReceipt, BusError> {
        if !self.is_running() {
            return Err(BusError::BusUnavailable);
        }
        message.validate()?;

        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let receipt = DeliveryReceipt {
            message_id: message.id,
            topic: message.topic.clone(),
            sequence: seq,
            accepted_at: Utc::now(),
        };

        let envelope = Envelope {
            seq,
            message: Arc::new(message),
        };

        match self.inner.ingress.try_send(envelope) {
            Ok(()) => {
                self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    topic = %receipt.topic,
                    message_id = %receipt.message_id,
                    sequence = seq,
                    "Message published"
                );
                Ok(receipt)
            }
            Err(TrySendError::Full(_)) => {
                warn!(topic = %receipt.topic, "Ingress queue full, rejecting publish");
                Err(BusError::Backpressure {
                    capacity: self.inner.config.ingress_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(BusError::BusUnavailable),
        }
    }

    /// Registers `handler` for every topic matching `pattern`.
    ///
    /// Matching happens at dispatch time; messages published before the
    /// subscription existed are not replayed.
    pub fn subscribe(
        &self,
        subscriber: impl Into<String>,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        if !self.is_running() {
            return Err(BusError::BusUnavailable);
        }

        let pattern = TopicPattern::parse(pattern)?;
        let subscriber = subscriber.into();
        let queue = Arc::new(DeliveryQueue::new(self.inner.config.subscriber_queue_capacity));

        let id = self
            .inner
            .registry
            .insert(pattern.clone(), subscriber.clone(), Arc::clone(&queue));

        let handle = SubscriptionHandle {
            id,
            subscriber,
            pattern: pattern.to_string(),
        };

        tokio::spawn(run_worker(self.clone(), handle.clone(), handler, queue));

        debug!(
            subscriber = %handle.subscriber,
            pattern = %handle.pattern,
            subscription = %handle.id,
            "Subscribed"
        );

        Ok(handle)
    }

    /// Removes a subscription. Returns false if it was already gone.
    ///
    /// Messages still queued for the subscription are discarded; a handler
    /// invocation already in progress runs to completion.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        match self.inner.registry.remove(&handle.id) {
            Some(queue) => {
                queue.close(true);
                debug!(
                    subscriber = %handle.subscriber,
                    pattern = %handle.pattern,
                    "Unsubscribed"
                );
                true
            }
            None => false,
        }
    }

    /// Removes every subscription held by `subscriber`.
    pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let mut removed = 0;
        for id in self.inner.registry.subscriptions_of(subscriber) {
            if let Some(queue) = self.inner.registry.remove(&id) {
                queue.close(true);
                removed += 1;
            }
        }
        removed
    }

    /// Sends `message` as a request and waits for its single response.
    ///
    /// A correlation id is assigned unless the caller already set one, and
    /// the request always gets a fresh message id. Only a response whose
    /// correlation id matches and whose causation id names this request is
    /// accepted, so a late answer to an earlier request cannot satisfy this
    /// one even if correlation ids are reused. The timeout is clamped to
    /// `max_request_timeout_ms`.
    pub async fn request(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Arc<Message>, BusError> {
        let timeout = timeout.min(self.inner.config.max_request_timeout());

        message.id = Uuid::now_v7();
        message.kind = MessageKind::Request;
        let correlation_id = *message.correlation_id.get_or_insert_with(Uuid::now_v7);
        let request_id = message.id;
        let topic = message.topic.clone();

        let (reply, rx) = oneshot::channel();
        self.inner.pending.insert(
            request_id,
            PendingRequest {
                correlation_id,
                reply,
            },
        );
        // Removes the correlation entry on every exit path, cancellation included
        let _pending = PendingGuard {
            inner: &self.inner,
            request_id,
        };

        self.publish(message)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BusError::BusUnavailable),
            Err(_) => {
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %topic,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(BusError::Timeout { topic, timeout })
            }
        }
    }

    /// [`MessageBus::request`] with `default_request_timeout_ms`.
    pub async fn request_default(&self, message: Message) -> Result<Arc<Message>, BusError> {
        let timeout = self.inner.config.default_request_timeout();
        self.request(message, timeout).await
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            dropped_overflow: c.dropped_overflow.load(Ordering::Relaxed),
            responses_routed: c.responses_routed.load(Ordering::Relaxed),
            dropped_responses: c.dropped_responses.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            active_subscriptions: self.inner.registry.len(),
            pending_requests: self.inner.pending.len(),
        }
    }

    /// Stops accepting publishes, dispatches what was already accepted,
    /// then closes every subscription. Queued deliveries still run.
    /// Outstanding requests fail with [`BusError::BusUnavailable`].
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Message bus shutting down");

        let _ = self.inner.shutdown.send(true);
        let dispatcher = self.inner.dispatcher.lock().await.take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher task ended abnormally");
            }
        }

        let queues = self.inner.registry.drain();
        for queue in &queues {
            queue.close(false);
        }
        self.inner.pending.clear();

        let stats = self.stats();
        info!(
            published = stats.published,
            delivered = stats.delivered,
            handler_failures = stats.handler_failures,
            closed_subscriptions = queues.len(),
            "Message bus stopped"
        );
    }
}

struct PendingGuard<'a> {
    inner: &'a BusInner,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.request_id);
    }
}

impl BusInner {
    async fn dispatch(&self, envelope: Envelope) {
        let Envelope { seq, message } = envelope;

        if message.kind == MessageKind::Response {
            self.route_response(message);
            return;
        }

        let targets = self.registry.matching(&message.topic);
        if targets.is_empty() {
            debug!(topic = %message.topic, "No subscribers for message");
            return;
        }

        for (id, queue) in targets {
            match queue.push(seq, Arc::clone(&message)).await {
                Ok(()) => {}
                Err(QueueRejection::Full) => {
                    self.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = %id,
                        topic = %message.topic,
                        "Subscriber queue full, dropping message"
                    );
                }
                // Unsubscribed while this message was in flight
                Err(QueueRejection::Closed) => {}
            }
        }
    }

    fn route_response(&self, response: Arc<Message>) {
        let matched = response.causation_id.and_then(|request_id| {
            self.pending.remove_if(&request_id, |_, pending| {
                Some(pending.correlation_id) == response.correlation_id
            })
        });

        let Some((_, pending)) = matched else {
            self.counters.dropped_responses.fetch_add(1, Ordering::Relaxed);
            warn!(
                topic = %response.topic,
                sender = %response.sender,
                correlation_id = ?response.correlation_id,
                causation_id = ?response.causation_id,
                "Dropping late or unmatched response"
            );
            return;
        };

        if pending.reply.send(response).is_err() {
            // Caller stopped waiting between timeout and removal
            self.counters.dropped_responses.fetch_add(1, Ordering::Relaxed);
            debug!("Requester no longer waiting, response dropped");
        } else {
            self.counters.responses_routed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn run_dispatcher(
    inner: Arc<BusInner>,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Some(envelope) => inner.dispatch(envelope).await,
                None => break,
            },
            _ = shutdown.changed() => {
                while let Ok(envelope) = rx.try_recv() {
                    inner.dispatch(envelope).await;
                }
                break;
            }
        }
    }
    debug!("Dispatcher stopped");
}

async fn run_worker(
    bus: MessageBus,
    handle: SubscriptionHandle,
    handler: Arc<dyn MessageHandler>,
    queue: Arc<DeliveryQueue>,
) {
    while let Some(message) = queue.pop().await {
        let ctx = DeliveryContext {
            bus: bus.clone(),
            subscriber: handle.subscriber.clone(),
            subscription: handle.id,
        };

        let outcome = AssertUnwindSafe(handler.handle(Arc::clone(&message), ctx))
            .catch_unwind()
            .await;

        let counters = &bus.inner.counters;
        counters.delivered.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscriber = %handle.subscriber,
                    topic = %message.topic,
                    message_id = %message.id,
                    error = %e,
                    "Handler failed"
                );
            }
            Err(panic) => {
                counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    subscriber = %handle.subscriber,
                    topic = %message.topic,
                    message_id = %message.id,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked"
                );
            }
        }
    }
    debug!(subscriber = %handle.subscriber, pattern = %handle.pattern, "Subscription worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
