use crate::message::{Message, Priority};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Why a message could not be queued for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRejection {
    Full,
    Closed,
}

struct Queued {
    priority: Priority,
    seq: u64,
    message: Arc<Message>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower publish sequence first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Per-subscription delivery queue ordered by priority, then publish order.
///
/// Exactly one worker pops from a queue, so a single stored `Notify` permit
/// is enough to avoid lost wakeups.
pub(crate) struct DeliveryQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    notify: Notify,
    closed: AtomicBool,
    discarded: AtomicBool,
    capacity: usize,
}

impl DeliveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    pub async fn push(&self, seq: u64, message: Arc<Message>) -> Result<(), QueueRejection> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(QueueRejection::Closed);
        }

        {
            let mut heap = self.heap.lock().await;
            if heap.len() >= self.capacity {
                return Err(QueueRejection::Full);
            }
            heap.push(Queued {
                priority: message.priority,
                seq,
                message,
            });
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the next message. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<Arc<Message>> {
        loop {
            if self.discarded.load(AtomicOrdering::Acquire) {
                return None;
            }
            if let Some(queued) = self.heap.lock().await.pop() {
                return Some(queued.message);
            }
            if self.closed.load(AtomicOrdering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stops accepting messages. Already queued messages are still delivered
    /// unless `discard` is set.
    pub fn close(&self, discard: bool) {
        if discard {
            self.discarded.store(true, AtomicOrdering::Release);
        }
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_one();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(priority: Priority, label: &str) -> Arc<Message> {
        Arc::new(Message::new("test.topic", "tester", json!({ "label": label })).with_priority(priority))
    }

    async fn labels(queue: &DeliveryQueue) -> Vec<String> {
        let mut out = Vec::new();
        while queue.len().await > 0 {
            let msg = queue.pop().await.unwrap();
            out.push(msg.payload_str("label").unwrap().to_string());
        }
        out
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = DeliveryQueue::new(16);
        queue.push(1, message(Priority::Low, "low-1")).await.unwrap();
        queue.push(2, message(Priority::Normal, "normal-1")).await.unwrap();
        queue.push(3, message(Priority::Critical, "critical")).await.unwrap();
        queue.push(4, message(Priority::Normal, "normal-2")).await.unwrap();
        queue.push(5, message(Priority::High, "high")).await.unwrap();
        queue.push(6, message(Priority::Low, "low-2")).await.unwrap();

        assert_eq!(
            labels(&queue).await,
            vec!["critical", "high", "normal-1", "normal-2", "low-1", "low-2"]
        );
    }

    #[tokio::test]
    async fn test_capacity_rejects_new_messages() {
        let queue = DeliveryQueue::new(2);
        queue.push(1, message(Priority::Normal, "a")).await.unwrap();
        queue.push(2, message(Priority::Normal, "b")).await.unwrap();
        assert_eq!(
            queue.push(3, message(Priority::Critical, "c")).await,
            Err(QueueRejection::Full)
        );
        assert_eq!(labels(&queue).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = DeliveryQueue::new(4);
        queue.push(1, message(Priority::Normal, "a")).await.unwrap();
        queue.close(false);

        assert_eq!(
            queue.push(2, message(Priority::Normal, "b")).await,
            Err(QueueRejection::Closed)
        );
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_close_with_discard() {
        let queue = DeliveryQueue::new(4);
        queue.push(1, message(Priority::Normal, "a")).await.unwrap();
        queue.close(true);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(DeliveryQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(1, message(Priority::High, "late")).await.unwrap();

        let msg = waiter.await.unwrap().unwrap();
        assert_eq!(msg.payload_str("label"), Some("late"));
    }
}
