use super::TopicPattern;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Entry<T> {
    pattern: TopicPattern,
    subscriber: String,
    target: T,
}

/// Maps subscription ids to a pattern, a subscriber name and a delivery
/// target. The bus stores its per-subscription workers here.
pub struct SubscriptionRegistry<T> {
    entries: DashMap<SubscriptionId, Entry<T>>,
}

impl<T: Clone> SubscriptionRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, pattern: TopicPattern, subscriber: impl Into<String>, target: T) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.entries.insert(
            id,
            Entry {
                pattern,
                subscriber: subscriber.into(),
                target,
            },
        );
        id
    }

    /// Removes a subscription. Returns the target if it was still present.
    pub fn remove(&self, id: &SubscriptionId) -> Option<T> {
        self.entries.remove(id).map(|(_, entry)| entry.target)
    }

    /// All subscriptions whose pattern matches `topic`, one entry per
    /// subscription.
    pub fn matching(&self, topic: &str) -> Vec<(SubscriptionId, T)> {
        self.entries
            .iter()
            .filter(|entry| entry.pattern.matches(topic))
            .map(|entry| (*entry.key(), entry.target.clone()))
            .collect()
    }

    pub fn subscriptions_of(&self, subscriber: &str) -> Vec<SubscriptionId> {
        self.entries
            .iter()
            .filter(|entry| entry.subscriber == subscriber)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Removes every subscription and returns their targets.
    pub fn drain(&self) -> Vec<T> {
        let ids: Vec<SubscriptionId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> TopicPattern {
        TopicPattern::parse(p).unwrap()
    }

    #[test]
    fn test_matching_returns_each_subscription_once() {
        let registry: SubscriptionRegistry<&'static str> = SubscriptionRegistry::new();
        let a = registry.insert(pattern("hardware.*"), "monitor", "a");
        let b = registry.insert(pattern("hardware.detected"), "monitor", "b");
        let c = registry.insert(pattern("**"), "audit", "c");
        registry.insert(pattern("update.*"), "applier", "d");

        let mut ids: Vec<SubscriptionId> = registry
            .matching("hardware.detected")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        let mut expected = vec![a, b, c];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let id = registry.insert(pattern("a.b"), "x", 7);

        assert_eq!(registry.remove(&id), Some(7));
        assert_eq!(registry.remove(&id), None);
        assert!(registry.matching("a.b").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_subscriptions_of() {
        let registry: SubscriptionRegistry<()> = SubscriptionRegistry::new();
        let first = registry.insert(pattern("a.*"), "agent-a", ());
        let second = registry.insert(pattern("b.*"), "agent-a", ());
        registry.insert(pattern("c.*"), "agent-b", ());

        let mut ids = registry.subscriptions_of("agent-a");
        ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.drain().len(), 3);
        assert!(registry.is_empty());
    }
}
