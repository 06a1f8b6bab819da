//! Pluggable decision policies.
//!
//! Agents that must decide autonomously (apply this update now? act on
//! this hardware event?) hand a structured [`Observation`] to a
//! [`DecisionPolicy`] and act on the typed [`Decision`] it returns. The
//! runtime does not prescribe how a policy decides.

use crate::update::UpdatePriority;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Input to a policy: what happened, to what, and the relevant facts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Topic of the message that prompted the decision
    pub topic: String,
    /// What the decision is about (component, device, agent)
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<UpdatePriority>,
    #[serde(default)]
    pub facts: Map<String, Value>,
}

impl Observation {
    pub fn new(topic: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subject: subject.into(),
            priority: None,
            facts: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: UpdatePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: Value) -> Self {
        self.facts.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    /// Not now; ask again later
    Defer { reason: String },
    Reject { reason: String },
    /// Perform a named action with the given parameters
    Act { action: String, payload: Value },
}

impl Decision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed | Decision::Act { .. })
    }
}

/// Strategy interface for autonomous decision points.
#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, observation: &Observation) -> Decision;
}

/// Approves everything.
pub struct AlwaysProceed;

#[async_trait]
impl DecisionPolicy for AlwaysProceed {
    fn name(&self) -> &str {
        "always-proceed"
    }

    async fn decide(&self, _observation: &Observation) -> Decision {
        Decision::Proceed
    }
}

/// Proceeds when the observation's priority is at least `minimum`;
/// defers otherwise. Observations without a priority are deferred.
pub struct PriorityThreshold {
    pub minimum: UpdatePriority,
}

impl PriorityThreshold {
    pub fn new(minimum: UpdatePriority) -> Self {
        Self { minimum }
    }
}

#[async_trait]
impl DecisionPolicy for PriorityThreshold {
    fn name(&self) -> &str {
        "priority-threshold"
    }

    async fn decide(&self, observation: &Observation) -> Decision {
        match observation.priority {
            Some(priority) if priority >= self.minimum => Decision::Proceed,
            Some(priority) => Decision::Defer {
                reason: format!(
                    "priority {:?} is below threshold {:?}",
                    priority, self.minimum
                ),
            },
            None => Decision::Defer {
                reason: "observation has no priority".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_always_proceed() {
        let observation = Observation::new("update.available", "rules");
        assert_eq!(AlwaysProceed.decide(&observation).await, Decision::Proceed);
    }

    #[tokio::test]
    async fn test_priority_threshold() {
        let policy = PriorityThreshold::new(UpdatePriority::High);

        let critical = Observation::new("update.available", "firmware")
            .with_priority(UpdatePriority::Critical);
        assert!(policy.decide(&critical).await.is_proceed());

        let high = Observation::new("update.available", "firmware")
            .with_priority(UpdatePriority::High);
        assert!(policy.decide(&high).await.is_proceed());

        let cosmetic = Observation::new("update.available", "theme")
            .with_priority(UpdatePriority::Cosmetic)
            .with_fact("size", json!(1024));
        assert!(matches!(
            policy.decide(&cosmetic).await,
            Decision::Defer { .. }
        ));

        let unknown = Observation::new("update.available", "theme");
        assert!(!policy.decide(&unknown).await.is_proceed());
    }

    #[test]
    fn test_decision_serialization() {
        let decision = Decision::Act {
            action: "throttle".to_string(),
            payload: json!({ "device": "gpu0" }),
        };
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["decision"], "act");
        assert_eq!(value["action"], "throttle");
    }
}
