use agentbus::config::RestartConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a registered agent.
///
/// ```text
/// Registered -> Starting -> Running -> Stopping -> Stopped
///                  |           |
///                  +-> Failed <+--> Starting (while restarts remain)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Registered => "registered",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Bounded restarts with exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed over the agent's lifetime
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RestartPolicy {
    /// No restarts; the first failure is final.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before restart number `attempt` (0-based): the initial backoff
    /// doubled per attempt, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

/// Registration record for an agent.
///
/// # Example
/// ```
/// use agent_manager::AgentDescriptor;
/// use serde_json::json;
///
/// let descriptor = AgentDescriptor::new("update-applier")
///     .with_dependency("audit")
///     .with_config_value("mode", json!("conservative"));
/// assert!(descriptor.dependencies.contains("audit"));
/// ```
#[derive(Clone, Debug)]
pub struct AgentDescriptor {
    /// Unique name; also the sender name on the agent's messages
    pub name: String,
    /// Agents that must be running before this one starts
    pub dependencies: BTreeSet<String>,
    /// Opaque key/value configuration handed to the agent
    pub config: Map<String, Value>,
    /// Falls back to the manager's default policy when unset
    pub restart: Option<RestartPolicy>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: BTreeSet::new(),
            config: Map::new(),
            restart: None,
        }
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    pub fn with_config_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = Some(restart);
        self
    }
}

/// Point-in-time view of an agent, as tracked by the lifecycle manager.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentStatus {
    pub state: AgentState,
    /// Restarts performed so far (start retries and health restarts)
    pub restarts: u32,
    pub last_error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Registered,
            restarts: 0,
            last_error: None,
            last_heartbeat: None,
            started_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            max_restarts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3_000),
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3_000));
    }

    #[test]
    fn test_policy_from_config() {
        let policy = RestartPolicy::from(&RestartConfig {
            max_restarts: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        });
        assert_eq!(policy.max_restarts, 2);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(RestartPolicy::never().max_restarts, 0);
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = AgentDescriptor::new("audit")
            .with_dependencies(["hardware", "hardware", "scheduler"])
            .with_restart(RestartPolicy::never());
        assert_eq!(descriptor.dependencies.len(), 2);
        assert_eq!(descriptor.restart, Some(RestartPolicy::never()));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(AgentState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_value(AgentState::Stopping).unwrap(),
            serde_json::json!("stopping")
        );
    }
}
