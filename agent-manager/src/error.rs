use crate::types::AgentState;
use agentbus::BusError;
use thiserror::Error;

/// Lifecycle manager errors.
///
/// Registration and dependency-graph errors are configuration errors and
/// are reported before any agent is started.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("agent '{agent}' depends on unregistered agent '{dependency}'")]
    UnknownDependency { agent: String, dependency: String },

    #[error("dependency cycle between agents: {}", agents.join(", "))]
    DependencyCycle { agents: Vec<String> },

    #[error("agent '{agent}' cannot start: dependency '{dependency}' is not running")]
    DependencyNotRunning { agent: String, dependency: String },

    #[error("agent '{agent}' failed to start: {reason}")]
    StartFailed { agent: String, reason: String },

    #[error("cannot {operation} agent '{agent}' while it is {state}")]
    InvalidState {
        agent: String,
        state: AgentState,
        operation: &'static str,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}
