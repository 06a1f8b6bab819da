use crate::context::AgentContext;
use anyhow::Result;
use async_trait::async_trait;

/// An independently lifecycled unit of logic that talks to the rest of the
/// system only through the message bus.
///
/// The same instance is started again after a restart, each time with a
/// fresh [`AgentContext`]. Subscriptions and tasks created through the
/// context are torn down by the lifecycle manager when the agent stops or
/// fails, so `stop` only needs to flush agent-specific work.
///
/// # Lifecycle
/// 1. `start` subscribes to topics and spawns background work
/// 2. `health_check` runs every heartbeat interval while running; an `Err`
///    withholds that heartbeat
/// 3. `stop` runs within the stop grace period
///
/// # Example
/// ```no_run
/// use agent_manager::{Agent, AgentContext};
/// use agentbus::handler_fn;
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use serde_json::json;
///
/// struct Thermal;
///
/// #[async_trait]
/// impl Agent for Thermal {
///     async fn start(&self, ctx: &AgentContext) -> Result<()> {
///         ctx.subscribe("hardware.temperature", handler_fn(|msg, ctx| async move {
///             if msg.payload["celsius"].as_f64().unwrap_or(0.0) > 90.0 {
///                 ctx.publish("hardware.throttle", json!({ "reason": "overheat" }))?;
///             }
///             Ok(())
///         }))?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Agent: Send + Sync {
    /// Initializes the agent. Returning `Err` (or exceeding the start
    /// timeout) marks the agent `Failed`.
    async fn start(&self, ctx: &AgentContext) -> Result<()>;

    async fn stop(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }
}
