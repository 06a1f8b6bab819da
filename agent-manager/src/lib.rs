//! Agent Manager - Lifecycle orchestration for message-bus agents.
//!
//! Agents are independent units of logic that communicate only through the
//! `agentbus` message bus. This crate starts them in dependency order,
//! watches their heartbeats, restarts the ones that fail, and stops them in
//! reverse order.
//!
//! # Architecture
//!
//! ```text
//!          register(descriptor, agent)
//!                     ↓
//! ┌─────────────────────────────────────────┐
//! │       Lifecycle Manager                  │
//! │  - Dependency waves (cycle detection)    │
//! │  - Start / stop with grace period        │
//! │  - Heartbeat monitor, restart + backoff  │
//! └─────────────────────────────────────────┘
//!          ↓ AgentContext          ↑ agent.heartbeat
//! ┌─────────────────────────────────────────┐
//! │       Agents (implement trait)           │
//! │  hardware · resource · audit · update-*  │
//! └─────────────────────────────────────────┘
//!          ↕ publish / subscribe / request
//!       agentbus::MessageBus
//! ```
//!
//! # Core Types
//!
//! - [`Agent`] - Trait that all agents implement
//! - [`AgentContext`] - Explicit handle to the bus for one run of an agent
//! - [`AgentDescriptor`] - Name, dependencies, config and restart policy
//! - [`LifecycleManager`] - Owns the agent state table
//!
//! # Creating an Agent
//!
//! ```no_run
//! use agent_manager::{Agent, AgentContext, AgentDescriptor, LifecycleManager};
//! use agentbus::config::{BusConfig, LifecycleConfig};
//! use agentbus::{handler_fn, MessageBus};
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Security;
//!
//! #[async_trait]
//! impl Agent for Security {
//!     async fn start(&self, ctx: &AgentContext) -> Result<()> {
//!         ctx.subscribe("hardware.*", handler_fn(|msg, _ctx| async move {
//!             tracing::info!(topic = %msg.topic, "Inspecting hardware event");
//!             Ok(())
//!         }))?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let bus = MessageBus::new(BusConfig::default());
//! let manager = LifecycleManager::new(bus, LifecycleConfig::default());
//! manager.register(AgentDescriptor::new("security"), Arc::new(Security))?;
//! manager.start_all().await?;
//! # Ok(())
//! # }
//! ```

mod agent;
mod context;
mod error;
mod graph;
mod health;
mod types;
pub mod agents;
pub mod manager;
pub mod registry;

pub use agent::Agent;
pub use context::AgentContext;
pub use error::LifecycleError;
pub use manager::LifecycleManager;
pub use types::{AgentDescriptor, AgentState, AgentStatus, RestartPolicy};
