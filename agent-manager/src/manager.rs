//! Lifecycle manager - Orchestrates agent startup, health and shutdown.
//!
//! Owns the agent state table. Agents never set their own state; they ask
//! for a restart or stop on `agent.lifecycle.request` and the manager
//! applies it.

use crate::agent::Agent;
use crate::context::AgentContext;
use crate::error::LifecycleError;
use crate::graph::start_waves;
use crate::health;
use crate::types::{AgentDescriptor, AgentState, AgentStatus, RestartPolicy};
use agentbus::config::LifecycleConfig;
use agentbus::{handler_fn, Message, MessageBus, Priority, SubscriptionHandle};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Sender name on messages published by the manager.
pub const MANAGER_SENDER: &str = "lifecycle-manager";
pub const STATE_CHANGED_TOPIC: &str = "agent.state.changed";
pub const HEARTBEAT_TOPIC: &str = "agent.heartbeat";
pub const LIFECYCLE_REQUEST_TOPIC: &str = "agent.lifecycle.request";
pub const ALERT_TOPIC: &str = "system.alert";

/// Resources of one run of an agent.
struct Run {
    context: AgentContext,
    pulse: JoinHandle<()>,
}

/// One row of the agent state table.
pub(crate) struct AgentSlot {
    pub(crate) name: String,
    dependencies: BTreeSet<String>,
    config: serde_json::Map<String, Value>,
    pub(crate) restart: RestartPolicy,
    agent: Arc<dyn Agent>,
    /// Serializes start/stop/restart of this agent
    op_lock: tokio::sync::Mutex<()>,
    status: Mutex<AgentStatus>,
    run: Mutex<Option<Run>>,
}

impl AgentSlot {
    pub(crate) fn status(&self) -> MutexGuard<'_, AgentStatus> {
        lock(&self.status)
    }

    pub(crate) fn state(&self) -> AgentState {
        self.status().state
    }
}

struct Inner {
    bus: MessageBus,
    config: LifecycleConfig,
    agents: DashMap<String, Arc<AgentSlot>>,
    /// Set while `stop_all` runs; cancels pending restarts
    stopping: AtomicBool,
    /// Health loop and lifecycle request listener
    background: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

/// Lifecycle manager for bus agents.
///
/// # Responsibilities
/// - Register agents and validate their dependency graph
/// - Start agents in dependency waves, retrying failed starts with backoff
/// - Monitor heartbeats and restart agents that stop sending them
/// - Stop agents in reverse order with a bounded grace period
/// - Publish every state transition on `agent.state.changed`
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    pub fn new(bus: MessageBus, config: LifecycleConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                config,
                agents: DashMap::new(),
                stopping: AtomicBool::new(false),
                background: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// Registers an agent in the `Registered` state.
    ///
    /// Dependencies are checked by [`start_all`](Self::start_all), so
    /// agents can be registered in any order.
    pub fn register(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn Agent>,
    ) -> Result<(), LifecycleError> {
        use dashmap::mapref::entry::Entry;

        let restart = descriptor
            .restart
            .clone()
            .unwrap_or_else(|| RestartPolicy::from(&self.inner.config.restart));

        match self.inner.agents.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(LifecycleError::DuplicateAgent(descriptor.name)),
            Entry::Vacant(slot) => {
                info!(
                    agent = %descriptor.name,
                    dependencies = ?descriptor.dependencies,
                    "Agent registered"
                );
                slot.insert(Arc::new(AgentSlot {
                    name: descriptor.name,
                    dependencies: descriptor.dependencies,
                    config: descriptor.config,
                    restart,
                    agent,
                    op_lock: tokio::sync::Mutex::new(()),
                    status: Mutex::new(AgentStatus::default()),
                    run: Mutex::new(None),
                }));
                Ok(())
            }
        }
    }

    /// Start waves for the registered agents.
    pub fn plan(&self) -> Result<Vec<Vec<String>>, LifecycleError> {
        let graph: BTreeMap<String, BTreeSet<String>> = self
            .inner
            .agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().dependencies.clone()))
            .collect();
        start_waves(&graph)
    }

    /// Starts every registered agent in dependency order.
    ///
    /// The dependency graph is validated first; a cycle or unknown
    /// dependency fails before any agent starts. An agent that still fails
    /// after its restart budget raises a `system.alert` and aborts the
    /// remaining waves with `StartFailed`.
    pub async fn start_all(&self) -> Result<(), LifecycleError> {
        let waves = self.plan()?;
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.start_background()?;

        info!(
            agents = self.inner.agents.len(),
            waves = waves.len(),
            "Starting agents"
        );

        for (index, wave) in waves.iter().enumerate() {
            debug!(wave = index, agents = ?wave, "Starting wave");
            let results = join_all(wave.iter().map(|name| self.start_with_retry(name))).await;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                error!(wave = index, error = %err, "Agent start failed, aborting startup");
                return Err(err);
            }
        }

        info!("All agents running");
        Ok(())
    }

    /// Stops every agent in reverse dependency order.
    ///
    /// Each agent gets `stop_grace_ms` for `Agent::stop` and its tasks;
    /// anything still running afterwards is aborted. Failed agents stay
    /// `Failed`.
    pub async fn stop_all(&self) -> Result<(), LifecycleError> {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let waves = self.plan()?;
        info!(agents = self.inner.agents.len(), "Stopping agents");

        for wave in waves.iter().rev() {
            join_all(wave.iter().map(|name| async move {
                if let Ok(slot) = self.slot(name) {
                    self.stop_slot(&slot).await;
                }
            }))
            .await;
        }

        self.stop_background();
        info!("All agents stopped");
        Ok(())
    }

    /// Starts one agent whose dependencies are already running.
    pub async fn start_agent(&self, name: &str) -> Result<(), LifecycleError> {
        let slot = self.slot(name)?;
        let state = slot.state();
        if matches!(state, AgentState::Starting | AgentState::Stopping) {
            return Err(LifecycleError::InvalidState {
                agent: name.to_string(),
                state,
                operation: "start",
            });
        }
        self.check_dependencies(&slot)?;
        self.start_with_retry(name).await
    }

    pub async fn stop_agent(&self, name: &str) -> Result<(), LifecycleError> {
        let slot = self.slot(name)?;
        self.stop_slot(&slot).await;
        Ok(())
    }

    /// Stops the agent (if running) and starts it again.
    pub async fn restart_agent(&self, name: &str) -> Result<(), LifecycleError> {
        let slot = self.slot(name)?;
        info!(agent = %name, "Restarting agent");
        self.stop_slot(&slot).await;
        self.check_dependencies(&slot)?;
        self.start_with_retry(name).await
    }

    pub fn state(&self, name: &str) -> Option<AgentState> {
        self.inner.agents.get(name).map(|slot| slot.state())
    }

    pub fn status(&self, name: &str) -> Option<AgentStatus> {
        self.inner
            .agents
            .get(name)
            .map(|slot| slot.status().clone())
    }

    /// Current state of every agent, by name.
    pub fn states(&self) -> BTreeMap<String, AgentState> {
        self.inner
            .agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    pub(crate) fn slot(&self, name: &str) -> Result<Arc<AgentSlot>, LifecycleError> {
        self.inner
            .agents
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LifecycleError::UnknownAgent(name.to_string()))
    }

    pub(crate) fn slots(&self) -> Vec<Arc<AgentSlot>> {
        self.inner
            .agents
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    fn check_dependencies(&self, slot: &AgentSlot) -> Result<(), LifecycleError> {
        for dependency in &slot.dependencies {
            if self.state(dependency) != Some(AgentState::Running) {
                return Err(LifecycleError::DependencyNotRunning {
                    agent: slot.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        Ok(())
    }

    /// Starts the agent, retrying with exponential backoff while its
    /// restart budget lasts.
    async fn start_with_retry(&self, name: &str) -> Result<(), LifecycleError> {
        let slot = self.slot(name)?;

        loop {
            let reason = match self.start_once(&slot).await {
                Ok(()) => return Ok(()),
                Err(reason) => reason,
            };

            let attempt = slot.status().restarts;
            if attempt >= slot.restart.max_restarts || self.is_stopping() {
                self.alert(
                    name,
                    "start_failed",
                    &format!("Agent failed to start after {} restarts: {}", attempt, reason),
                );
                return Err(LifecycleError::StartFailed {
                    agent: name.to_string(),
                    reason,
                });
            }

            let delay = health::backoff_with_jitter(&slot.restart, attempt);
            slot.status().restarts = attempt + 1;
            warn!(
                agent = %name,
                attempt = attempt + 1,
                max_restarts = slot.restart.max_restarts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Agent start failed, backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One start attempt. Returns the failure reason on error.
    pub(crate) async fn start_once(&self, slot: &AgentSlot) -> Result<(), String> {
        let _op = slot.op_lock.lock().await;

        match slot.state() {
            AgentState::Running => return Ok(()),
            AgentState::Registered | AgentState::Stopped | AgentState::Failed => {}
            state => return Err(format!("agent is {}", state)),
        }

        self.transition(slot, AgentState::Starting, None);
        let context = AgentContext::new(&slot.name, slot.config.clone(), self.inner.bus.clone());

        let outcome = tokio::time::timeout(
            self.inner.config.start_timeout(),
            slot.agent.start(&context),
        )
        .await;

        let reason = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some(format!(
                "start timed out after {}ms",
                self.inner.config.start_timeout_ms
            )),
        };

        if let Some(reason) = reason {
            context.teardown(Instant::now()).await;
            slot.status().last_error = Some(reason.clone());
            self.transition(slot, AgentState::Failed, Some(&reason));
            return Err(reason);
        }

        let pulse = health::spawn_pulse(
            Arc::clone(&slot.agent),
            context.clone(),
            self.inner.config.heartbeat_interval(),
        );
        *lock(&slot.run) = Some(Run { context, pulse });

        {
            let now = Utc::now();
            let mut status = slot.status();
            status.started_at = Some(now);
            status.last_heartbeat = Some(now);
            status.last_error = None;
        }
        self.transition(slot, AgentState::Running, None);
        Ok(())
    }

    /// Moves a running or starting agent to `Stopped`. Failed agents are
    /// torn down but keep their state.
    pub(crate) async fn stop_slot(&self, slot: &AgentSlot) {
        let _op = slot.op_lock.lock().await;

        let state = slot.state();
        let run = lock(&slot.run).take();
        let Some(Run { context, pulse }) = run else {
            return;
        };
        pulse.abort();

        if state == AgentState::Failed {
            context.teardown(Instant::now()).await;
            return;
        }

        self.transition(slot, AgentState::Stopping, None);
        let deadline = Instant::now() + self.inner.config.stop_grace();
        context.signal_shutdown();

        match tokio::time::timeout_at(deadline, slot.agent.stop(&context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(agent = %slot.name, error = %e, "Agent stop returned an error"),
            Err(_) => warn!(
                agent = %slot.name,
                grace_ms = self.inner.config.stop_grace_ms,
                "Agent did not stop within grace period, forcing termination"
            ),
        }
        context.teardown(deadline).await;

        slot.status().started_at = None;
        self.transition(slot, AgentState::Stopped, None);
    }

    /// Marks a running agent `Failed` and tears its run down. Returns false
    /// if the agent was not running.
    pub(crate) async fn fail_running(&self, slot: &AgentSlot, reason: &str) -> bool {
        let _op = slot.op_lock.lock().await;
        if slot.state() != AgentState::Running {
            return false;
        }

        let run = lock(&slot.run).take();
        if let Some(Run { context, pulse }) = run {
            pulse.abort();
            context.teardown(Instant::now()).await;
        }

        slot.status().last_error = Some(reason.to_string());
        self.transition(slot, AgentState::Failed, Some(reason));
        true
    }

    fn transition(&self, slot: &AgentSlot, to: AgentState, reason: Option<&str>) {
        let from = {
            let mut status = slot.status();
            std::mem::replace(&mut status.state, to)
        };

        match to {
            AgentState::Failed => warn!(agent = %slot.name, from = %from, reason = ?reason, "Agent failed"),
            _ => info!(agent = %slot.name, from = %from, to = %to, "Agent state changed"),
        }

        let message = Message::new(
            STATE_CHANGED_TOPIC,
            MANAGER_SENDER,
            json!({
                "agent": slot.name,
                "from": from,
                "to": to,
                "reason": reason,
            }),
        );
        if let Err(e) = self.inner.bus.publish(message) {
            debug!(agent = %slot.name, error = %e, "State change not published");
        }
    }

    /// Publishes a Critical `system.alert` about an agent.
    pub(crate) fn alert(&self, agent: &str, reason: &str, message: &str) {
        error!(agent = %agent, reason = %reason, "{}", message);
        let restarts = self
            .inner
            .agents
            .get(agent)
            .map_or(0, |slot| slot.status().restarts);
        let alert = Message::new(
            ALERT_TOPIC,
            MANAGER_SENDER,
            json!({
                "source": MANAGER_SENDER,
                "reason": reason,
                "agent": agent,
                "message": message,
                "restarts": restarts,
            }),
        )
        .with_priority(Priority::Critical);
        if let Err(e) = self.inner.bus.publish(alert) {
            error!(agent = %agent, error = %e, "Failed to publish system alert");
        }
    }

    /// Spawns the health loop and the lifecycle request listener once.
    fn start_background(&self) -> Result<(), LifecycleError> {
        let mut background = lock(&self.inner.background);
        if !background.is_empty() {
            return Ok(());
        }

        let mut subscriptions = lock(&self.inner.subscriptions);
        subscriptions.push(health::subscribe_heartbeats(self)?);

        let manager = self.clone();
        subscriptions.push(self.inner.bus.subscribe(
            MANAGER_SENDER,
            LIFECYCLE_REQUEST_TOPIC,
            handler_fn(move |msg, _ctx| {
                let manager = manager.clone();
                async move {
                    manager.handle_lifecycle_request(&msg);
                    Ok(())
                }
            }),
        )?);

        background.push(health::spawn_monitor(self.clone()));
        Ok(())
    }

    fn stop_background(&self) {
        for handle in lock(&self.inner.background).drain(..) {
            handle.abort();
        }
        for subscription in lock(&self.inner.subscriptions).drain(..) {
            self.inner.bus.unsubscribe(&subscription);
        }
    }

    fn handle_lifecycle_request(&self, message: &Message) {
        #[derive(Deserialize)]
        struct LifecycleRequest {
            agent: String,
            action: String,
            #[serde(default)]
            reason: Option<String>,
        }

        let request: LifecycleRequest = match message.decode_payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "Ignoring malformed lifecycle request");
                return;
            }
        };

        if self.is_stopping() {
            debug!(agent = %request.agent, "Ignoring lifecycle request during shutdown");
            return;
        }

        info!(
            agent = %request.agent,
            action = %request.action,
            sender = %message.sender,
            reason = ?request.reason,
            "Lifecycle request received"
        );

        let manager = self.clone();
        match request.action.as_str() {
            "restart" => {
                tokio::spawn(async move {
                    if let Err(e) = manager.restart_agent(&request.agent).await {
                        warn!(agent = %request.agent, error = %e, "Requested restart failed");
                    }
                });
            }
            "stop" => {
                tokio::spawn(async move {
                    if let Err(e) = manager.stop_agent(&request.agent).await {
                        warn!(agent = %request.agent, error = %e, "Requested stop failed");
                    }
                });
            }
            other => warn!(agent = %request.agent, action = %other, "Unknown lifecycle action"),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
