// Integration tests for the lifecycle manager and the built-in agents.
//
// Agents here are small scripted doubles; timings use short heartbeat and
// backoff settings so recovery paths finish well under a second.

use agent_manager::manager::{ALERT_TOPIC, STATE_CHANGED_TOPIC};
use agent_manager::registry::builtin_agents;
use agent_manager::{
    Agent, AgentContext, AgentDescriptor, AgentState, LifecycleError, LifecycleManager,
    RestartPolicy,
};
use agentbus::backup::MemoryBackupStore;
use agentbus::config::{AgentBusConfig, AgentSettings, BusConfig, ComponentConfig, LifecycleConfig};
use agentbus::update::{DocumentComponent, PendingStore, UpdateCoordinator, UpdatePackage};
use agentbus::{handler_fn, Message, MessageBus, Priority};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

// ── Test agents ──────────────────────────────────────────────────────────────

type EventLog = Arc<Mutex<Vec<String>>>;

/// Records start/stop calls; optionally fails its first `fail_starts` starts
/// or its health checks.
struct ScriptedAgent {
    log: EventLog,
    starts: AtomicU32,
    fail_starts: u32,
    /// Health checks fail while the start count is <= this value
    sick_until_start: u32,
    stop_delay: Duration,
    context: Mutex<Option<AgentContext>>,
}

impl ScriptedAgent {
    fn new(log: &EventLog) -> Self {
        Self {
            log: Arc::clone(log),
            starts: AtomicU32::new(0),
            fail_starts: 0,
            sick_until_start: 0,
            stop_delay: Duration::ZERO,
            context: Mutex::new(None),
        }
    }

    fn failing_starts(mut self, count: u32) -> Self {
        self.fail_starts = count;
        self
    }

    fn sick_until_start(mut self, start: u32) -> Self {
        self.sick_until_start = start;
        self
    }

    fn slow_stop(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    fn context(&self) -> AgentContext {
        self.context.lock().unwrap().clone().expect("agent was started")
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn start(&self, ctx: &AgentContext) -> Result<()> {
        let start = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().unwrap().push(format!("start:{}", ctx.name()));
        if start <= self.fail_starts {
            return Err(anyhow!("port already in use"));
        }
        *self.context.lock().unwrap() = Some(ctx.clone());
        Ok(())
    }

    async fn stop(&self, ctx: &AgentContext) -> Result<()> {
        tokio::time::sleep(self.stop_delay).await;
        self.log.lock().unwrap().push(format!("stop:{}", ctx.name()));
        Ok(())
    }

    async fn health_check(&self, _ctx: &AgentContext) -> Result<()> {
        if self.starts() <= self.sick_until_start {
            return Err(anyhow!("device unresponsive"));
        }
        Ok(())
    }
}

/// Checks, from inside its own start, that its dependency is already running.
struct DependentAgent {
    manager: LifecycleManager,
    dependency: String,
    observed: Mutex<Option<AgentState>>,
}

#[async_trait]
impl Agent for DependentAgent {
    async fn start(&self, _ctx: &AgentContext) -> Result<()> {
        *self.observed.lock().unwrap() = self.manager.state(&self.dependency);
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn fast_config() -> LifecycleConfig {
    let mut config = LifecycleConfig {
        heartbeat_interval_ms: 50,
        max_missed_heartbeats: 4,
        stop_grace_ms: 200,
        start_timeout_ms: 1_000,
        ..LifecycleConfig::default()
    };
    config.restart.max_restarts = 3;
    config.restart.initial_backoff_ms = 10;
    config.restart.max_backoff_ms = 40;
    config
}

fn fast_restarts(max_restarts: u32) -> RestartPolicy {
    RestartPolicy {
        max_restarts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
    }
}

fn new_manager() -> LifecycleManager {
    LifecycleManager::new(MessageBus::new(BusConfig::default()), fast_config())
}

fn collect(bus: &MessageBus, pattern: &str) -> UnboundedReceiver<Arc<Message>> {
    let (tx, rx) = unbounded_channel();
    bus.subscribe(
        "test-observer",
        pattern,
        handler_fn(move |msg, _ctx| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
                Ok(())
            }
        }),
    )
    .unwrap();
    rx
}

async fn next_within(rx: &mut UnboundedReceiver<Arc<Message>>, ms: u64) -> Option<Arc<Message>> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .flatten()
}

/// Polls `check` until it holds or `ms` elapse.
async fn eventually(ms: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn transitions(rx: &mut UnboundedReceiver<Arc<Message>>) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        seen.push(format!(
            "{}:{}",
            msg.payload["agent"].as_str().unwrap_or_default(),
            msg.payload["to"].as_str().unwrap_or_default()
        ));
    }
    seen
}

// ── Registration and ordering ────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let manager = new_manager();
    let log = EventLog::default();

    manager
        .register(AgentDescriptor::new("audit"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();
    let err = manager
        .register(AgentDescriptor::new("audit"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap_err();

    assert!(matches!(err, LifecycleError::DuplicateAgent(ref name) if name == "audit"));
    assert_eq!(manager.state("audit"), Some(AgentState::Registered));
}

#[tokio::test]
async fn test_dependency_running_before_dependent_starts() {
    let manager = new_manager();
    let mut changes = collect(manager.bus(), STATE_CHANGED_TOPIC);
    let log = EventLog::default();

    let dependent = Arc::new(DependentAgent {
        manager: manager.clone(),
        dependency: "b".to_string(),
        observed: Mutex::new(None),
    });
    // Register the dependent first; order of registration must not matter
    manager
        .register(AgentDescriptor::new("a").with_dependency("b"), dependent.clone())
        .unwrap();
    manager
        .register(AgentDescriptor::new("b"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();

    manager.start_all().await.unwrap();

    assert_eq!(*dependent.observed.lock().unwrap(), Some(AgentState::Running));
    assert_eq!(manager.state("a"), Some(AgentState::Running));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = transitions(&mut changes);
    let b_running = seen.iter().position(|t| t == "b:running").unwrap();
    let a_starting = seen.iter().position(|t| t == "a:starting").unwrap();
    assert!(b_running < a_starting, "transitions: {:?}", seen);

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_cycle_detected_before_any_start() {
    let manager = new_manager();
    let log = EventLog::default();

    manager
        .register(AgentDescriptor::new("a").with_dependency("b"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();
    manager
        .register(AgentDescriptor::new("b").with_dependency("a"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();
    manager
        .register(AgentDescriptor::new("c"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();

    let err = manager.start_all().await.unwrap_err();
    match err {
        LifecycleError::DependencyCycle { agents } => {
            assert_eq!(agents, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected a cycle error, got {}", other),
    }

    assert!(log.lock().unwrap().is_empty());
    for state in manager.states().values() {
        assert_eq!(*state, AgentState::Registered);
    }
}

#[tokio::test]
async fn test_unknown_dependency_rejected() {
    let manager = new_manager();
    let log = EventLog::default();
    manager
        .register(
            AgentDescriptor::new("update-proposer").with_dependency("update-applier"),
            Arc::new(ScriptedAgent::new(&log)),
        )
        .unwrap();

    let err = manager.start_all().await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::UnknownDependency { ref agent, ref dependency }
            if agent == "update-proposer" && dependency == "update-applier"
    ));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_all_runs_in_reverse_dependency_order() {
    let manager = new_manager();
    let log = EventLog::default();

    manager
        .register(AgentDescriptor::new("audit"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();
    manager
        .register(
            AgentDescriptor::new("applier").with_dependency("audit"),
            Arc::new(ScriptedAgent::new(&log)),
        )
        .unwrap();
    manager
        .register(
            AgentDescriptor::new("proposer").with_dependency("applier"),
            Arc::new(ScriptedAgent::new(&log)),
        )
        .unwrap();

    manager.start_all().await.unwrap();
    manager.stop_all().await.unwrap();

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "start:audit",
            "start:applier",
            "start:proposer",
            "stop:proposer",
            "stop:applier",
            "stop:audit",
        ]
    );
    for state in manager.states().values() {
        assert_eq!(*state, AgentState::Stopped);
    }
}

#[tokio::test]
async fn test_stop_grace_period_forces_termination() {
    let manager = new_manager();
    let log = EventLog::default();
    let agent = Arc::new(ScriptedAgent::new(&log).slow_stop(Duration::from_secs(30)));
    manager
        .register(AgentDescriptor::new("hardware"), agent.clone())
        .unwrap();

    manager.start_all().await.unwrap();

    // A task that ignores the shutdown signal
    let ctx = agent.context();
    ctx.spawn(async {
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let started = Instant::now();
    manager.stop_all().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(manager.state("hardware"), Some(AgentState::Stopped));
    assert!(!log.lock().unwrap().contains(&"stop:hardware".to_string()));
}

// ── Start failures ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_retried_with_backoff() {
    let manager = new_manager();
    let log = EventLog::default();
    let agent = Arc::new(ScriptedAgent::new(&log).failing_starts(2));
    manager
        .register(
            AgentDescriptor::new("hardware").with_restart(fast_restarts(3)),
            agent.clone(),
        )
        .unwrap();

    manager.start_all().await.unwrap();

    assert_eq!(agent.starts(), 3);
    let status = manager.status("hardware").unwrap();
    assert_eq!(status.state, AgentState::Running);
    assert_eq!(status.restarts, 2);
    assert!(status.last_error.is_none());

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_start_failure_exhausts_budget_and_alerts() {
    let manager = new_manager();
    let mut alerts = collect(manager.bus(), ALERT_TOPIC);
    let log = EventLog::default();

    manager
        .register(
            AgentDescriptor::new("hardware").with_restart(fast_restarts(2)),
            Arc::new(ScriptedAgent::new(&log).failing_starts(u32::MAX)),
        )
        .unwrap();
    manager
        .register(
            AgentDescriptor::new("monitor").with_dependency("hardware"),
            Arc::new(ScriptedAgent::new(&log)),
        )
        .unwrap();

    let err = manager.start_all().await.unwrap_err();
    assert!(matches!(err, LifecycleError::StartFailed { ref agent, .. } if agent == "hardware"));

    let status = manager.status("hardware").unwrap();
    assert_eq!(status.state, AgentState::Failed);
    assert_eq!(status.restarts, 2);
    assert!(status.last_error.unwrap().contains("port already in use"));
    assert_eq!(manager.state("monitor"), Some(AgentState::Registered));

    let alert = next_within(&mut alerts, 500).await.expect("system alert published");
    assert_eq!(alert.payload["reason"], "start_failed");
    assert_eq!(alert.payload["agent"], "hardware");
    assert_eq!(alert.priority, agentbus::Priority::Critical);

    manager.stop_all().await.unwrap();
    assert_eq!(manager.state("hardware"), Some(AgentState::Failed));
}

#[tokio::test]
async fn test_start_agent_requires_running_dependencies() {
    let manager = new_manager();
    let log = EventLog::default();
    manager
        .register(AgentDescriptor::new("audit"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();
    manager
        .register(
            AgentDescriptor::new("applier").with_dependency("audit"),
            Arc::new(ScriptedAgent::new(&log)),
        )
        .unwrap();

    let err = manager.start_agent("applier").await.unwrap_err();
    assert!(matches!(err, LifecycleError::DependencyNotRunning { .. }));

    manager.start_agent("audit").await.unwrap();
    manager.start_agent("applier").await.unwrap();
    assert_eq!(manager.state("applier"), Some(AgentState::Running));

    assert!(matches!(
        manager.start_agent("ghost").await,
        Err(LifecycleError::UnknownAgent(_))
    ));
}

// ── Health monitoring ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missed_heartbeats_trigger_restart() {
    let manager = new_manager();
    let mut changes = collect(manager.bus(), STATE_CHANGED_TOPIC);
    let log = EventLog::default();
    let agent = Arc::new(ScriptedAgent::new(&log).sick_until_start(1));
    manager
        .register(
            AgentDescriptor::new("hardware").with_restart(fast_restarts(3)),
            agent.clone(),
        )
        .unwrap();

    manager.start_all().await.unwrap();

    let recovered = eventually(2_000, || {
        agent.starts() == 2 && manager.state("hardware") == Some(AgentState::Running)
    })
    .await;
    assert!(recovered, "agent was not restarted: {:?}", manager.status("hardware"));
    assert_eq!(manager.status("hardware").unwrap().restarts, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = transitions(&mut changes);
    assert!(seen.contains(&"hardware:failed".to_string()), "transitions: {:?}", seen);

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_restarts_leave_agent_failed_with_alert() {
    let manager = new_manager();
    let mut alerts = collect(manager.bus(), ALERT_TOPIC);
    let log = EventLog::default();
    let agent = Arc::new(ScriptedAgent::new(&log).sick_until_start(u32::MAX));
    manager
        .register(
            AgentDescriptor::new("hardware").with_restart(fast_restarts(1)),
            agent.clone(),
        )
        .unwrap();

    manager.start_all().await.unwrap();

    let alert = next_within(&mut alerts, 3_000).await.expect("system alert published");
    assert_eq!(alert.payload["reason"], "restart_limit_exceeded");
    assert_eq!(alert.payload["agent"], "hardware");
    assert_eq!(alert.payload["restarts"], 1);

    assert_eq!(agent.starts(), 2);
    assert_eq!(manager.state("hardware"), Some(AgentState::Failed));

    // No further restarts once the budget is gone
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.starts(), 2);

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_zero_heartbeat_interval_still_monitors() {
    let config = LifecycleConfig {
        heartbeat_interval_ms: 0,
        ..fast_config()
    };
    let manager = LifecycleManager::new(MessageBus::new(BusConfig::default()), config);
    let log = EventLog::default();
    let agent = Arc::new(ScriptedAgent::new(&log).sick_until_start(u32::MAX));
    manager
        .register(
            AgentDescriptor::new("hardware").with_restart(fast_restarts(0)),
            agent.clone(),
        )
        .unwrap();

    manager.start_all().await.unwrap();

    let failed = eventually(1_500, || manager.state("hardware") == Some(AgentState::Failed)).await;
    assert!(failed, "sick agent not detected: {:?}", manager.status("hardware"));
    assert_eq!(agent.starts(), 1);

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_agent_requested_restart() {
    let manager = new_manager();
    let log = EventLog::default();
    let agent = Arc::new(ScriptedAgent::new(&log));
    manager
        .register(AgentDescriptor::new("audit"), agent.clone())
        .unwrap();
    manager.start_all().await.unwrap();

    agent.context().request_restart("configuration reloaded").unwrap();

    let restarted = eventually(1_000, || {
        agent.starts() == 2 && manager.state("audit") == Some(AgentState::Running)
    })
    .await;
    assert!(restarted);
    assert!(log.lock().unwrap().contains(&"stop:audit".to_string()));

    manager.stop_all().await.unwrap();
}

// ── Built-in agents ──────────────────────────────────────────────────────────

fn builtin_config(source_dir: &std::path::Path) -> AgentBusConfig {
    let mut config = AgentBusConfig {
        lifecycle: fast_config(),
        ..AgentBusConfig::default()
    };
    config.updates.verify_timeout_ms = 500;

    let mut initial = Map::new();
    initial.insert("threshold".to_string(), json!(10));
    config.updates.components.push(ComponentConfig {
        name: "thresholds".to_string(),
        version: "1.0.0".to_string(),
        required_keys: vec!["threshold".to_string()],
        dependencies: Vec::new(),
        hot_update: true,
        initial,
    });

    let mut hardware = AgentSettings::default();
    hardware.config.insert(
        "devices".to_string(),
        json!([
            {"id": "gpu0", "kind": "gpu", "properties": {"memoryGb": 24}},
            {"id": "cam0", "kind": "camera"}
        ]),
    );
    config.agents.insert("hardware".to_string(), hardware);

    let mut resource = AgentSettings::default();
    resource
        .config
        .insert("capacities".to_string(), json!({"gpu": 2.0, "memory": 4096.0}));
    config.agents.insert("resource".to_string(), resource);

    let mut proposer = AgentSettings::default();
    proposer.config.insert(
        "source_dir".to_string(),
        json!(source_dir.to_string_lossy()),
    );
    config.agents.insert("update-proposer".to_string(), proposer);
    config
}

#[tokio::test]
async fn test_builtin_agents_end_to_end() {
    let drop_dir = tempfile::tempdir().unwrap();
    let config = builtin_config(drop_dir.path());
    let bus = MessageBus::new(config.bus.clone());

    let coordinator = UpdateCoordinator::new(
        bus.clone(),
        Arc::new(MemoryBackupStore::new()),
        PendingStore::in_memory(),
        &config.updates,
        config.backup.keep_count,
    );
    for component in &config.updates.components {
        coordinator
            .register_component(Arc::new(DocumentComponent::from_config(component)))
            .unwrap();
    }

    let manager = LifecycleManager::new(bus.clone(), config.lifecycle.clone());
    for (descriptor, agent) in builtin_agents(&config, coordinator.clone()) {
        manager.register(descriptor, agent).unwrap();
    }
    let mut proposals = collect(&bus, "update.proposal");
    manager.start_all().await.unwrap();

    // Hardware inventory
    let reply = bus
        .request(
            Message::request("hardware.query", "test-client", json!({"kind": "gpu"})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let devices = reply.payload["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["id"], "gpu0");

    // Resource allocation
    let reply = bus
        .request(
            Message::request("resource.request", "test-client", json!({"resource": "memory", "amount": 1024.0})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(reply.payload["granted"], true);
    assert_eq!(reply.payload["allocation"]["requester"], "test-client");

    // Drop a newer package and fire the update check trigger
    let package = UpdatePackage::new(
        "thresholds",
        "1.1.0",
        serde_json::to_vec(&json!({"threshold": 25})).unwrap(),
    );
    std::fs::write(
        drop_dir.path().join("thresholds-1.1.0.json"),
        serde_json::to_vec(&package).unwrap(),
    )
    .unwrap();
    bus.publish(Message::new("schedule.update-check", "scheduler", json!({})))
        .unwrap();

    let proposal = next_within(&mut proposals, 3_000).await.expect("proposal published");
    assert_eq!(proposal.payload["component"], "thresholds");
    assert_eq!(proposal.payload["submitted"], true);
    assert_eq!(proposal.payload["status"], "applied");
    assert_eq!(
        coordinator.versions().await.get("thresholds").map(String::as_str),
        Some("1.1.0")
    );

    // A second check finds nothing newer
    bus.publish(Message::new("schedule.update-check", "scheduler", json!({})))
        .unwrap();
    let proposal = next_within(&mut proposals, 3_000).await.expect("proposal published");
    assert_eq!(proposal.payload["submitted"], false);

    // Audit saw the update lifecycle
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reply = bus
        .request(
            Message::request("audit.recent", "test-client", json!({})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let entries = reply.payload["entries"].as_array().unwrap();
    assert!(entries.iter().any(|e| e["topic"] == "update.applied"));
    assert!(entries.iter().any(|e| e["topic"] == "agent.state.changed"));

    manager.stop_all().await.unwrap();
    bus.shutdown().await;
}

async fn ask(bus: &MessageBus, topic: &str, payload: Value, priority: Priority) -> Value {
    let reply = bus
        .request(
            Message::request(topic, "test-client", payload).with_priority(priority),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    reply.payload.clone()
}

#[tokio::test]
async fn test_resource_agent_allocates_against_capacity() {
    let manager = new_manager();
    let bus = manager.bus().clone();
    let resources = Arc::new(agent_manager::agents::ResourceAgent::new());
    let log = EventLog::default();
    manager
        .register(
            AgentDescriptor::new("resource")
                .with_config_value("capacities", json!({"gpu": 2.0, "cpu": 100.0}))
                .with_config_value("reserved_percent", json!({"cpu": 10.0})),
            resources.clone(),
        )
        .unwrap();
    manager
        .register(AgentDescriptor::new("hardware"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();
    manager.start_all().await.unwrap();
    let mut released = collect(&bus, "resource.released");

    let granted = ask(&bus, "resource.request", json!({"resource": "gpu", "amount": 2.0}), Priority::Normal).await;
    assert_eq!(granted["granted"], true);
    assert_eq!(granted["allocation"]["granted"], 2.0);

    let denied = ask(&bus, "resource.request", json!({"resource": "gpu", "amount": 1.0}), Priority::Normal).await;
    assert_eq!(denied["granted"], false);
    assert!(denied["reason"].as_str().unwrap().contains("insufficient capacity"));

    let unknown = ask(&bus, "resource.request", json!({"resource": "disk", "amount": 1.0}), Priority::Normal).await;
    assert_eq!(unknown["granted"], false);

    // Only critical requests reach the reserve
    let normal = ask(&bus, "resource.request", json!({"resource": "cpu", "amount": 95.0}), Priority::Normal).await;
    assert_eq!(normal["granted"], false);
    let critical = ask(&bus, "resource.request", json!({"resource": "cpu", "amount": 95.0}), Priority::Critical).await;
    assert_eq!(critical["granted"], true);

    let id = granted["allocation"]["id"].clone();
    let release = ask(&bus, "resource.release", json!({"allocationId": id.clone()}), Priority::Normal).await;
    assert_eq!(release["released"], true);
    let again = ask(&bus, "resource.release", json!({"allocationId": id}), Priority::Normal).await;
    assert_eq!(again["released"], false);
    assert!(next_within(&mut released, 500).await.is_some());

    let status = ask(&bus, "resource.status", json!({}), Priority::Normal).await;
    assert_eq!(status["resources"]["gpu"]["available"], 2.0);
    assert_eq!(status["resources"]["cpu"]["allocationCount"], 1);

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_resource_agent_releases_allocations_of_stopped_agent() {
    let manager = new_manager();
    let bus = manager.bus().clone();
    let resources = Arc::new(agent_manager::agents::ResourceAgent::new());
    let log = EventLog::default();
    manager
        .register(
            AgentDescriptor::new("resource").with_config_value("capacities", json!({"gpu": 1.0})),
            resources.clone(),
        )
        .unwrap();
    manager
        .register(AgentDescriptor::new("hardware"), Arc::new(ScriptedAgent::new(&log)))
        .unwrap();
    manager.start_all().await.unwrap();

    let granted = ask(
        &bus,
        "resource.request",
        json!({"resource": "gpu", "amount": 1.0, "requester": "hardware"}),
        Priority::Normal,
    )
    .await;
    assert_eq!(granted["granted"], true);
    assert_eq!(resources.allocations().len(), 1);

    manager.stop_agent("hardware").await.unwrap();

    let freed = eventually(1_000, || resources.allocations().is_empty()).await;
    assert!(freed, "allocations left: {:?}", resources.allocations());

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_audit_trail_is_bounded() {
    let manager = new_manager();
    let audit = Arc::new(agent_manager::agents::AuditAgent::new());
    manager
        .register(
            AgentDescriptor::new("audit").with_config_value("capacity", json!(2)),
            audit.clone(),
        )
        .unwrap();
    manager.start_all().await.unwrap();

    for code in ["E1", "E2", "E3"] {
        manager
            .bus()
            .publish(Message::new(ALERT_TOPIC, "hardware", json!({ "code": code })))
            .unwrap();
    }

    let trimmed = eventually(1_000, || {
        audit.entries().last().map(|e| e.payload["code"] == "E3").unwrap_or(false)
    })
    .await;
    assert!(trimmed);
    let codes: Vec<Value> = audit.entries().iter().map(|e| e.payload["code"].clone()).collect();
    assert_eq!(codes, vec![json!("E2"), json!("E3")]);

    manager.stop_all().await.unwrap();
}
