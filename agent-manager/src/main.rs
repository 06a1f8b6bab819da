use agent_manager::registry::builtin_agents;
use agent_manager::LifecycleManager;
use agentbus::backup::{BackupStore, FileBackupStore, MemoryBackupStore};
use agentbus::config::{apply_env_overrides, load_config, AgentBusConfig, StoreBackend};
use agentbus::schedule::TriggerScheduler;
use agentbus::update::{DocumentComponent, PendingStore, UpdateCoordinator};
use agentbus::MessageBus;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_manager=info,agentbus=info".into()),
        )
        .init();

    info!("Agent Manager starting...");

    // Config path: first argument, then AGENTBUS_CONFIG, else built-in defaults
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("AGENTBUS_CONFIG").ok());

    let mut config = match &config_path {
        Some(path) => load_config(path)?,
        None => {
            info!("No config file given, using defaults");
            AgentBusConfig::default()
        }
    };
    apply_env_overrides(&mut config);

    info!(
        config_path = ?config_path,
        ingress_capacity = config.bus.ingress_capacity,
        heartbeat_interval_ms = config.lifecycle.heartbeat_interval_ms,
        backup_backend = ?config.backup.backend,
        components = config.updates.components.len(),
        triggers = config.schedule.triggers.len(),
        "Configuration loaded"
    );

    let bus = MessageBus::new(config.bus.clone());

    // Backup and pending-update stores
    let (backups, pending): (Arc<dyn BackupStore>, PendingStore) = match config.backup.backend {
        StoreBackend::File => (
            Arc::new(
                FileBackupStore::new(&config.backup.directory)
                    .context("Failed to initialize backup store")?,
            ),
            PendingStore::in_directory(&config.backup.pending_directory)
                .context("Failed to initialize pending update store")?,
        ),
        StoreBackend::Memory => {
            warn!("Using in-memory backups; they will not survive a restart");
            (Arc::new(MemoryBackupStore::new()), PendingStore::in_memory())
        }
    };

    let coordinator = UpdateCoordinator::new(
        bus.clone(),
        backups,
        pending,
        &config.updates,
        config.backup.keep_count,
    );
    for component in &config.updates.components {
        coordinator
            .register_component(Arc::new(DocumentComponent::from_config(component)))
            .with_context(|| format!("Failed to register component '{}'", component.name))?;
    }

    // Register built-in agents
    let manager = LifecycleManager::new(bus.clone(), config.lifecycle.clone());
    for (descriptor, agent) in builtin_agents(&config, coordinator.clone()) {
        manager.register(descriptor, agent)?;
    }

    manager.start_all().await.context("Failed to start agents")?;
    info!(agents = manager.states().len(), "Agents started");

    let mut scheduler = TriggerScheduler::new(bus.clone(), config.schedule.triggers.clone());
    let triggers = scheduler.start();
    info!(triggers, "Trigger scheduler started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    // Graceful shutdown
    scheduler.shutdown();
    if let Err(e) = manager.stop_all().await {
        warn!(error = %e, "Failed to stop agents cleanly");
    }
    bus.shutdown().await;
    info!("Agent manager stopped");

    Ok(())
}
