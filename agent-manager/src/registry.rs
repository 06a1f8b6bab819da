//! Agent registry - Built-in agents and their configuration.

use crate::agents::audit::AUDIT_AGENT;
use crate::agents::hardware::HARDWARE_AGENT;
use crate::agents::resource::RESOURCE_AGENT;
use crate::agents::update::{UPDATE_APPLIER_AGENT, UPDATE_PROPOSER_AGENT};
use crate::agents::{
    AuditAgent, DirectorySource, HardwareAgent, ResourceAgent, StaticSource,
    UpdateApplierAgent, UpdateProposerAgent, UpdateSource,
};
use crate::{Agent, AgentDescriptor, RestartPolicy};
use agentbus::config::{AgentBusConfig, AgentSettings};
use agentbus::policy::{AlwaysProceed, DecisionPolicy, PriorityThreshold};
use agentbus::update::{UpdateCoordinator, UpdatePriority};
use std::sync::Arc;
use tracing::{info, warn};

/// Returns the enabled built-in agents, with settings from `config.agents`
/// applied on top of their defaults.
pub fn builtin_agents(
    config: &AgentBusConfig,
    coordinator: UpdateCoordinator,
) -> Vec<(AgentDescriptor, Arc<dyn Agent>)> {
    let request_timeout = config.updates.verify_timeout() + config.bus.default_request_timeout();

    let proposer_settings = settings(config, UPDATE_PROPOSER_AGENT);
    let source: Arc<dyn UpdateSource> = match proposer_settings
        .config
        .get("source_dir")
        .and_then(|v| v.as_str())
    {
        Some(dir) => Arc::new(DirectorySource::new(dir)),
        None => Arc::new(StaticSource::new(Vec::new())),
    };
    let policy: Arc<dyn DecisionPolicy> = match proposer_settings
        .config
        .get("minimum_priority")
        .cloned()
        .map(serde_json::from_value::<UpdatePriority>)
    {
        Some(Ok(minimum)) => Arc::new(PriorityThreshold::new(minimum)),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid minimum_priority, proposing every update");
            Arc::new(AlwaysProceed)
        }
        None => Arc::new(AlwaysProceed),
    };

    let candidates: Vec<(AgentDescriptor, Arc<dyn Agent>)> = vec![
        (AgentDescriptor::new(AUDIT_AGENT), Arc::new(AuditAgent::new())),
        (AgentDescriptor::new(HARDWARE_AGENT), Arc::new(HardwareAgent::new())),
        (AgentDescriptor::new(RESOURCE_AGENT), Arc::new(ResourceAgent::new())),
        (
            AgentDescriptor::new(UPDATE_APPLIER_AGENT).with_dependency(AUDIT_AGENT),
            Arc::new(UpdateApplierAgent::new(coordinator)),
        ),
        (
            AgentDescriptor::new(UPDATE_PROPOSER_AGENT).with_dependency(UPDATE_APPLIER_AGENT),
            Arc::new(UpdateProposerAgent::new(source, policy, request_timeout)),
        ),
    ];

    let mut agents = Vec::with_capacity(candidates.len());
    for (descriptor, agent) in candidates {
        let settings = settings(config, &descriptor.name);
        if !settings.enabled {
            info!(agent = %descriptor.name, "Agent disabled by configuration");
            continue;
        }
        agents.push((apply_settings(descriptor, &settings), agent));
    }
    agents
}

fn settings(config: &AgentBusConfig, name: &str) -> AgentSettings {
    config.agents.get(name).cloned().unwrap_or_default()
}

/// Applies configured overrides to a built-in descriptor.
pub fn apply_settings(descriptor: AgentDescriptor, settings: &AgentSettings) -> AgentDescriptor {
    let mut descriptor = descriptor.with_config(settings.config.clone());
    if let Some(dependencies) = &settings.dependencies {
        descriptor.dependencies = dependencies.iter().cloned().collect();
    }
    if let Some(restart) = &settings.restart {
        descriptor.restart = Some(RestartPolicy::from(restart));
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbus::backup::MemoryBackupStore;
    use agentbus::config::{BusConfig, RestartConfig};
    use agentbus::update::PendingStore;
    use agentbus::MessageBus;
    use serde_json::{json, Map};

    fn coordinator() -> UpdateCoordinator {
        let config = AgentBusConfig::default();
        UpdateCoordinator::new(
            MessageBus::new(BusConfig::default()),
            Arc::new(MemoryBackupStore::new()),
            PendingStore::in_memory(),
            &config.updates,
            config.backup.keep_count,
        )
    }

    fn names(agents: &[(AgentDescriptor, Arc<dyn Agent>)]) -> Vec<&str> {
        agents.iter().map(|(d, _)| d.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_builtin_agents_default() {
        let agents = builtin_agents(&AgentBusConfig::default(), coordinator());
        assert_eq!(
            names(&agents),
            vec!["audit", "hardware", "resource", "update-applier", "update-proposer"]
        );
        assert!(agents[4].0.dependencies.contains("update-applier"));
    }

    #[tokio::test]
    async fn test_disabled_agent_is_skipped() {
        let mut config = AgentBusConfig::default();
        config.agents.insert(
            "hardware".to_string(),
            AgentSettings {
                enabled: false,
                ..AgentSettings::default()
            },
        );
        let agents = builtin_agents(&config, coordinator());
        assert!(!names(&agents).contains(&"hardware"));
    }

    #[test]
    fn test_settings_override_descriptor() {
        let mut config = Map::new();
        config.insert("capacity".to_string(), json!(16));
        let settings = AgentSettings {
            enabled: true,
            dependencies: Some(vec!["hardware".to_string()]),
            restart: Some(RestartConfig {
                max_restarts: 1,
                initial_backoff_ms: 5,
                max_backoff_ms: 5,
            }),
            config,
        };

        let descriptor = apply_settings(
            AgentDescriptor::new("audit").with_dependency("scheduler"),
            &settings,
        );
        assert_eq!(
            descriptor.dependencies.into_iter().collect::<Vec<_>>(),
            vec!["hardware".to_string()]
        );
        assert_eq!(descriptor.restart.unwrap().max_restarts, 1);
        assert_eq!(descriptor.config["capacity"], 16);
    }
}
