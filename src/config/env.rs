use super::{AgentBusConfig, StoreBackend};
use std::path::PathBuf;
use tracing::warn;

/// Applies `AGENTBUS_*` environment variables on top of a loaded
/// configuration. Unparseable values are ignored.
pub fn apply_env_overrides(config: &mut AgentBusConfig) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut AgentBusConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("AGENTBUS_INGRESS_CAPACITY") {
        if let Ok(n) = v.parse::<usize>() {
            config.bus.ingress_capacity = n;
        }
    }
    if let Some(v) = lookup("AGENTBUS_REQUEST_TIMEOUT_MS") {
        if let Ok(n) = v.parse::<u64>() {
            config.bus.default_request_timeout_ms = n;
        }
    }
    if let Some(v) = lookup("AGENTBUS_HEARTBEAT_INTERVAL_MS") {
        match v.parse::<u64>() {
            Ok(n) if n > 0 => config.lifecycle.heartbeat_interval_ms = n,
            _ => warn!(value = %v, "Ignoring invalid AGENTBUS_HEARTBEAT_INTERVAL_MS"),
        }
    }
    if let Some(v) = lookup("AGENTBUS_VERIFY_TIMEOUT_MS") {
        if let Ok(n) = v.parse::<u64>() {
            config.updates.verify_timeout_ms = n;
        }
    }
    if let Some(v) = lookup("AGENTBUS_BACKUP_DIR") {
        if !v.is_empty() {
            config.backup.directory = PathBuf::from(v);
        }
    }
    if let Some(v) = lookup("AGENTBUS_BACKUP_BACKEND") {
        match v.as_str() {
            "file" => config.backup.backend = StoreBackend::File,
            "memory" => config.backup.backend = StoreBackend::Memory,
            _ => {}
        }
    }
}
