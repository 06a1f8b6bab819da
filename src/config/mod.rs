pub mod env;
pub use env::apply_env_overrides;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::Priority;

/// Complete agentbus configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentBusConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub updates: UpdateConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Per-agent settings keyed by agent name
    #[serde(default)]
    pub agents: HashMap<String, AgentSettings>,
}

/// Message bus limits
#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Bounded ingress queue; publishes beyond it fail with backpressure
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,
    /// Pending deliveries per subscription before new messages are dropped
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
    /// Upper bound applied to every request timeout
    #[serde(default = "default_max_request_timeout_ms")]
    pub max_request_timeout_ms: u64,
}

fn default_ingress_capacity() -> usize {
    1024
}

fn default_subscriber_queue_capacity() -> usize {
    1024
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_request_timeout_ms() -> u64 {
    60_000
}

impl BusConfig {
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    pub fn max_request_timeout(&self) -> Duration {
        Duration::from_millis(self.max_request_timeout_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: default_ingress_capacity(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            default_request_timeout_ms: default_request_timeout_ms(),
            max_request_timeout_ms: default_max_request_timeout_ms(),
        }
    }
}

/// Agent lifecycle and health monitoring
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before an agent is marked failed
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    /// Time each agent gets to finish in-flight work when stopping
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Upper bound for a single `Agent::start` call
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// Restart policy for agents without their own
    #[serde(default)]
    pub restart: RestartConfig,
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_start_timeout_ms() -> u64 {
    10_000
}

impl LifecycleConfig {
    /// Never zero: a zero setting is treated as 1 ms.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            stop_grace_ms: default_stop_grace_ms(),
            start_timeout_ms: default_start_timeout_ms(),
            restart: RestartConfig::default(),
        }
    }
}

/// Bounded restarts with exponential backoff
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_restarts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Update coordinator settings
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    /// Post-apply verification deadline; exceeding it triggers rollback
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Components managed by the coordinator in the daemon
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

fn default_verify_timeout_ms() -> u64 {
    30_000
}

impl UpdateConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            verify_timeout_ms: default_verify_timeout_ms(),
            components: Vec::new(),
        }
    }
}

/// A JSON document component registered with the update coordinator
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    pub name: String,
    #[serde(default = "default_component_version")]
    pub version: String,
    /// Keys that must be present for the document to verify
    #[serde(default)]
    pub required_keys: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_hot_update")]
    pub hot_update: bool,
    #[serde(default)]
    pub initial: Map<String, Value>,
}

fn default_component_version() -> String {
    "0.0.0".to_string()
}

fn default_hot_update() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    File,
    Memory,
}

/// Backup and pending-update storage
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_backup_directory")]
    pub directory: PathBuf,
    /// Staged updates waiting for the next controlled restart
    #[serde(default = "default_pending_directory")]
    pub pending_directory: PathBuf,
    /// Backups kept per component (oldest deleted first)
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
}

fn default_backend() -> StoreBackend {
    StoreBackend::File
}

fn default_backup_directory() -> PathBuf {
    PathBuf::from("/var/lib/agentbus/backups")
}

fn default_pending_directory() -> PathBuf {
    PathBuf::from("/var/lib/agentbus/pending")
}

fn default_keep_count() -> usize {
    5
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            directory: default_backup_directory(),
            pending_directory: default_pending_directory(),
            keep_count: default_keep_count(),
        }
    }
}

/// Synthetic trigger messages
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    pub topic: String,
    pub interval_ms: u64,
    #[serde(default)]
    pub priority: Priority,
    /// Publish once right away instead of waiting a full interval
    #[serde(default)]
    pub fire_immediately: bool,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl TriggerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Settings for one agent
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Replaces the agent's built-in dependencies when set
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub restart: Option<RestartConfig>,
    /// Opaque key/value configuration handed to the agent
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            dependencies: None,
            restart: None,
            config: Map::new(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<AgentBusConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AgentBusConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    if config.lifecycle.heartbeat_interval_ms == 0 {
        bail!(
            "Invalid config file {}: lifecycle.heartbeat_interval_ms must be greater than zero",
            path.display()
        );
    }
    Ok(config)
}
