//! Component backups taken before an update is applied.
//!
//! The update coordinator only needs `store(snapshot) -> ref` and
//! `restore(ref) -> snapshot`; stores also support listing and pruning so a
//! retention policy can bound disk usage. Backups are immutable once
//! written.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

mod file;
mod memory;


pub(crate) use file::storage_key;
pub use file::FileBackupStore;
pub use memory::MemoryBackupStore;

/// Captured state of a component at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentSnapshot {
    pub component: String,
    pub version: String,
    /// Component-defined state, opaque to the store
    pub state: Value,
    pub taken_at: DateTime<Utc>,
}

impl ComponentSnapshot {
    pub fn new(component: impl Into<String>, version: impl Into<String>, state: Value) -> Self {
        Self {
            component: component.into(),
            version: version.into(),
            state,
            taken_at: Utc::now(),
        }
    }
}

/// Pointer to a stored backup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRef {
    pub id: Uuid,
    pub component: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// Store-specific location (file path, memory key)
    pub location: String,
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persists a snapshot and returns a reference to it.
    async fn store(&self, snapshot: &ComponentSnapshot) -> Result<BackupRef>;

    /// Loads the snapshot behind `backup`.
    async fn restore(&self, backup: &BackupRef) -> Result<ComponentSnapshot>;

    /// Backups for `component`, oldest first.
    async fn list(&self, component: &str) -> Result<Vec<BackupRef>>;

    /// Deletes the oldest backups of `component`, keeping the newest `keep`.
    /// Returns how many were deleted.
    async fn prune(&self, component: &str, keep: usize) -> Result<usize>;
}
