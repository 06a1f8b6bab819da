//! Update/rollback coordinator.
//!
//! Every update follows the same pipeline:
//!
//! ```text
//! stage (checksum) -> backup -> apply (hot | staged) -> verify (bounded)
//!                                  |                        |
//!                                  +-------- failure -------+--> restore backup -> RolledBack
//! ```
//!
//! Nothing is mutated before a backup exists. Failures before the backup
//! end in `Failed` with the component untouched; failures after it always
//! restore the backup and end in `RolledBack`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backup::BackupRef;

pub mod checksum;
mod component;
mod coordinator;
mod error;
mod pending;
pub mod version;


pub use component::{DocumentComponent, UpdatableComponent};
pub use coordinator::{UpdateCoordinator, COORDINATOR_SENDER};
pub use error::UpdateError;
pub use pending::{PendingStore, PendingUpdate};

/// How a package is swapped in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// Replace in the running component
    Hot,
    /// Write to the pending store; applied at the next controlled restart
    Staged,
    /// Hot when the component supports it, staged otherwise
    #[default]
    Auto,
}

/// Update urgency, used by decision policies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePriority {
    Cosmetic,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A new version of a component plus its declared integrity checksum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatePackage {
    pub component: String,
    pub version: String,
    /// Raw package bytes (base64 in JSON)
    #[serde(with = "content_base64")]
    pub content: Vec<u8>,
    /// Hex SHA-256 of `content`, optionally prefixed with `sha256:`
    pub checksum: String,
    #[serde(default)]
    pub strategy: UpdateStrategy,
    #[serde(default)]
    pub priority: UpdatePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl UpdatePackage {
    /// Builds a package whose checksum is computed from `content`.
    pub fn new(component: impl Into<String>, version: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            component: component.into(),
            version: version.into(),
            checksum: checksum::sha256_hex(&content),
            content,
            strategy: UpdateStrategy::Auto,
            priority: UpdatePriority::Medium,
            description: None,
        }
    }

    pub fn with_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_priority(mut self, priority: UpdatePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

mod content_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Staged,
    Applying,
    Applied,
    Failed,
    RolledBack,
}

impl UpdateStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Applied | UpdateStatus::Failed | UpdateStatus::RolledBack
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Checksum mismatch, nothing touched
    Integrity,
    /// Hot strategy requested for a component that cannot be replaced in place
    HotUpdateUnsupported,
    /// Snapshot or backup write failed, nothing touched
    Backup,
    /// Writing the staged package failed
    Staging,
    Apply,
    Verification,
    /// Restoring the backup failed; the component may be inconsistent
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: UpdateStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Tracks one update from staging to a terminal status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: Uuid,
    pub component: String,
    pub from_version: String,
    pub to_version: String,
    pub strategy: UpdateStrategy,
    pub priority: UpdatePriority,
    pub backup_ref: Option<BackupRef>,
    pub status: UpdateStatus,
    pub failure: Option<UpdateFailure>,
    pub history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UpdateRecord {
    pub(crate) fn new(package: &UpdatePackage, from_version: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            component: package.component.clone(),
            from_version,
            to_version: package.version.clone(),
            strategy: package.strategy,
            priority: package.priority,
            backup_ref: None,
            status: UpdateStatus::Staged,
            failure: None,
            history: vec![StatusChange {
                status: UpdateStatus::Staged,
                at: now,
                note: None,
            }],
            created_at: now,
            finished_at: None,
        }
    }

    pub(crate) fn transition(&mut self, status: UpdateStatus, note: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.history.push(StatusChange {
            status,
            at: now,
            note,
        });
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Statuses visited so far, in order.
    pub fn statuses(&self) -> Vec<UpdateStatus> {
        self.history.iter().map(|change| change.status).collect()
    }
}
