use super::{BackupRef, BackupStore, ComponentSnapshot};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// In-process backup store, for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryBackupStore {
    backups: DashMap<Uuid, StoredBackup>,
    sequence: AtomicU64,
}

struct StoredBackup {
    seq: u64,
    backup: BackupRef,
    snapshot: ComponentSnapshot,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn store(&self, snapshot: &ComponentSnapshot) -> Result<BackupRef> {
        let id = Uuid::now_v7();
        let backup = BackupRef {
            id,
            component: snapshot.component.clone(),
            version: snapshot.version.clone(),
            created_at: Utc::now(),
            location: format!("memory:{}", id),
        };
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.backups.insert(
            id,
            StoredBackup {
                seq,
                backup: backup.clone(),
                snapshot: snapshot.clone(),
            },
        );
        Ok(backup)
    }

    async fn restore(&self, backup: &BackupRef) -> Result<ComponentSnapshot> {
        self.backups
            .get(&backup.id)
            .map(|entry| entry.snapshot.clone())
            .ok_or_else(|| anyhow!("Backup {} not found", backup.id))
    }

    async fn list(&self, component: &str) -> Result<Vec<BackupRef>> {
        let mut backups: Vec<(u64, BackupRef)> = self
            .backups
            .iter()
            .filter(|entry| entry.backup.component == component)
            .map(|entry| (entry.seq, entry.backup.clone()))
            .collect();
        backups.sort_by_key(|(seq, _)| *seq);
        Ok(backups.into_iter().map(|(_, backup)| backup).collect())
    }

    async fn prune(&self, component: &str, keep: usize) -> Result<usize> {
        let backups = self.list(component).await?;
        if backups.len() <= keep {
            return Ok(0);
        }

        let delete_count = backups.len() - keep;
        for backup in &backups[..delete_count] {
            self.backups.remove(&backup.id);
        }
        Ok(delete_count)
    }
}
