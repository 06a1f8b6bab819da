use super::{UpdatePackage, UpdateRecord};
use crate::backup::storage_key;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// A staged update waiting for the next controlled restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub record: UpdateRecord,
    pub package: UpdatePackage,
    pub staged_at: DateTime<Utc>,
}

enum Backend {
    Directory(PathBuf),
    Memory(DashMap<String, PendingUpdate>),
}

/// The pending-update location: at most one staged update per component.
pub struct PendingStore {
    backend: Backend,
}

impl PendingStore {
    /// Stores one `{key}.pending.json` file per staged update, so they
    /// survive a process restart.
    pub fn in_directory(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("Failed to create pending update directory")?;
        Ok(Self {
            backend: Backend::Directory(dir),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(DashMap::new()),
        }
    }

    pub fn put(&self, update: &PendingUpdate) -> Result<()> {
        match &self.backend {
            Backend::Directory(dir) => {
                let path = dir.join(file_name(&update.record.component));
                let tmp_path = path.with_extension("tmp");
                let json = serde_json::to_vec_pretty(update)
                    .context("Failed to serialize pending update")?;

                {
                    let mut file = File::create(&tmp_path)
                        .context("Failed to create temporary pending update file")?;
                    file.write_all(&json)
                        .context("Failed to write pending update")?;
                    file.sync_all()
                        .context("Failed to sync pending update to disk")?;
                }

                fs::rename(&tmp_path, &path)
                    .context("Failed to rename temporary pending update file")?;
            }
            Backend::Memory(map) => {
                map.insert(update.record.component.clone(), update.clone());
            }
        }
        Ok(())
    }

    pub fn get(&self, component: &str) -> Result<Option<PendingUpdate>> {
        match &self.backend {
            Backend::Directory(dir) => {
                let path = dir.join(file_name(component));
                if !path.exists() {
                    return Ok(None);
                }
                let bytes = fs::read(&path).context("Failed to read pending update")?;
                let update: PendingUpdate = serde_json::from_slice(&bytes)
                    .context("Failed to deserialize pending update")?;
                if update.record.component != component {
                    warn!(
                        path = %path.display(),
                        expected = %component,
                        found = %update.record.component,
                        "Pending update belongs to another component, ignoring"
                    );
                    return Ok(None);
                }
                Ok(Some(update))
            }
            Backend::Memory(map) => Ok(map.get(component).map(|entry| entry.value().clone())),
        }
    }

    pub fn contains(&self, component: &str) -> bool {
        match &self.backend {
            Backend::Directory(_) => matches!(self.get(component), Ok(Some(_))),
            Backend::Memory(map) => map.contains_key(component),
        }
    }

    /// Returns whether an entry was removed.
    pub fn remove(&self, component: &str) -> Result<bool> {
        match &self.backend {
            Backend::Directory(dir) => {
                let path = dir.join(file_name(component));
                if !path.exists() {
                    return Ok(false);
                }
                fs::remove_file(&path).context("Failed to remove pending update")?;
                Ok(true)
            }
            Backend::Memory(map) => Ok(map.remove(component).is_some()),
        }
    }

    /// All staged updates, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<PendingUpdate>> {
        let mut updates = match &self.backend {
            Backend::Directory(dir) => {
                let entries = fs::read_dir(dir).context("Failed to read pending update directory")?;
                let mut updates = Vec::new();
                for entry in entries {
                    let entry = entry.context("Failed to read directory entry")?;
                    let path = entry.path();
                    let is_pending = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map_or(false, |n| n.ends_with(".pending.json"));
                    if !is_pending {
                        continue;
                    }

                    match fs::read(&path)
                        .context("Failed to read pending update")
                        .and_then(|bytes| {
                            serde_json::from_slice::<PendingUpdate>(&bytes)
                                .context("Failed to deserialize pending update")
                        }) {
                        Ok(update) => updates.push(update),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unreadable pending update");
                        }
                    }
                }
                updates
            }
            Backend::Memory(map) => map.iter().map(|entry| entry.value().clone()).collect(),
        };

        updates.sort_by_key(|u| u.staged_at);
        Ok(updates)
    }
}

fn file_name(component: &str) -> String {
    format!("{}.pending.json", storage_key(component))
}
