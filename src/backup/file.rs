use super::{BackupRef, BackupStore, ComponentSnapshot};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

/// On-disk layout of a single backup file.
#[derive(Serialize, Deserialize)]
struct BackupFile {
    backup: BackupRef,
    snapshot: ComponentSnapshot,
}

/// Stores backups as gzip-compressed JSON files, one directory per
/// component:
///
/// `{root}/{key}/backup-{timestamp}-v{version}-{id}.json.gz`, where `key`
/// is `storage_key` of the component name.
pub struct FileBackupStore {
    root: PathBuf,
}

impl FileBackupStore {
    /// Creates the store, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).context("Failed to create backup directory")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn component_dir(&self, component: &str) -> PathBuf {
        self.root.join(storage_key(component))
    }

    /// Lexicographically sortable by creation time.
    fn backup_path(&self, backup: &BackupRef) -> PathBuf {
        let timestamp = backup.created_at.format("%Y%m%dT%H%M%S%.6fZ");
        let filename = format!(
            "backup-{}-v{}-{}.json.gz",
            timestamp,
            sanitize(&backup.version),
            backup.id.simple()
        );
        self.component_dir(&backup.component).join(filename)
    }

    /// Backup files for `component`, oldest first.
    fn list_files(&self, component: &str) -> Result<Vec<PathBuf>> {
        let dir = self.component_dir(component);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).context("Failed to read backup directory")?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.context("Failed to read directory entry")?;
            let path = entry.path();

            if path.is_file() {
                if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                    if filename.starts_with("backup-") && filename.ends_with(".json.gz") {
                        files.push(path);
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl BackupStore for FileBackupStore {
    async fn store(&self, snapshot: &ComponentSnapshot) -> Result<BackupRef> {
        let mut backup = BackupRef {
            id: Uuid::now_v7(),
            component: snapshot.component.clone(),
            version: snapshot.version.clone(),
            created_at: Utc::now(),
            location: String::new(),
        };
        let path = self.backup_path(&backup);
        backup.location = path.display().to_string();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create component backup directory")?;
        }

        let file = BackupFile {
            backup: backup.clone(),
            snapshot: snapshot.clone(),
        };
        save_to_file(&file, &path)?;

        info!(
            component = %backup.component,
            version = %backup.version,
            path = %path.display(),
            "Backup saved"
        );

        Ok(backup)
    }

    async fn restore(&self, backup: &BackupRef) -> Result<ComponentSnapshot> {
        let path = PathBuf::from(&backup.location);
        let file = load_from_file(&path)
            .with_context(|| format!("Failed to load backup {}", backup.id))?;

        if file.backup.id != backup.id {
            bail!(
                "Backup file {} holds backup {}, expected {}",
                path.display(),
                file.backup.id,
                backup.id
            );
        }

        Ok(file.snapshot)
    }

    async fn list(&self, component: &str) -> Result<Vec<BackupRef>> {
        let mut backups = Vec::new();
        for path in self.list_files(component)? {
            match load_from_file(&path) {
                Ok(file) => backups.push(file.backup),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Corrupt backup, skipping");
                }
            }
        }
        Ok(backups)
    }

    async fn prune(&self, component: &str, keep: usize) -> Result<usize> {
        let files = self.list_files(component)?;
        if files.len() <= keep {
            return Ok(0);
        }

        let delete_count = files.len() - keep;
        let mut deleted = 0;

        for path in &files[..delete_count] {
            if let Err(e) = fs::remove_file(path) {
                error!(error = %e, path = %path.display(), "Failed to delete old backup");
            } else {
                info!(path = %path.display(), "Deleted old backup");
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

/// Writes compressed JSON atomically: `.tmp` file, fsync, rename.
fn save_to_file(file: &BackupFile, path: &Path) -> Result<()> {
    let json = serde_json::to_string(file).context("Failed to serialize backup to JSON")?;

    let tmp_path = path.with_extension("tmp");

    {
        let tmp_file =
            File::create(&tmp_path).context("Failed to create temporary backup file")?;

        let mut encoder = GzEncoder::new(tmp_file, Compression::default());
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write compressed backup data")?;

        let file = encoder.finish().context("Failed to finish compression")?;

        file.sync_all()
            .context("Failed to sync backup file to disk")?;
    }

    fs::rename(&tmp_path, path).context("Failed to rename temporary backup file")?;

    Ok(())
}

fn load_from_file(path: &Path) -> Result<BackupFile> {
    let file = File::open(path).context("Failed to open backup file")?;

    let mut decoder = GzDecoder::new(file);
    let mut json = String::new();
    decoder
        .read_to_string(&mut json)
        .context("Failed to decompress backup file")?;

    serde_json::from_str(&json).context("Failed to deserialize backup JSON")
}

/// Portable, collision-free file key for a component name: the sanitized
/// name followed by a SHA-256 prefix of the raw name, so `net.driver` and
/// `net_driver` never share a file.
pub(crate) fn storage_key(name: &str) -> String {
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    format!("{}-{}", sanitize(name), &digest[..16])
}

/// Keeps file names portable: anything outside `[A-Za-z0-9._-]` becomes `_`.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.chars().all(|c| c == '.') {
        return cleaned.replace('.', "_");
    }
    cleaned
}
