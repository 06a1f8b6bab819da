use super::{
    checksum, FailureKind, PendingStore, PendingUpdate, UpdatableComponent, UpdateError,
    UpdateFailure, UpdatePackage, UpdateRecord, UpdateStatus, UpdateStrategy,
};
use crate::backup::BackupStore;
use crate::bus::MessageBus;
use crate::config::UpdateConfig;
use crate::message::{Message, Priority};
use anyhow::anyhow;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sender name on every message the coordinator publishes.
pub const COORDINATOR_SENDER: &str = "update-coordinator";

#[derive(Clone, Copy)]
struct InFlight {
    id: Uuid,
    /// Staged and waiting for `apply_pending`
    staged: bool,
}

struct Inner {
    bus: MessageBus,
    backups: Arc<dyn BackupStore>,
    pending: PendingStore,
    verify_timeout: Duration,
    keep_backups: usize,
    components: DashMap<String, Arc<dyn UpdatableComponent>>,
    records: DashMap<Uuid, UpdateRecord>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// Runs updates through stage, backup, apply, verify and rollback.
///
/// At most one update per component is in flight. Components related by
/// a dependency (in either direction) are never updated concurrently; the
/// second request fails fast with `UpdateError::UpdateInProgress`.
///
/// `submit` only returns `Err` when the update is refused up front. Once a
/// record exists, every outcome, including integrity, apply, verification
/// and rollback failures, is reported through the returned record's
/// status and `failure`.
#[derive(Clone)]
pub struct UpdateCoordinator {
    inner: Arc<Inner>,
}

impl UpdateCoordinator {
    pub fn new(
        bus: MessageBus,
        backups: Arc<dyn BackupStore>,
        pending: PendingStore,
        config: &UpdateConfig,
        keep_backups: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                backups,
                pending,
                verify_timeout: config.verify_timeout(),
                keep_backups,
                components: DashMap::new(),
                records: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register_component(
        &self,
        component: Arc<dyn UpdatableComponent>,
    ) -> Result<(), UpdateError> {
        let name = component.name().to_string();
        if self.inner.components.contains_key(&name) {
            return Err(UpdateError::DuplicateComponent(name));
        }
        info!(component = %name, "Registered updatable component");
        self.inner.components.insert(name, component);
        Ok(())
    }

    pub fn components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .components
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Current version of every registered component.
    pub async fn versions(&self) -> BTreeMap<String, String> {
        let components: Vec<Arc<dyn UpdatableComponent>> = self
            .inner
            .components
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut versions = BTreeMap::new();
        for component in components {
            versions.insert(component.name().to_string(), component.version().await);
        }
        versions
    }

    /// Runs the update pipeline for `package`.
    ///
    /// Hot updates return a terminal record. Staged updates return a
    /// `Staged` record and keep the component locked until
    /// [`apply_pending`](Self::apply_pending) runs.
    pub async fn submit(&self, package: UpdatePackage) -> Result<UpdateRecord, UpdateError> {
        let component = self.component(&package.component)?;
        let mut record = UpdateRecord::new(&package, component.version().await);
        let mut guard = self.acquire(&package.component, record.id)?;

        info!(
            update_id = %record.id,
            component = %record.component,
            from = %record.from_version,
            to = %record.to_version,
            "Update submitted"
        );
        self.save(&record);

        if !checksum::verify(&package.content, &package.checksum) {
            return Ok(self.fail_untouched(
                record,
                FailureKind::Integrity,
                "Checksum does not match package content".to_string(),
            ));
        }

        let strategy = match (package.strategy, component.supports_hot_update()) {
            (UpdateStrategy::Hot, false) => {
                let message = format!("'{}' does not support hot updates", record.component);
                return Ok(self.fail_untouched(record, FailureKind::HotUpdateUnsupported, message));
            }
            (UpdateStrategy::Hot, true) | (UpdateStrategy::Auto, true) => UpdateStrategy::Hot,
            (UpdateStrategy::Staged, _) | (UpdateStrategy::Auto, false) => UpdateStrategy::Staged,
        };
        record.strategy = strategy;

        match self.backup(component.as_ref()).await {
            Ok(backup) => record.backup_ref = Some(backup),
            Err(e) => {
                return Ok(self.fail_untouched(record, FailureKind::Backup, format!("{:#}", e)));
            }
        }

        if strategy == UpdateStrategy::Staged {
            let pending = PendingUpdate {
                record: record.clone(),
                package,
                staged_at: Utc::now(),
            };
            if let Err(e) = self.inner.pending.put(&pending) {
                let message = format!("{:#}", e);
                return Ok(self
                    .rollback(record, component.as_ref(), FailureKind::Staging, message)
                    .await);
            }

            guard.keep();
            info!(update_id = %record.id, component = %record.component, "Update staged");
            self.announce("update.staged", &record, Priority::Normal);
            self.save(&record);
            return Ok(record);
        }

        Ok(self.apply_and_verify(record, component.as_ref(), &package).await)
    }

    /// Applies the staged update for `name`, as done at a controlled
    /// restart of the component.
    pub async fn apply_pending(&self, name: &str) -> Result<UpdateRecord, UpdateError> {
        let component = self.component(name)?;
        let pending = self
            .inner
            .pending
            .get(name)
            .map_err(UpdateError::PendingStore)?
            .filter(|pending| pending.record.component == name)
            .ok_or_else(|| UpdateError::NoPendingUpdate(name.to_string()))?;
        let _guard = self.claim_staged(name, pending.record.id)?;

        info!(update_id = %pending.record.id, component = %name, "Applying staged update");
        let record = self
            .apply_and_verify(pending.record, component.as_ref(), &pending.package)
            .await;

        if let Err(e) = self.inner.pending.remove(name) {
            warn!(component = %name, error = %e, "Failed to clear pending update");
        }
        Ok(record)
    }

    /// Applies every staged update. Components that cannot be claimed are
    /// skipped and logged.
    pub async fn apply_all_pending(&self) -> Result<Vec<UpdateRecord>, UpdateError> {
        let pending = self
            .inner
            .pending
            .list()
            .map_err(UpdateError::PendingStore)?;

        let mut records = Vec::with_capacity(pending.len());
        for update in pending {
            match self.apply_pending(&update.record.component).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(component = %update.record.component, error = %e, "Skipping staged update");
                }
            }
        }
        Ok(records)
    }

    pub fn record(&self, id: Uuid) -> Option<UpdateRecord> {
        self.inner.records.get(&id).map(|entry| entry.value().clone())
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<UpdateRecord> {
        let mut records: Vec<UpdateRecord> = self
            .inner
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Components with an update in flight, and the update holding each.
    pub fn in_flight(&self) -> HashMap<String, Uuid> {
        self.lock_in_flight()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.id))
            .collect()
    }

    pub fn pending_updates(&self) -> Result<Vec<PendingUpdate>, UpdateError> {
        self.inner.pending.list().map_err(UpdateError::PendingStore)
    }

    fn component(&self, name: &str) -> Result<Arc<dyn UpdatableComponent>, UpdateError> {
        self.inner
            .components
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| UpdateError::UnknownComponent(name.to_string()))
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn related(&self, a: &str, b: &str) -> bool {
        let depends = |from: &str, on: &str| {
            self.inner
                .components
                .get(from)
                .map_or(false, |c| c.dependencies().iter().any(|d| d == on))
        };
        depends(a, b) || depends(b, a)
    }

    /// Returns the in-flight update that blocks `name`, if any.
    fn blocker(
        &self,
        in_flight: &HashMap<String, InFlight>,
        name: &str,
    ) -> Option<(String, Uuid)> {
        in_flight
            .iter()
            .find(|(other, _)| other.as_str() != name && self.related(name, other))
            .map(|(other, entry)| (other.clone(), entry.id))
    }

    fn acquire(&self, name: &str, id: Uuid) -> Result<InFlightGuard, UpdateError> {
        // A staged update persisted by an earlier run still owns the component.
        if let Ok(Some(staged)) = self.inner.pending.get(name) {
            return Err(UpdateError::UpdateInProgress {
                component: name.to_string(),
                blocking: name.to_string(),
                active: staged.record.id,
            });
        }

        let mut in_flight = self.lock_in_flight();
        if let Some(entry) = in_flight.get(name) {
            return Err(UpdateError::UpdateInProgress {
                component: name.to_string(),
                blocking: name.to_string(),
                active: entry.id,
            });
        }
        if let Some((blocking, active)) = self.blocker(&in_flight, name) {
            return Err(UpdateError::UpdateInProgress {
                component: name.to_string(),
                blocking,
                active,
            });
        }

        in_flight.insert(name.to_string(), InFlight { id, staged: false });
        Ok(InFlightGuard::new(self.inner.clone(), name, id))
    }

    fn claim_staged(&self, name: &str, id: Uuid) -> Result<InFlightGuard, UpdateError> {
        let mut in_flight = self.lock_in_flight();
        match in_flight.get(name) {
            Some(entry) if entry.id != id || !entry.staged => {
                return Err(UpdateError::UpdateInProgress {
                    component: name.to_string(),
                    blocking: name.to_string(),
                    active: entry.id,
                });
            }
            Some(_) => {}
            None => {
                if let Some((blocking, active)) = self.blocker(&in_flight, name) {
                    return Err(UpdateError::UpdateInProgress {
                        component: name.to_string(),
                        blocking,
                        active,
                    });
                }
            }
        }

        in_flight.insert(name.to_string(), InFlight { id, staged: false });
        Ok(InFlightGuard::new(self.inner.clone(), name, id))
    }

    async fn backup(
        &self,
        component: &dyn UpdatableComponent,
    ) -> anyhow::Result<crate::backup::BackupRef> {
        let snapshot = component.snapshot().await?;
        let backup = self.inner.backups.store(&snapshot).await?;
        info!(
            component = %backup.component,
            version = %backup.version,
            location = %backup.location,
            "Backup stored"
        );

        if self.inner.keep_backups > 0 {
            match self
                .inner
                .backups
                .prune(&backup.component, self.inner.keep_backups)
                .await
            {
                Ok(0) => {}
                Ok(removed) => info!(component = %backup.component, removed, "Pruned old backups"),
                Err(e) => warn!(component = %backup.component, error = %e, "Failed to prune backups"),
            }
        }
        Ok(backup)
    }

    async fn apply_and_verify(
        &self,
        mut record: UpdateRecord,
        component: &dyn UpdatableComponent,
        package: &UpdatePackage,
    ) -> UpdateRecord {
        record.transition(UpdateStatus::Applying, None);
        self.save(&record);

        if let Err(e) = component.apply(package).await {
            let message = format!("{:#}", e);
            return self
                .rollback(record, component, FailureKind::Apply, message)
                .await;
        }

        let verified = match tokio::time::timeout(self.inner.verify_timeout, component.verify()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "Verification timed out after {}ms",
                self.inner.verify_timeout.as_millis()
            )),
        };

        match verified {
            Ok(()) => {
                record.transition(UpdateStatus::Applied, None);
                info!(
                    update_id = %record.id,
                    component = %record.component,
                    version = %record.to_version,
                    "Update applied"
                );
                self.announce("update.applied", &record, Priority::Normal);
                self.save(&record);
                record
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.rollback(record, component, FailureKind::Verification, message)
                    .await
            }
        }
    }

    async fn rollback(
        &self,
        mut record: UpdateRecord,
        component: &dyn UpdatableComponent,
        kind: FailureKind,
        message: String,
    ) -> UpdateRecord {
        warn!(
            update_id = %record.id,
            component = %record.component,
            error = %message,
            "Update failed, restoring backup"
        );
        record.failure = Some(UpdateFailure {
            kind,
            message: message.clone(),
        });
        record.transition(UpdateStatus::Failed, Some(message));
        self.save(&record);

        let restored = match &record.backup_ref {
            Some(backup) => match self.inner.backups.restore(backup).await {
                Ok(snapshot) => component.restore(&snapshot).await,
                Err(e) => Err(e),
            },
            None => Err(anyhow!("No backup recorded for update {}", record.id)),
        };

        match restored {
            Ok(()) => {
                record.transition(UpdateStatus::RolledBack, None);
                info!(
                    update_id = %record.id,
                    component = %record.component,
                    version = %record.from_version,
                    "Rolled back to previous version"
                );
                self.announce("update.failed", &record, Priority::High);
            }
            Err(e) => {
                let message = format!("Rollback failed: {:#}", e);
                error!(update_id = %record.id, component = %record.component, error = %message, "Rollback failed");
                record.failure = Some(UpdateFailure {
                    kind: FailureKind::Rollback,
                    message: message.clone(),
                });
                self.announce("update.failed", &record, Priority::High);
                self.alert(&record, &message);
            }
        }

        self.save(&record);
        record
    }

    /// Ends an update that failed before anything was changed.
    fn fail_untouched(
        &self,
        mut record: UpdateRecord,
        kind: FailureKind,
        message: String,
    ) -> UpdateRecord {
        warn!(
            update_id = %record.id,
            component = %record.component,
            error = %message,
            "Update rejected"
        );
        record.failure = Some(UpdateFailure {
            kind,
            message: message.clone(),
        });
        record.transition(UpdateStatus::Failed, Some(message));
        self.announce("update.failed", &record, Priority::High);
        self.save(&record);
        record
    }

    fn save(&self, record: &UpdateRecord) {
        self.inner.records.insert(record.id, record.clone());
    }

    fn announce(&self, topic: &str, record: &UpdateRecord, priority: Priority) {
        let payload = json!({
            "updateId": record.id,
            "component": record.component,
            "fromVersion": record.from_version,
            "toVersion": record.to_version,
            "strategy": record.strategy,
            "status": record.status,
            "failure": record.failure,
        });
        let message = Message::new(topic, COORDINATOR_SENDER, payload).with_priority(priority);
        if let Err(e) = self.inner.bus.publish(message) {
            warn!(topic = %topic, update_id = %record.id, error = %e, "Failed to publish update event");
        }
    }

    fn alert(&self, record: &UpdateRecord, message: &str) {
        let payload = json!({
            "source": COORDINATOR_SENDER,
            "reason": "rollback_failed",
            "component": record.component,
            "updateId": record.id,
            "message": message,
            "details": Value::Null,
        });
        let alert = Message::new("system.alert", COORDINATOR_SENDER, payload)
            .with_priority(Priority::Critical);
        if let Err(e) = self.inner.bus.publish(alert) {
            error!(update_id = %record.id, error = %e, "Failed to publish system alert");
        }
    }
}

/// Releases a component's in-flight slot unless kept for a staged update.
struct InFlightGuard {
    inner: Arc<Inner>,
    component: String,
    id: Uuid,
    keep: bool,
}

impl InFlightGuard {
    fn new(inner: Arc<Inner>, component: &str, id: Uuid) -> Self {
        Self {
            inner,
            component: component.to_string(),
            id,
            keep: false,
        }
    }

    fn keep(&mut self) {
        self.keep = true;
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.insert(
            self.component.clone(),
            InFlight {
                id: self.id,
                staged: true,
            },
        );
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if in_flight.get(&self.component).map_or(false, |e| e.id == self.id) {
            in_flight.remove(&self.component);
        }
    }
}
