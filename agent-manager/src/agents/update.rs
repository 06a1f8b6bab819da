//! Update agents.
//!
//! ```text
//! schedule.update-check ──► UpdateProposerAgent ──update.status──► UpdateApplierAgent
//!                             │  UpdateSource                        │
//!                             │  DecisionPolicy                      │
//!                             └──────────update.request─────────────►└─► UpdateCoordinator
//! ```
//!
//! The proposer never touches the coordinator directly; it only talks to
//! the applier over the bus.

use crate::{Agent, AgentContext};
use agentbus::policy::{Decision, DecisionPolicy, Observation};
use agentbus::update::version::is_newer;
use agentbus::update::{UpdateCoordinator, UpdatePackage};
use agentbus::{handler_fn, MessageKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const UPDATE_APPLIER_AGENT: &str = "update-applier";
pub const UPDATE_PROPOSER_AGENT: &str = "update-proposer";

pub const UPDATE_REQUEST_TOPIC: &str = "update.request";
pub const UPDATE_STATUS_TOPIC: &str = "update.status";
pub const UPDATE_CHECK_TOPIC: &str = "schedule.update-check";

/// Owns the update coordinator on the bus.
///
/// On start, applies every staged update (this start is the controlled
/// restart staged updates wait for). Then answers:
/// - `update.request` with `{"ok": true, "record": ...}` or
///   `{"ok": false, "error": "..."}`; the payload is an `UpdatePackage`
/// - `update.status` with `{"versions": {...}, "inFlight": {...}}`
pub struct UpdateApplierAgent {
    coordinator: UpdateCoordinator,
}

impl UpdateApplierAgent {
    pub fn new(coordinator: UpdateCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Agent for UpdateApplierAgent {
    async fn start(&self, ctx: &AgentContext) -> Result<()> {
        let applied = self
            .coordinator
            .apply_all_pending()
            .await
            .context("Failed to apply staged updates")?;
        if !applied.is_empty() {
            info!(agent = %ctx.name(), count = applied.len(), "Applied staged updates");
        }

        let coordinator = self.coordinator.clone();
        let owner = ctx.clone();
        ctx.subscribe(
            UPDATE_REQUEST_TOPIC,
            handler_fn(move |msg, dctx| {
                let coordinator = coordinator.clone();
                let owner = owner.clone();
                async move {
                    if msg.kind != MessageKind::Request {
                        return Ok(());
                    }
                    // Verification can take a while; keep this subscription free.
                    owner.spawn(async move {
                        let reply = match msg.decode_payload::<UpdatePackage>() {
                            Ok(package) => match coordinator.submit(package).await {
                                Ok(record) => json!({ "ok": true, "record": record }),
                                Err(e) => json!({ "ok": false, "error": e.to_string() }),
                            },
                            Err(e) => json!({ "ok": false, "error": format!("invalid package: {}", e) }),
                        };
                        if let Err(e) = dctx.reply(&msg, reply) {
                            warn!(error = %e, "Failed to reply to update request");
                        }
                    });
                    Ok(())
                }
            }),
        )?;

        let coordinator = self.coordinator.clone();
        ctx.subscribe(
            UPDATE_STATUS_TOPIC,
            handler_fn(move |msg, dctx| {
                let coordinator = coordinator.clone();
                async move {
                    if msg.kind != MessageKind::Request {
                        return Ok(());
                    }
                    let versions = coordinator.versions().await;
                    let in_flight = coordinator.in_flight();
                    dctx.reply(&msg, json!({ "versions": versions, "inFlight": in_flight }))?;
                    Ok(())
                }
            }),
        )?;

        Ok(())
    }
}

/// Where the proposer looks for new packages.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    fn name(&self) -> &str;

    async fn available(&self) -> Result<Vec<UpdatePackage>>;
}

/// Packages held in memory.
pub struct StaticSource {
    packages: Vec<UpdatePackage>,
}

impl StaticSource {
    pub fn new(packages: Vec<UpdatePackage>) -> Self {
        Self { packages }
    }
}

#[async_trait]
impl UpdateSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn available(&self) -> Result<Vec<UpdatePackage>> {
        Ok(self.packages.clone())
    }
}

/// Reads `*.json` package files from a drop directory. Unreadable files
/// are skipped.
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl UpdateSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    async fn available(&self) -> Result<Vec<UpdatePackage>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read update directory {}", self.dir.display()))?;

        let mut packages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("Failed to read directory entry")?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let parsed = tokio::fs::read(&path)
                .await
                .context("Failed to read package file")
                .and_then(|bytes| {
                    serde_json::from_slice::<UpdatePackage>(&bytes)
                        .context("Failed to parse package file")
                });
            match parsed {
                Ok(package) => packages.push(package),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping package file"),
            }
        }

        packages.sort_by(|a, b| a.component.cmp(&b.component).then(a.version.cmp(&b.version)));
        Ok(packages)
    }
}

/// Outcome of one update check, per package.
#[derive(Clone, Debug, PartialEq)]
pub enum Proposal {
    Submitted { component: String, version: String, status: Value },
    Skipped { component: String, version: String, reason: String },
}

/// Periodically proposes updates to the applier.
///
/// On each `schedule.update-check` trigger: asks its [`UpdateSource`] for
/// packages, drops those not newer than the running version (from
/// `update.status`), asks the [`DecisionPolicy`] about the rest and sends
/// approved ones as `update.request`. Results are published on
/// `update.proposal`.
pub struct UpdateProposerAgent {
    source: Arc<dyn UpdateSource>,
    policy: Arc<dyn DecisionPolicy>,
    request_timeout: Duration,
    /// Held while a check runs; overlapping triggers are skipped
    checking: Arc<Mutex<()>>,
}

impl UpdateProposerAgent {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        policy: Arc<dyn DecisionPolicy>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            source,
            policy,
            request_timeout,
            checking: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl Agent for UpdateProposerAgent {
    async fn start(&self, ctx: &AgentContext) -> Result<()> {
        let source = Arc::clone(&self.source);
        let policy = Arc::clone(&self.policy);
        let checking = Arc::clone(&self.checking);
        let timeout = self.request_timeout;
        let owner = ctx.clone();

        ctx.subscribe(
            UPDATE_CHECK_TOPIC,
            handler_fn(move |_msg, _dctx| {
                let source = Arc::clone(&source);
                let policy = Arc::clone(&policy);
                let checking = Arc::clone(&checking);
                let owner = owner.clone();
                async move {
                    let spawner = owner.clone();
                    spawner.spawn(async move {
                        let Ok(_running) = checking.try_lock() else {
                            debug!(agent = %owner.name(), "Update check already running, skipping trigger");
                            return;
                        };
                        match check_for_updates(&owner, source.as_ref(), policy.as_ref(), timeout).await {
                            Ok(proposals) => {
                                debug!(agent = %owner.name(), proposals = proposals.len(), "Update check finished");
                            }
                            Err(e) => warn!(agent = %owner.name(), error = %e, "Update check failed"),
                        }
                    });
                    Ok(())
                }
            }),
        )?;

        info!(
            agent = %ctx.name(),
            source = %self.source.name(),
            policy = %self.policy.name(),
            "Update proposer ready"
        );
        Ok(())
    }
}

/// Runs one update check.
pub async fn check_for_updates(
    ctx: &AgentContext,
    source: &dyn UpdateSource,
    policy: &dyn DecisionPolicy,
    timeout: Duration,
) -> Result<Vec<Proposal>> {
    let packages = source.available().await?;
    if packages.is_empty() {
        return Ok(Vec::new());
    }

    let status = ctx.request(UPDATE_STATUS_TOPIC, json!({}), timeout).await?;
    let versions: BTreeMap<String, String> = serde_json::from_value(status.payload["versions"].clone())
        .map_err(|e| anyhow!("Malformed update status reply: {}", e))?;

    let mut proposals = Vec::with_capacity(packages.len());
    for package in packages {
        let proposal = propose(ctx, policy, &versions, package, timeout).await;
        if let Err(e) = ctx.publish("update.proposal", proposal_payload(&proposal)) {
            debug!(error = %e, "Proposal not published");
        }
        proposals.push(proposal);
    }
    Ok(proposals)
}

async fn propose(
    ctx: &AgentContext,
    policy: &dyn DecisionPolicy,
    versions: &BTreeMap<String, String>,
    package: UpdatePackage,
    timeout: Duration,
) -> Proposal {
    let skip = |package: &UpdatePackage, reason: String| Proposal::Skipped {
        component: package.component.clone(),
        version: package.version.clone(),
        reason,
    };

    let Some(current) = versions.get(&package.component) else {
        return skip(&package, "unknown component".to_string());
    };
    if !is_newer(&package.version, current) {
        return skip(&package, format!("not newer than running version {}", current));
    }

    let observation = Observation::new("update.available", package.component.as_str())
        .with_priority(package.priority)
        .with_fact("version", json!(package.version))
        .with_fact("currentVersion", json!(current));

    match policy.decide(&observation).await {
        Decision::Proceed | Decision::Act { .. } => {}
        Decision::Defer { reason } => return skip(&package, format!("deferred: {}", reason)),
        Decision::Reject { reason } => return skip(&package, format!("rejected: {}", reason)),
    }

    info!(
        component = %package.component,
        version = %package.version,
        current = %current,
        "Proposing update"
    );

    let component = package.component.clone();
    let version = package.version.clone();
    let payload = match serde_json::to_value(&package) {
        Ok(payload) => payload,
        Err(e) => return skip(&package, format!("package not serializable: {}", e)),
    };

    match ctx.request(UPDATE_REQUEST_TOPIC, payload, timeout).await {
        Ok(reply) if reply.payload["ok"] == json!(true) => Proposal::Submitted {
            component,
            version,
            status: reply.payload["record"]["status"].clone(),
        },
        Ok(reply) => Proposal::Skipped {
            component,
            version,
            reason: reply.payload["error"].as_str().unwrap_or("refused").to_string(),
        },
        Err(e) => Proposal::Skipped {
            component,
            version,
            reason: e.to_string(),
        },
    }
}

fn proposal_payload(proposal: &Proposal) -> Value {
    match proposal {
        Proposal::Submitted { component, version, status } => json!({
            "component": component,
            "version": version,
            "submitted": true,
            "status": status,
        }),
        Proposal::Skipped { component, version, reason } => json!({
            "component": component,
            "version": version,
            "submitted": false,
            "reason": reason,
        }),
    }
}
