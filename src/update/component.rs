use super::UpdatePackage;
use crate::backup::ComponentSnapshot;
use crate::config::ComponentConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// A component the coordinator can update and roll back.
///
/// `snapshot` and `restore` must be inverse: restoring a snapshot brings
/// the component back to an observably equivalent state. `verify` is the
/// post-apply smoke test and is bounded by the coordinator's verification
/// timeout.
#[async_trait]
pub trait UpdatableComponent: Send + Sync {
    /// Unique component name, matched against `UpdatePackage::component`.
    fn name(&self) -> &str;

    /// Components this one depends on. Updates of related components are
    /// never in flight at the same time.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether packages can be applied to the running component.
    fn supports_hot_update(&self) -> bool {
        true
    }

    async fn version(&self) -> String;

    async fn snapshot(&self) -> Result<ComponentSnapshot>;

    async fn apply(&self, package: &UpdatePackage) -> Result<()>;

    async fn restore(&self, snapshot: &ComponentSnapshot) -> Result<()>;

    async fn verify(&self) -> Result<()>;
}

struct Document {
    version: String,
    content: Map<String, Value>,
}

/// A versioned JSON document (configuration, rule sets, model parameters)
/// updated by replacing it with the package content.
///
/// Verification passes when every required key is present.
pub struct DocumentComponent {
    name: String,
    dependencies: Vec<String>,
    hot_update: bool,
    required_keys: Vec<String>,
    document: RwLock<Document>,
}

impl DocumentComponent {
    pub fn new(name: impl Into<String>, version: impl Into<String>, content: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            hot_update: true,
            required_keys: Vec::new(),
            document: RwLock::new(Document {
                version: version.into(),
                content,
            }),
        }
    }

    pub fn from_config(config: &ComponentConfig) -> Self {
        Self::new(&config.name, &config.version, config.initial.clone())
            .with_required_keys(config.required_keys.clone())
            .with_dependencies(config.dependencies.clone())
            .with_hot_update(config.hot_update)
    }

    pub fn with_required_keys(mut self, keys: Vec<String>) -> Self {
        self.required_keys = keys;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_hot_update(mut self, hot_update: bool) -> Self {
        self.hot_update = hot_update;
        self
    }

    /// Current document contents.
    pub async fn content(&self) -> Map<String, Value> {
        self.document.read().await.content.clone()
    }
}

#[async_trait]
impl UpdatableComponent for DocumentComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn supports_hot_update(&self) -> bool {
        self.hot_update
    }

    async fn version(&self) -> String {
        self.document.read().await.version.clone()
    }

    async fn snapshot(&self) -> Result<ComponentSnapshot> {
        let document = self.document.read().await;
        Ok(ComponentSnapshot::new(
            &self.name,
            &document.version,
            Value::Object(document.content.clone()),
        ))
    }

    async fn apply(&self, package: &UpdatePackage) -> Result<()> {
        let parsed: Value = serde_json::from_slice(&package.content)
            .context("Package content is not valid JSON")?;
        let Value::Object(content) = parsed else {
            bail!("Package content must be a JSON object");
        };

        let mut document = self.document.write().await;
        document.version = package.version.clone();
        document.content = content;
        Ok(())
    }

    async fn restore(&self, snapshot: &ComponentSnapshot) -> Result<()> {
        let Value::Object(content) = &snapshot.state else {
            bail!("Snapshot state for '{}' is not a JSON object", self.name);
        };

        let mut document = self.document.write().await;
        document.version = snapshot.version.clone();
        document.content = content.clone();
        Ok(())
    }

    async fn verify(&self) -> Result<()> {
        let document = self.document.read().await;
        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .filter(|key| !document.content.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            bail!("Missing required keys: {}", missing.join(", "));
        }
        Ok(())
    }
}
