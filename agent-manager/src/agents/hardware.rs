use crate::manager::lock;
use crate::{Agent, AgentContext};
use agentbus::{handler_fn, MessageKind, Priority};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use tracing::info;

pub const HARDWARE_AGENT: &str = "hardware";

/// A device announced by the hardware agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Announces configured devices and answers inventory queries.
///
/// # Config
/// `devices = [{ id = "gpu0", kind = "gpu", properties = { ... } }]`
///
/// # Topics
/// - publishes `hardware.detected` once per device on start
/// - answers `hardware.query` requests with `{"devices": [...]}`, filtered
///   by `kind` or `id` when the request payload names one
#[derive(Default)]
pub struct HardwareAgent {
    devices: Arc<Mutex<Vec<Device>>>,
}

impl HardwareAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(&self) -> Vec<Device> {
        lock(&self.devices).clone()
    }
}

#[async_trait]
impl Agent for HardwareAgent {
    async fn start(&self, ctx: &AgentContext) -> Result<()> {
        let devices: Vec<Device> = match ctx.config().get("devices") {
            Some(value) => serde_json::from_value(value.clone())
                .context("Invalid 'devices' configuration")?,
            None => Vec::new(),
        };

        for device in &devices {
            ctx.publish_with_priority(
                "hardware.detected",
                json!({ "device": device }),
                Priority::High,
            )?;
        }
        info!(agent = %ctx.name(), devices = devices.len(), "Hardware inventory announced");
        *lock(&self.devices) = devices;

        let inventory = Arc::clone(&self.devices);
        ctx.subscribe(
            "hardware.query",
            handler_fn(move |msg, dctx| {
                let inventory = Arc::clone(&inventory);
                async move {
                    if msg.kind != MessageKind::Request {
                        return Ok(());
                    }
                    let kind = msg.payload_str("kind").map(str::to_string);
                    let id = msg.payload_str("id").map(str::to_string);
                    let devices: Vec<Device> = lock(&inventory)
                        .iter()
                        .filter(|d| kind.as_deref().map_or(true, |k| d.kind == k))
                        .filter(|d| id.as_deref().map_or(true, |i| d.id == i))
                        .cloned()
                        .collect();
                    dctx.reply(&msg, json!({ "devices": devices }))?;
                    Ok(())
                }
            }),
        )?;

        Ok(())
    }
}
