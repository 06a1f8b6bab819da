use crate::manager::lock;
use crate::{Agent, AgentContext};
use agentbus::{handler_fn, Message, MessageKind, Priority};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const AUDIT_AGENT: &str = "audit";

const DEFAULT_CAPACITY: usize = 256;

/// Topics the audit agent records.
pub const AUDITED_TOPICS: [&str; 3] = ["system.alert", "update.**", "agent.state.changed"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub topic: String,
    pub sender: String,
    pub priority: Priority,
    pub recorded_at: DateTime<Utc>,
    pub payload: Value,
}

impl AuditEntry {
    fn from_message(message: &Message) -> Self {
        Self {
            topic: message.topic.clone(),
            sender: message.sender.clone(),
            priority: message.priority,
            recorded_at: Utc::now(),
            payload: message.payload.clone(),
        }
    }
}

/// Bounded in-memory trail of alerts, update events and state changes.
///
/// Answers `audit.recent` requests with the newest entries, oldest first.
/// The request payload may carry `limit` (default: all retained entries).
/// Capacity comes from the `capacity` config key.
#[derive(Default)]
pub struct AuditAgent {
    entries: Arc<Mutex<VecDeque<AuditEntry>>>,
}

impl AuditAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).iter().cloned().collect()
    }
}

#[async_trait]
impl Agent for AuditAgent {
    async fn start(&self, ctx: &AgentContext) -> Result<()> {
        let capacity = ctx
            .config_value::<usize>("capacity")
            .unwrap_or(DEFAULT_CAPACITY)
            .max(1);

        for pattern in AUDITED_TOPICS {
            let entries = Arc::clone(&self.entries);
            ctx.subscribe(
                pattern,
                handler_fn(move |msg, _ctx| {
                    let entries = Arc::clone(&entries);
                    async move {
                        let mut entries = lock(&entries);
                        if entries.len() >= capacity {
                            entries.pop_front();
                        }
                        entries.push_back(AuditEntry::from_message(&msg));
                        Ok(())
                    }
                }),
            )?;
        }

        let entries = Arc::clone(&self.entries);
        ctx.subscribe(
            "audit.recent",
            handler_fn(move |msg, dctx| {
                let entries = Arc::clone(&entries);
                async move {
                    if msg.kind != MessageKind::Request {
                        return Ok(());
                    }
                    let recent: Vec<AuditEntry> = {
                        let entries = lock(&entries);
                        let limit = msg
                            .payload
                            .get("limit")
                            .and_then(Value::as_u64)
                            .map_or(entries.len(), |l| l as usize);
                        let skip = entries.len().saturating_sub(limit);
                        entries.iter().skip(skip).cloned().collect()
                    };
                    dctx.reply(&msg, json!({ "entries": recent }))?;
                    Ok(())
                }
            }),
        )?;

        Ok(())
    }
}
