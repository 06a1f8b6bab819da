//! Trigger scheduler - publishes synthetic trigger messages.
//!
//! Agents that act periodically (update checks, audits, hardware rescans)
//! subscribe to a trigger topic instead of running their own timers, so
//! cadence lives in configuration.

use crate::bus::MessageBus;
use crate::config::TriggerConfig;
use crate::message::Message;
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Sender name on every trigger message.
pub const SCHEDULER_SENDER: &str = "scheduler";

/// Publishes one message per trigger every `interval_ms`.
///
/// # Payload
/// `{"trigger": <name>, "firedAt": <RFC 3339>, ...configured payload}`
pub struct TriggerScheduler {
    bus: MessageBus,
    triggers: Vec<TriggerConfig>,
    /// One loop per trigger
    handles: Vec<JoinHandle<()>>,
}

impl TriggerScheduler {
    pub fn new(bus: MessageBus, triggers: Vec<TriggerConfig>) -> Self {
        Self {
            bus,
            triggers,
            handles: Vec::new(),
        }
    }

    /// Spawns the trigger loops.
    ///
    /// # Returns
    /// Number of triggers started. Triggers with a zero interval or an
    /// invalid topic are skipped.
    pub fn start(&mut self) -> usize {
        for trigger in &self.triggers {
            if trigger.interval_ms == 0 {
                warn!(trigger = %trigger.name, "Skipping trigger with zero interval");
                continue;
            }
            if !crate::message::is_valid_topic(&trigger.topic) {
                warn!(trigger = %trigger.name, topic = %trigger.topic, "Skipping trigger with invalid topic");
                continue;
            }

            let bus = self.bus.clone();
            let trigger = trigger.clone();
            info!(
                trigger = %trigger.name,
                topic = %trigger.topic,
                interval_ms = trigger.interval_ms,
                "Starting trigger"
            );

            self.handles.push(tokio::spawn(async move {
                let mut interval = time::interval(trigger.interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                if !trigger.fire_immediately {
                    interval.tick().await; // consume immediate first tick
                }

                loop {
                    interval.tick().await;
                    if !bus.is_running() {
                        debug!(trigger = %trigger.name, "Bus stopped, ending trigger");
                        break;
                    }
                    fire(&bus, &trigger);
                }
            }));
        }

        self.handles.len()
    }

    /// Aborts all trigger loops.
    pub fn shutdown(&mut self) {
        let count = self.handles.len();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        if count > 0 {
            info!(trigger_count = count, "Trigger scheduler stopped");
        }
    }
}

impl Drop for TriggerScheduler {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

fn fire(bus: &MessageBus, trigger: &TriggerConfig) {
    let mut payload = trigger.payload.clone();
    payload.insert("trigger".to_string(), Value::String(trigger.name.clone()));
    payload.insert("firedAt".to_string(), Value::String(Utc::now().to_rfc3339()));

    let message = Message::new(trigger.topic.as_str(), SCHEDULER_SENDER, Value::Object(payload))
        .with_priority(trigger.priority);
    if let Err(e) = bus.publish(message) {
        warn!(trigger = %trigger.name, error = %e, "Failed to publish trigger");
    }
}
