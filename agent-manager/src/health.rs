//! Heartbeats and failure recovery.
//!
//! Every running agent has a pulse task that calls `Agent::health_check`
//! each heartbeat interval and publishes `agent.heartbeat` when it passes.
//! The monitor listens for heartbeats on the bus; an agent silent for
//! `max_missed_heartbeats` intervals is marked `Failed` and restarted with
//! exponential backoff until its restart budget runs out, at which point a
//! Critical `system.alert` is published and the agent stays `Failed`.

use crate::agent::Agent;
use crate::context::AgentContext;
use crate::manager::{AgentSlot, LifecycleManager, HEARTBEAT_TOPIC, MANAGER_SENDER};
use crate::types::{AgentState, RestartPolicy};
use agentbus::{handler_fn, BusError, SubscriptionHandle};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Backoff for restart `attempt` plus up to 10% random jitter.
pub(crate) fn backoff_with_jitter(policy: &RestartPolicy, attempt: u32) -> Duration {
    let base = policy.backoff(attempt);
    let max_jitter = (base.as_millis() / 10) as u64;
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    base + Duration::from_millis(jitter)
}

/// Spawns the heartbeat loop for one run of an agent.
pub(crate) fn spawn_pulse(
    agent: Arc<dyn Agent>,
    ctx: AgentContext,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = ctx.shutdown_signal();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if ctx.is_shutting_down() {
                break;
            }

            match time::timeout(interval, agent.health_check(&ctx)).await {
                Ok(Ok(())) => {
                    let heartbeat = json!({ "agent": ctx.name(), "at": Utc::now() });
                    if let Err(e) = ctx.publish(HEARTBEAT_TOPIC, heartbeat) {
                        debug!(agent = %ctx.name(), error = %e, "Heartbeat not published");
                    }
                }
                Ok(Err(e)) => {
                    debug!(agent = %ctx.name(), error = %e, "Health check failed, heartbeat withheld");
                }
                Err(_) => {
                    debug!(agent = %ctx.name(), "Health check timed out, heartbeat withheld");
                }
            }
        }
    })
}

/// Records heartbeats into the agent state table.
pub(crate) fn subscribe_heartbeats(
    manager: &LifecycleManager,
) -> Result<SubscriptionHandle, BusError> {
    let tracker = manager.clone();
    manager.bus().subscribe(
        MANAGER_SENDER,
        HEARTBEAT_TOPIC,
        handler_fn(move |msg, _ctx| {
            let manager = tracker.clone();
            async move {
                if let Ok(slot) = manager.slot(&msg.sender) {
                    let mut status = slot.status();
                    if status.state == AgentState::Running {
                        status.last_heartbeat = Some(Utc::now());
                    }
                }
                Ok(())
            }
        }),
    )
}

/// Spawns the loop that detects missed heartbeats.
pub(crate) fn spawn_monitor(manager: LifecycleManager) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = manager.config().heartbeat_interval();
        let max_missed = manager.config().max_missed_heartbeats.max(1);
        let stale_after = interval * max_missed;

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // consume immediate first tick

        loop {
            ticker.tick().await;
            if manager.is_stopping() {
                continue;
            }

            let now = Utc::now();
            for slot in manager.slots() {
                let silent_for = {
                    let status = slot.status();
                    if status.state != AgentState::Running {
                        continue;
                    }
                    status
                        .last_heartbeat
                        .and_then(|last| (now - last).to_std().ok())
                        .unwrap_or_default()
                };

                if silent_for > stale_after {
                    let reason = format!(
                        "missed {} consecutive heartbeats ({}ms without one)",
                        max_missed,
                        silent_for.as_millis()
                    );
                    tokio::spawn(recover(manager.clone(), slot, reason));
                }
            }
        }
    })
}

/// Marks the agent failed and restarts it while its budget lasts.
async fn recover(manager: LifecycleManager, slot: Arc<AgentSlot>, reason: String) {
    if !manager.fail_running(&slot, &reason).await {
        return;
    }

    loop {
        if manager.is_stopping() {
            return;
        }

        let attempt = slot.status().restarts;
        if attempt >= slot.restart.max_restarts {
            manager.alert(
                &slot.name,
                "restart_limit_exceeded",
                &format!(
                    "Agent exhausted {} restarts and remains failed: {}",
                    slot.restart.max_restarts, reason
                ),
            );
            return;
        }

        let delay = backoff_with_jitter(&slot.restart, attempt);
        slot.status().restarts = attempt + 1;
        info!(
            agent = %slot.name,
            attempt = attempt + 1,
            max_restarts = slot.restart.max_restarts,
            delay_ms = delay.as_millis() as u64,
            "Restarting failed agent after backoff"
        );
        time::sleep(delay).await;

        if manager.is_stopping() || slot.state() != AgentState::Failed {
            return;
        }

        match manager.start_once(&slot).await {
            Ok(()) => {
                info!(agent = %slot.name, "Agent recovered");
                return;
            }
            Err(e) => {
                warn!(agent = %slot.name, error = %e, "Restart attempt failed");
            }
        }
    }
}
