use crate::manager::{lock, STATE_CHANGED_TOPIC};
use crate::{Agent, AgentContext};
use agentbus::{handler_fn, DeliveryContext, Message, MessageKind, Priority};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const RESOURCE_AGENT: &str = "resource";

/// An amount of one resource held by a requester.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub id: String,
    pub resource: String,
    pub requester: String,
    pub requested: f64,
    pub granted: f64,
}

/// Why a request was not granted.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Denial {
    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(f64),

    #[error("insufficient capacity for '{resource}': requested {requested}, available {available}")]
    InsufficientCapacity {
        resource: String,
        requested: f64,
        available: f64,
    },
}

#[derive(Debug)]
struct Capacity {
    total: f64,
    /// Held back for critical requests.
    reserved: f64,
    allocated: f64,
}

impl Capacity {
    fn available(&self, priority: Priority) -> f64 {
        let free = self.total - self.allocated;
        let usable = if priority == Priority::Critical {
            free
        } else {
            free - self.reserved
        };
        usable.max(0.0)
    }
}

/// Capacity bookkeeping behind the resource agent.
///
/// Critical requests may dip into the reserve. High requests receive a
/// partial grant when less than the requested amount is free; lower
/// priorities are granted in full or not at all.
#[derive(Debug, Default)]
pub struct ResourcePool {
    capacities: BTreeMap<String, Capacity>,
    allocations: HashMap<String, Allocation>,
    next_id: u64,
}

impl ResourcePool {
    /// `reserved_percent` maps resource names to the share of their
    /// capacity kept for critical requests.
    pub fn new(capacities: &HashMap<String, f64>, reserved_percent: &HashMap<String, f64>) -> Self {
        let capacities = capacities
            .iter()
            .map(|(name, total)| {
                let percent = reserved_percent.get(name).copied().unwrap_or(0.0).clamp(0.0, 100.0);
                let capacity = Capacity {
                    total: total.max(0.0),
                    reserved: total.max(0.0) * percent / 100.0,
                    allocated: 0.0,
                };
                (name.clone(), capacity)
            })
            .collect();
        Self {
            capacities,
            allocations: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn allocate(
        &mut self,
        resource: &str,
        amount: f64,
        requester: &str,
        priority: Priority,
    ) -> Result<Allocation, Denial> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Denial::InvalidAmount(amount));
        }
        let capacity = self
            .capacities
            .get_mut(resource)
            .ok_or_else(|| Denial::UnknownResource(resource.to_string()))?;

        let available = capacity.available(priority);
        let granted = if available >= amount {
            amount
        } else if priority >= Priority::High && available > 0.0 {
            available
        } else {
            return Err(Denial::InsufficientCapacity {
                resource: resource.to_string(),
                requested: amount,
                available,
            });
        };
        capacity.allocated += granted;

        self.next_id += 1;
        let allocation = Allocation {
            id: format!("{}-{}", resource, self.next_id),
            resource: resource.to_string(),
            requester: requester.to_string(),
            requested: amount,
            granted,
        };
        self.allocations.insert(allocation.id.clone(), allocation.clone());
        Ok(allocation)
    }

    /// Returns the released allocation, or `None` for an unknown id.
    pub fn release(&mut self, id: &str) -> Option<Allocation> {
        let allocation = self.allocations.remove(id)?;
        if let Some(capacity) = self.capacities.get_mut(&allocation.resource) {
            capacity.allocated = (capacity.allocated - allocation.granted).max(0.0);
        }
        Some(allocation)
    }

    /// Releases everything held by `requester`.
    pub fn release_all(&mut self, requester: &str) -> Vec<Allocation> {
        let ids: Vec<String> = self
            .allocations
            .values()
            .filter(|a| a.requester == requester)
            .map(|a| a.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.release(id)).collect()
    }

    /// Free amount of `resource` for a request at `priority`.
    pub fn available(&self, resource: &str, priority: Priority) -> Option<f64> {
        self.capacities.get(resource).map(|c| c.available(priority))
    }

    pub fn status(&self) -> Value {
        let resources: serde_json::Map<String, Value> = self
            .capacities
            .iter()
            .map(|(name, c)| {
                let count = self.allocations.values().filter(|a| &a.resource == name).count();
                let entry = json!({
                    "capacity": c.total,
                    "reserved": c.reserved,
                    "allocated": c.allocated,
                    "available": c.available(Priority::Normal),
                    "allocationCount": count,
                });
                (name.clone(), entry)
            })
            .collect();
        json!({ "resources": resources })
    }
}

#[derive(Deserialize)]
struct AllocationRequest {
    resource: String,
    amount: f64,
    requester: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest {
    allocation_id: String,
}

/// Grants and tracks resource allocations against configured capacities.
///
/// # Config
/// `capacities = { cpu = 100.0, memory = 16384.0 }` and optionally
/// `reserved_percent = { cpu = 10.0 }`
///
/// # Topics
/// - `resource.request` `{resource, amount, requester?}`: replies
///   `{granted: true, allocation}` or `{granted: false, reason}`; the
///   message priority decides access to the reserve
/// - `resource.release` `{allocationId}`: replies `{released, allocation?}`
/// - `resource.status`: replies with per-resource totals
/// - publishes `resource.allocated` and `resource.released`
///
/// Allocations held by an agent that stops or fails are released.
#[derive(Default)]
pub struct ResourceAgent {
    pool: Arc<Mutex<ResourcePool>>,
}

impl ResourceAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> Vec<Allocation> {
        let mut allocations: Vec<Allocation> = lock(&self.pool).allocations.values().cloned().collect();
        allocations.sort_by(|a, b| a.id.cmp(&b.id));
        allocations
    }
}

fn announce_release(dctx: &DeliveryContext, allocation: &Allocation) {
    if let Err(e) = dctx.publish("resource.released", json!({ "allocation": allocation })) {
        debug!(error = %e, "Release event not published");
    }
}

fn handle_request(pool: &Mutex<ResourcePool>, msg: &Message, dctx: &DeliveryContext) -> Result<()> {
    let request: AllocationRequest = match serde_json::from_value(msg.payload.clone()) {
        Ok(request) => request,
        Err(e) => {
            dctx.reply(msg, json!({ "granted": false, "reason": format!("invalid request: {}", e) }))?;
            return Ok(());
        }
    };
    let requester = request.requester.unwrap_or_else(|| msg.sender.clone());

    let outcome = lock(pool).allocate(&request.resource, request.amount, &requester, msg.priority);
    match outcome {
        Ok(allocation) => {
            info!(
                resource = %allocation.resource,
                requester = %allocation.requester,
                granted = allocation.granted,
                "Resource allocated"
            );
            dctx.publish("resource.allocated", json!({ "allocation": allocation }))?;
            dctx.reply(msg, json!({ "granted": true, "allocation": allocation }))?;
        }
        Err(denial) => {
            warn!(requester = %requester, reason = %denial, "Resource request denied");
            dctx.reply(msg, json!({ "granted": false, "reason": denial.to_string() }))?;
        }
    }
    Ok(())
}

fn handle_release(pool: &Mutex<ResourcePool>, msg: &Message, dctx: &DeliveryContext) -> Result<()> {
    let request: ReleaseRequest = match serde_json::from_value(msg.payload.clone()) {
        Ok(request) => request,
        Err(e) => {
            dctx.reply(msg, json!({ "released": false, "reason": format!("invalid request: {}", e) }))?;
            return Ok(());
        }
    };

    let released = lock(pool).release(&request.allocation_id);
    match released {
        Some(allocation) => {
            info!(allocation = %allocation.id, granted = allocation.granted, "Resource released");
            announce_release(dctx, &allocation);
            dctx.reply(msg, json!({ "released": true, "allocation": allocation }))?;
        }
        None => {
            dctx.reply(
                msg,
                json!({ "released": false, "reason": format!("unknown allocation '{}'", request.allocation_id) }),
            )?;
        }
    }
    Ok(())
}

#[async_trait]
impl Agent for ResourceAgent {
    async fn start(&self, ctx: &AgentContext) -> Result<()> {
        let capacities: HashMap<String, f64> = match ctx.config().get("capacities") {
            Some(value) => serde_json::from_value(value.clone())
                .context("Invalid 'capacities' configuration")?,
            None => HashMap::new(),
        };
        let reserved: HashMap<String, f64> = match ctx.config().get("reserved_percent") {
            Some(value) => serde_json::from_value(value.clone())
                .context("Invalid 'reserved_percent' configuration")?,
            None => HashMap::new(),
        };
        *lock(&self.pool) = ResourcePool::new(&capacities, &reserved);
        info!(agent = %ctx.name(), resources = capacities.len(), "Resource pool ready");

        let pool = Arc::clone(&self.pool);
        ctx.subscribe(
            "resource.request",
            handler_fn(move |msg, dctx| {
                let pool = Arc::clone(&pool);
                async move {
                    if msg.kind != MessageKind::Request {
                        return Ok(());
                    }
                    handle_request(&pool, &msg, &dctx)
                }
            }),
        )?;

        let pool = Arc::clone(&self.pool);
        ctx.subscribe(
            "resource.release",
            handler_fn(move |msg, dctx| {
                let pool = Arc::clone(&pool);
                async move {
                    if msg.kind != MessageKind::Request {
                        return Ok(());
                    }
                    handle_release(&pool, &msg, &dctx)
                }
            }),
        )?;

        let pool = Arc::clone(&self.pool);
        ctx.subscribe(
            "resource.status",
            handler_fn(move |msg, dctx| {
                let pool = Arc::clone(&pool);
                async move {
                    if msg.kind != MessageKind::Request {
                        return Ok(());
                    }
                    let status = lock(&pool).status();
                    dctx.reply(&msg, status)?;
                    Ok(())
                }
            }),
        )?;

        let pool = Arc::clone(&self.pool);
        ctx.subscribe(
            STATE_CHANGED_TOPIC,
            handler_fn(move |msg, dctx| {
                let pool = Arc::clone(&pool);
                async move {
                    let (Some(agent), Some(to)) = (msg.payload_str("agent"), msg.payload_str("to")) else {
                        return Ok(());
                    };
                    if to != "stopped" && to != "failed" {
                        return Ok(());
                    }
                    let released = lock(&pool).release_all(agent);
                    if !released.is_empty() {
                        info!(agent = %agent, count = released.len(), "Released allocations of stopped agent");
                    }
                    for allocation in &released {
                        announce_release(&dctx, allocation);
                    }
                    Ok(())
                }
            }),
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ResourcePool {
        let capacities = HashMap::from([("cpu".to_string(), 100.0), ("memory".to_string(), 1024.0)]);
        let reserved = HashMap::from([("cpu".to_string(), 10.0)]);
        ResourcePool::new(&capacities, &reserved)
    }

    #[test]
    fn test_allocate_and_release() {
        let mut pool = pool();

        let first = pool.allocate("cpu", 60.0, "hardware", Priority::Normal).unwrap();
        assert_eq!(first.granted, 60.0);
        assert_eq!(pool.available("cpu", Priority::Normal), Some(30.0));

        let denied = pool.allocate("cpu", 40.0, "audit", Priority::Normal).unwrap_err();
        assert!(matches!(denied, Denial::InsufficientCapacity { available, .. } if available == 30.0));

        let released = pool.release(&first.id).unwrap();
        assert_eq!(released.requester, "hardware");
        assert_eq!(pool.available("cpu", Priority::Normal), Some(90.0));
        assert!(pool.release(&first.id).is_none());
    }

    #[test]
    fn test_priority_decides_reserve_and_partial_grants() {
        let mut pool = pool();
        pool.allocate("cpu", 85.0, "batch", Priority::Normal).unwrap();

        // High: partial grant from the unreserved remainder
        let high = pool.allocate("cpu", 20.0, "ui", Priority::High).unwrap();
        assert_eq!(high.requested, 20.0);
        assert_eq!(high.granted, 5.0);
        assert_eq!(pool.available("cpu", Priority::High), Some(0.0));

        // Critical: may use the reserve
        let critical = pool.allocate("cpu", 10.0, "kernel", Priority::Critical).unwrap();
        assert_eq!(critical.granted, 10.0);
        assert_eq!(pool.available("cpu", Priority::Critical), Some(0.0));

        assert!(pool.allocate("cpu", 1.0, "batch", Priority::Low).is_err());
    }

    #[test]
    fn test_invalid_requests_are_denied() {
        let mut pool = pool();
        assert_eq!(
            pool.allocate("disk", 1.0, "x", Priority::Normal),
            Err(Denial::UnknownResource("disk".to_string()))
        );
        assert!(matches!(
            pool.allocate("memory", 0.0, "x", Priority::Normal),
            Err(Denial::InvalidAmount(_))
        ));
        assert!(matches!(
            pool.allocate("memory", f64::NAN, "x", Priority::Normal),
            Err(Denial::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_release_all_for_requester() {
        let mut pool = pool();
        pool.allocate("cpu", 10.0, "hardware", Priority::Normal).unwrap();
        pool.allocate("memory", 512.0, "hardware", Priority::Normal).unwrap();
        pool.allocate("memory", 100.0, "audit", Priority::Normal).unwrap();

        let released = pool.release_all("hardware");
        assert_eq!(released.len(), 2);
        assert_eq!(pool.available("memory", Priority::Normal), Some(924.0));
        assert_eq!(pool.status()["resources"]["memory"]["allocationCount"], 1);
    }
}
