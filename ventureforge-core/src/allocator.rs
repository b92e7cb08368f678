//! Resource allocation ledger
//!
//! Owns every scarce resource a workflow can hold: compute slots, port
//! ranges, storage namespaces, and budget ceilings. Reservation is
//! all-or-nothing under a single allocator-wide lock; partial reservations
//! never escape. Release is idempotent and coalesces freed port ranges with
//! adjacent free ranges to limit fragmentation.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AllocatorConfig;
use crate::error::{ForgeError, Result};

/// What a workflow asks for at admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub compute_slots: u32,
    pub port_count: u16,
    pub budget_ceiling: f64,
}

/// A reservation held by exactly one workflow while it is running or blocked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub workflow_id: Uuid,
    pub compute_slots: u32,
    pub port_start: u16,
    pub port_count: u16,
    pub namespace: String,
    pub budget_ceiling: f64,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl ResourceAllocation {
    /// Half-open port range `[start, start + count)`
    pub fn port_range(&self) -> std::ops::Range<u16> {
        self.port_start..self.port_start.saturating_add(self.port_count)
    }

    pub fn ports_overlap(&self, other: &ResourceAllocation) -> bool {
        let a = self.port_range();
        let b = other.port_range();
        a.start < b.end && b.start < a.end
    }
}

#[derive(Debug)]
struct BudgetEntry {
    consumed: f64,
    ceiling: f64,
}

#[derive(Debug)]
struct Ledger {
    free_slots: u32,
    /// Free port ranges as `(start, len)`, sorted by start, non-adjacent
    free_ranges: Vec<(u16, u16)>,
    namespaces: HashSet<String>,
    allocations: HashMap<Uuid, ResourceAllocation>,
    budgets: HashMap<Uuid, BudgetEntry>,
}

/// Lock-guarded owner of the global resource ledger
pub struct ResourceAllocator {
    config: AllocatorConfig,
    ledger: Mutex<Ledger>,
}

impl ResourceAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        let ledger = Ledger {
            free_slots: config.total_compute_slots,
            free_ranges: vec![(config.port_floor, config.port_span)],
            namespaces: HashSet::new(),
            allocations: HashMap::new(),
            budgets: HashMap::new(),
        };
        Self {
            config,
            ledger: Mutex::new(ledger),
        }
    }

    /// Requirements with config defaults filled in
    pub fn requirements(&self, compute_slots: Option<u32>, budget_ceiling: Option<f64>) -> ResourceRequirements {
        ResourceRequirements {
            compute_slots: compute_slots.unwrap_or(self.config.default_compute_slots),
            port_count: self.config.default_port_count,
            budget_ceiling: budget_ceiling.unwrap_or(self.config.default_budget_ceiling),
        }
    }

    /// Reserve all resources for a workflow, all-or-nothing.
    ///
    /// The check and the commit both happen under the single allocator lock,
    /// so a failed reservation leaves the ledger untouched.
    pub async fn allocate(
        &self,
        workflow_id: Uuid,
        tenant: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation> {
        let mut ledger = self.ledger.lock().await;

        if ledger.allocations.contains_key(&workflow_id) {
            return Err(ForgeError::Validation(format!(
                "workflow {workflow_id} already holds an allocation"
            )));
        }
        if ledger.free_slots < req.compute_slots {
            return Err(ForgeError::ResourceExhausted(format!(
                "compute slots: need {}, have {}",
                req.compute_slots, ledger.free_slots
            )));
        }
        let range_idx = ledger
            .free_ranges
            .iter()
            .position(|&(_, len)| len >= req.port_count)
            .ok_or_else(|| {
                ForgeError::ResourceExhausted(format!(
                    "no free port range of {} ports",
                    req.port_count
                ))
            })?;
        let namespace = derive_namespace(tenant, workflow_id);
        if ledger.namespaces.contains(&namespace) {
            return Err(ForgeError::ResourceExhausted(format!(
                "storage namespace collision: {namespace}"
            )));
        }

        // All checks passed; commit every reservation.
        ledger.free_slots -= req.compute_slots;
        let (start, len) = ledger.free_ranges[range_idx];
        if len == req.port_count {
            ledger.free_ranges.remove(range_idx);
        } else {
            ledger.free_ranges[range_idx] = (start + req.port_count, len - req.port_count);
        }
        ledger.namespaces.insert(namespace.clone());

        let allocation = ResourceAllocation {
            workflow_id,
            compute_slots: req.compute_slots,
            port_start: start,
            port_count: req.port_count,
            namespace,
            budget_ceiling: req.budget_ceiling,
            allocated_at: Utc::now(),
            released_at: None,
        };
        ledger.allocations.insert(workflow_id, allocation.clone());
        ledger.budgets.insert(
            workflow_id,
            BudgetEntry {
                consumed: 0.0,
                ceiling: req.budget_ceiling,
            },
        );

        debug!(
            workflow = %workflow_id,
            slots = req.compute_slots,
            ports = ?allocation.port_range(),
            namespace = %allocation.namespace,
            "allocated resources"
        );
        Ok(allocation)
    }

    /// Release a workflow's reservation. Idempotent: releasing an unknown or
    /// already-released workflow is a no-op.
    pub async fn deallocate(&self, workflow_id: Uuid) -> Result<Option<ResourceAllocation>> {
        let mut ledger = self.ledger.lock().await;

        let Some(mut allocation) = ledger.allocations.remove(&workflow_id) else {
            return Ok(None);
        };

        ledger.free_slots += allocation.compute_slots;
        insert_coalesced(
            &mut ledger.free_ranges,
            allocation.port_start,
            allocation.port_count,
        );
        ledger.namespaces.remove(&allocation.namespace);
        ledger.budgets.remove(&workflow_id);
        allocation.released_at = Some(Utc::now());

        debug!(workflow = %workflow_id, "released resources");
        Ok(Some(allocation))
    }

    /// Record a billed cost against a workflow's budget.
    ///
    /// Accumulation is monotonic and the cost is recorded even when it
    /// crosses the ceiling; crossing returns `BudgetExceeded` so the caller
    /// can terminate the workflow in the same operation. Costs billed after
    /// release (e.g. a discarded in-flight call) are dropped with a warning.
    pub async fn record_cost(&self, workflow_id: Uuid, cost: f64) -> Result<f64> {
        let mut ledger = self.ledger.lock().await;

        let Some(entry) = ledger.budgets.get_mut(&workflow_id) else {
            warn!(workflow = %workflow_id, cost, "cost billed after release, dropping");
            return Ok(cost);
        };
        entry.consumed += cost.max(0.0);
        let consumed = entry.consumed;
        let ceiling = entry.ceiling;
        if consumed > ceiling {
            return Err(ForgeError::BudgetExceeded { consumed, ceiling });
        }
        Ok(consumed)
    }

    /// Budget consumed so far, if the workflow still holds resources
    pub async fn budget_consumed(&self, workflow_id: Uuid) -> Option<f64> {
        let ledger = self.ledger.lock().await;
        ledger.budgets.get(&workflow_id).map(|e| e.consumed)
    }

    /// Currently held allocations (snapshot)
    pub async fn active_allocations(&self) -> Vec<ResourceAllocation> {
        let ledger = self.ledger.lock().await;
        ledger.allocations.values().cloned().collect()
    }

    pub async fn free_compute_slots(&self) -> u32 {
        self.ledger.lock().await.free_slots
    }
}

/// Deterministic, collision-free storage namespace from tenant + workflow id
fn derive_namespace(tenant: &str, workflow_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_bytes());
    hasher.update(b":");
    hasher.update(workflow_id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("ns-{hex}")
}

/// Insert a freed range into the sorted free list, merging with adjacent
/// free ranges on either side.
fn insert_coalesced(ranges: &mut Vec<(u16, u16)>, start: u16, len: u16) {
    let idx = ranges.partition_point(|&(s, _)| s < start);
    ranges.insert(idx, (start, len));

    // Merge with the right neighbor first, then the left, so indices stay valid.
    if idx + 1 < ranges.len() && ranges[idx].0 + ranges[idx].1 == ranges[idx + 1].0 {
        ranges[idx].1 += ranges[idx + 1].1;
        ranges.remove(idx + 1);
    }
    if idx > 0 && ranges[idx - 1].0 + ranges[idx - 1].1 == ranges[idx].0 {
        ranges[idx - 1].1 += ranges[idx].1;
        ranges.remove(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> AllocatorConfig {
        AllocatorConfig {
            total_compute_slots: 8,
            port_floor: 42000,
            port_span: 16,
            default_compute_slots: 2,
            default_port_count: 4,
            default_budget_ceiling: 25.0,
        }
    }

    fn req(slots: u32, ports: u16, ceiling: f64) -> ResourceRequirements {
        ResourceRequirements {
            compute_slots: slots,
            port_count: ports,
            budget_ceiling: ceiling,
        }
    }

    #[tokio::test]
    async fn test_allocate_picks_lowest_free_range() {
        let alloc = ResourceAllocator::new(small_config());
        let a = alloc
            .allocate(Uuid::new_v4(), "acme", &req(1, 4, 10.0))
            .await
            .unwrap();
        let b = alloc
            .allocate(Uuid::new_v4(), "acme", &req(1, 4, 10.0))
            .await
            .unwrap();
        assert_eq!(a.port_start, 42000);
        assert_eq!(b.port_start, 42004);
        assert!(!a.ports_overlap(&b));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_share_ports_or_namespaces() {
        let alloc = ResourceAllocator::new(small_config());
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(
                alloc
                    .allocate(Uuid::new_v4(), "acme", &req(1, 4, 10.0))
                    .await
                    .unwrap(),
            );
        }
        for i in 0..held.len() {
            for j in (i + 1)..held.len() {
                assert!(!held[i].ports_overlap(&held[j]));
                assert_ne!(held[i].namespace, held[j].namespace);
            }
        }
    }

    #[tokio::test]
    async fn test_all_or_nothing_on_exhaustion() {
        let alloc = ResourceAllocator::new(small_config());
        // Exhaust ports (16 total) but not slots.
        let id = Uuid::new_v4();
        alloc.allocate(id, "acme", &req(1, 16, 10.0)).await.unwrap();

        let before = alloc.free_compute_slots().await;
        let err = alloc
            .allocate(Uuid::new_v4(), "acme", &req(1, 4, 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::ResourceExhausted(_)));
        // Failed reservation left no partial state behind.
        assert_eq!(alloc.free_compute_slots().await, before);
    }

    #[tokio::test]
    async fn test_deallocate_is_idempotent() {
        let alloc = ResourceAllocator::new(small_config());
        let id = Uuid::new_v4();
        alloc.allocate(id, "acme", &req(2, 4, 10.0)).await.unwrap();

        let first = alloc.deallocate(id).await.unwrap();
        assert!(first.is_some());
        assert_eq!(alloc.free_compute_slots().await, 8);

        let second = alloc.deallocate(id).await.unwrap();
        assert!(second.is_none());
        assert_eq!(alloc.free_compute_slots().await, 8);
    }

    #[tokio::test]
    async fn test_release_coalesces_adjacent_ranges() {
        let alloc = ResourceAllocator::new(small_config());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        alloc.allocate(a, "t", &req(1, 4, 10.0)).await.unwrap();
        alloc.allocate(b, "t", &req(1, 4, 10.0)).await.unwrap();
        alloc.allocate(c, "t", &req(1, 8, 10.0)).await.unwrap();

        alloc.deallocate(a).await.unwrap();
        alloc.deallocate(c).await.unwrap();
        alloc.deallocate(b).await.unwrap();

        // Everything coalesced back into one contiguous range, so a
        // full-span request succeeds again.
        let d = alloc
            .allocate(Uuid::new_v4(), "t", &req(1, 16, 10.0))
            .await
            .unwrap();
        assert_eq!(d.port_start, 42000);
    }

    #[tokio::test]
    async fn test_budget_monotonic_and_ceiling() {
        let alloc = ResourceAllocator::new(small_config());
        let id = Uuid::new_v4();
        alloc.allocate(id, "acme", &req(1, 4, 10.0)).await.unwrap();

        assert_eq!(alloc.record_cost(id, 7.0).await.unwrap(), 7.0);
        let err = alloc.record_cost(id, 5.0).await.unwrap_err();
        match err {
            ForgeError::BudgetExceeded { consumed, ceiling } => {
                // Cost is still recorded when the ceiling is crossed.
                assert_eq!(consumed, 12.0);
                assert_eq!(ceiling, 10.0);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
        assert_eq!(alloc.budget_consumed(id).await, Some(12.0));
    }

    #[test]
    fn test_namespace_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(derive_namespace("acme", id), derive_namespace("acme", id));
        assert_ne!(derive_namespace("acme", id), derive_namespace("globex", id));
    }

    #[test]
    fn test_insert_coalesced_merges_both_sides() {
        let mut ranges = vec![(100u16, 4u16), (108, 4)];
        insert_coalesced(&mut ranges, 104, 4);
        assert_eq!(ranges, vec![(100, 12)]);
    }
}
