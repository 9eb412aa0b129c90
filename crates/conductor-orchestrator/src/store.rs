//! Injectable history stores.
//!
//! Plans and routing decisions are kept in explicitly owned values rather
//! than process-wide state, so a test can hand a fresh store to a planner or
//! router and assert on what accumulated.

use crate::graph::TaskGraph;
use crate::planner::PlanRequest;
use crate::router::RoutingDecision;
use crate::types::GraphStatus;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

/// Default number of routing decisions a [`RoutingLog`] retains.
pub const DEFAULT_ROUTING_LOG_CAPACITY: usize = 1000;

/// A stored plan.
#[derive(Debug, Clone)]
pub struct PlanRecord {
    pub graph: TaskGraph,
    pub request: PlanRequest,
    pub created_at: DateTime<Utc>,
    /// How many times the graph was replaced by the replanner.
    pub replans: u32,
}

impl PlanRecord {
    pub fn new(graph: TaskGraph, request: PlanRequest) -> Self {
        Self {
            graph,
            request,
            created_at: Utc::now(),
            replans: 0,
        }
    }
}

/// Statistics over every plan ever created through a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStats {
    pub total_plans: u64,
    pub successful_plans: u64,
    pub failed_plans: u64,
    pub success_rate: f64,
    /// Plans currently held (not yet cleared).
    pub stored_plans: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
}

/// Plans by id, plus creation statistics that survive
/// [`remove_terminal`](PlanStore::remove_terminal).
#[derive(Debug, Default)]
pub struct PlanStore {
    plans: RwLock<HashMap<Uuid, PlanRecord>>,
    counters: Mutex<Counters>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a plan under its graph id.
    pub fn insert(&self, record: PlanRecord) -> Uuid {
        let id = record.graph.id();
        self.plans.write().insert(id, record);
        id
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.plans.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.read().is_empty()
    }

    /// Snapshot of a plan's graph.
    pub fn graph(&self, id: Uuid) -> Option<TaskGraph> {
        self.plans.read().get(&id).map(|r| r.graph.clone())
    }

    pub fn record(&self, id: Uuid) -> Option<PlanRecord> {
        self.plans.read().get(&id).cloned()
    }

    /// Run `f` against a stored graph under the write lock.
    ///
    /// `f` must not block or await; keep it to graph bookkeeping.
    pub fn with_graph_mut<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut TaskGraph) -> R,
    ) -> ConductorResult<R> {
        let mut plans = self.plans.write();
        let record = plans.get_mut(&id).ok_or(ConductorError::PlanNotFound(id))?;
        Ok(f(&mut record.graph))
    }

    /// Swap in a revised graph. The replacement keeps the plan id, and a
    /// cancelled plan stays cancelled.
    pub fn replace_graph(&self, id: Uuid, mut graph: TaskGraph) -> ConductorResult<()> {
        if graph.id() != id {
            return Err(ConductorError::InvalidPlan(format!(
                "Replacement graph {} does not match plan {id}",
                graph.id()
            )));
        }
        let mut plans = self.plans.write();
        let record = plans.get_mut(&id).ok_or(ConductorError::PlanNotFound(id))?;
        if record.graph.status() == GraphStatus::Cancelled {
            graph.cancel();
        }
        record.graph = graph;
        record.replans += 1;
        Ok(())
    }

    /// Drop every plan whose graph is terminal. Returns how many were removed.
    pub fn remove_terminal(&self) -> usize {
        let mut plans = self.plans.write();
        let before = plans.len();
        plans.retain(|_, record| !record.graph.status().is_terminal());
        before - plans.len()
    }

    /// Count one `plan()` outcome.
    pub fn record_plan_outcome(&self, success: bool) {
        let mut counters = self.counters.lock();
        counters.total += 1;
        if success {
            counters.successful += 1;
        }
    }

    pub fn stats(&self) -> PlanStats {
        let counters = self.counters.lock();
        let success_rate = if counters.total == 0 {
            0.0
        } else {
            counters.successful as f64 / counters.total as f64
        };
        PlanStats {
            total_plans: counters.total,
            successful_plans: counters.successful,
            failed_plans: counters.total - counters.successful,
            success_rate,
            stored_plans: self.len(),
        }
    }
}

/// Bounded history of routing decisions, oldest evicted first.
#[derive(Debug)]
pub struct RoutingLog {
    entries: Mutex<VecDeque<RoutingDecision>>,
    capacity: usize,
}

impl RoutingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, decision: RoutingDecision) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(decision);
    }

    /// The newest `n` decisions, oldest first.
    pub fn recent(&self, n: usize) -> Vec<RoutingDecision> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// How many retained decisions picked `worker_id`.
    pub fn count_for(&self, worker_id: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|d| d.worker_id == worker_id)
            .count()
    }
}

impl Default for RoutingLog {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTING_LOG_CAPACITY)
    }
}
