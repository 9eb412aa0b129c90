use crate::types::{
    ComplexityLevel, GraphStatus, Subtask, SubtaskOptions, SubtaskResult, SubtaskStatus,
};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use tracing::{debug, error};
use uuid::Uuid;

const ON_STACK: u8 = 1;
const DONE: u8 = 2;

/// A DAG of subtasks for one planning session.
///
/// Keeps a forward index (id → dependents) and a reverse index
/// (id → dependencies) in sync with every structural change, and recomputes
/// the execution layers after each one. Edges that would close a cycle are
/// rejected before anything is mutated.
#[derive(Debug, Clone, Serialize)]
pub struct TaskGraph {
    id: Uuid,
    goal: String,
    subtasks: HashMap<Uuid, Subtask>,
    /// Insertion order; keeps layers and listings deterministic.
    order: Vec<Uuid>,
    dependents: HashMap<Uuid, BTreeSet<Uuid>>,
    dependencies: HashMap<Uuid, BTreeSet<Uuid>>,
    layers: Vec<Vec<Uuid>>,
    status: GraphStatus,
    created_at: DateTime<Utc>,
}

/// Per-status counts and progress for a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub status: GraphStatus,
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    /// Share of subtasks in a terminal state, `0.0..=100.0`.
    pub progress_percent: f64,
    /// Layer-parallel estimate over the subtasks that are not terminal yet.
    pub estimated_remaining_ms: u64,
}

impl TaskGraph {
    pub fn new(goal: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), goal)
    }

    pub fn with_id(id: Uuid, goal: impl Into<String>) -> Self {
        Self {
            id,
            goal: goal.into(),
            subtasks: HashMap::new(),
            order: Vec::new(),
            dependents: HashMap::new(),
            dependencies: HashMap::new(),
            layers: Vec::new(),
            status: GraphStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Build a graph from fully formed subtasks (edges included).
    ///
    /// Used for graphs assembled outside the incremental API, e.g. by the
    /// replanner. Unknown dependencies and cycles are rejected.
    pub fn from_subtasks(
        id: Uuid,
        goal: impl Into<String>,
        subtasks: Vec<Subtask>,
    ) -> ConductorResult<Self> {
        let mut graph = Self::with_id(id, goal);
        for subtask in subtasks {
            if graph.subtasks.contains_key(&subtask.id) {
                return Err(ConductorError::InvalidPlan(format!(
                    "Duplicate subtask id {}",
                    subtask.id
                )));
            }
            graph.insert_indexed(subtask);
        }
        for id in &graph.order {
            for dep in &graph.subtasks[id].dependencies {
                if !graph.subtasks.contains_key(dep) {
                    return Err(ConductorError::UnknownDependency { dependency: *dep });
                }
            }
        }
        graph.validate_no_cycles()?;
        graph.recompute_layers();
        graph.refresh_status();
        Ok(graph)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn status(&self) -> GraphStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.subtasks.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Subtask> {
        self.subtasks.get(&id)
    }

    /// All subtasks in insertion order.
    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.order.iter().filter_map(|id| self.subtasks.get(id))
    }

    // --- Structural mutation ---

    /// Insert a new subtask. Every id in `options.dependencies` must already
    /// be part of the graph.
    pub fn add_subtask(
        &mut self,
        description: impl Into<String>,
        options: SubtaskOptions,
    ) -> ConductorResult<Uuid> {
        if let Some(missing) = options
            .dependencies
            .iter()
            .find(|dep| !self.subtasks.contains_key(dep))
        {
            return Err(ConductorError::UnknownDependency {
                dependency: *missing,
            });
        }

        let subtask = Subtask::new(description, options);
        let id = subtask.id;
        if self.subtasks.contains_key(&id) {
            return Err(ConductorError::InvalidPlan(format!(
                "Duplicate subtask id {id}"
            )));
        }

        debug!(graph = %self.id, subtask = %id, deps = subtask.dependencies.len(), "Adding subtask");
        self.insert_indexed(subtask);
        self.recompute_layers();
        self.refresh_status();
        Ok(id)
    }

    /// Remove a subtask nothing depends on.
    pub fn remove_subtask(&mut self, id: Uuid) -> ConductorResult<Subtask> {
        if !self.subtasks.contains_key(&id) {
            return Err(ConductorError::UnknownSubtask(id));
        }
        let count = self.dependents.get(&id).map_or(0, BTreeSet::len);
        if count > 0 {
            return Err(ConductorError::HasDependents { id, count });
        }

        let subtask = self
            .subtasks
            .remove(&id)
            .ok_or(ConductorError::UnknownSubtask(id))?;
        for dep in self.dependencies.remove(&id).unwrap_or_default() {
            if let Some(set) = self.dependents.get_mut(&dep) {
                set.remove(&id);
            }
        }
        self.dependents.remove(&id);
        self.order.retain(|other| *other != id);

        self.recompute_layers();
        self.refresh_status();
        Ok(subtask)
    }

    /// Make `dependent` depend on `dependency`.
    ///
    /// Fails with `CycleDetected` if `dependent` is already reachable from
    /// `dependency` through dependency edges. Returns `false` if the edge
    /// already existed.
    pub fn add_dependency(&mut self, dependent: Uuid, dependency: Uuid) -> ConductorResult<bool> {
        if !self.subtasks.contains_key(&dependent) {
            return Err(ConductorError::UnknownSubtask(dependent));
        }
        if !self.subtasks.contains_key(&dependency) {
            return Err(ConductorError::UnknownDependency { dependency });
        }
        if self
            .dependencies
            .get(&dependent)
            .is_some_and(|deps| deps.contains(&dependency))
        {
            return Ok(false);
        }

        if let Some(chain) = self.dependency_path(dependency, dependent) {
            let mut path = Vec::with_capacity(chain.len() + 1);
            path.push(dependent);
            path.extend(chain);
            return Err(ConductorError::CycleDetected { path });
        }

        self.dependencies
            .entry(dependent)
            .or_default()
            .insert(dependency);
        self.dependents
            .entry(dependency)
            .or_default()
            .insert(dependent);
        let dependency_done = self.subtasks[&dependency].status == SubtaskStatus::Completed;
        if let Some(subtask) = self.subtasks.get_mut(&dependent) {
            subtask.dependencies.insert(dependency);
            if subtask.status == SubtaskStatus::Ready && !dependency_done {
                subtask.status = SubtaskStatus::Pending;
            }
        }

        self.recompute_layers();
        Ok(true)
    }

    /// Drop the edge `dependent → dependency`. Returns whether it existed.
    pub fn remove_dependency(
        &mut self,
        dependent: Uuid,
        dependency: Uuid,
    ) -> ConductorResult<bool> {
        if !self.subtasks.contains_key(&dependent) {
            return Err(ConductorError::UnknownSubtask(dependent));
        }
        if !self.subtasks.contains_key(&dependency) {
            return Err(ConductorError::UnknownDependency { dependency });
        }

        let removed = self
            .dependencies
            .get_mut(&dependent)
            .is_some_and(|deps| deps.remove(&dependency));
        if removed {
            if let Some(set) = self.dependents.get_mut(&dependency) {
                set.remove(&dependent);
            }
            if let Some(subtask) = self.subtasks.get_mut(&dependent) {
                subtask.dependencies.remove(&dependency);
            }
            self.recompute_layers();
        }
        Ok(removed)
    }

    /// Full cycle check over the whole graph.
    ///
    /// Incremental checks in [`add_dependency`](Self::add_dependency) keep the
    /// graph acyclic; this catches graphs assembled out of band. Returns the
    /// offending path (first and last element equal) on failure.
    pub fn validate_no_cycles(&self) -> ConductorResult<()> {
        let mut color: HashMap<Uuid, u8> = HashMap::new();

        for &root in &self.order {
            if color.contains_key(&root) {
                continue;
            }
            color.insert(root, ON_STACK);
            let mut stack: Vec<(Uuid, Vec<Uuid>, usize)> = vec![(root, self.deps_of(root), 0)];

            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                if frame.2 < frame.1.len() {
                    let next = frame.1[frame.2];
                    frame.2 += 1;
                    match color.get(&next).copied() {
                        Some(ON_STACK) => {
                            let start = stack
                                .iter()
                                .position(|(node, _, _)| *node == next)
                                .unwrap_or(0);
                            let mut path: Vec<Uuid> =
                                stack[start..].iter().map(|(node, _, _)| *node).collect();
                            path.push(next);
                            return Err(ConductorError::CycleDetected { path });
                        }
                        Some(_) => {}
                        None => {
                            color.insert(next, ON_STACK);
                            let deps = self.deps_of(next);
                            stack.push((next, deps, 0));
                        }
                    }
                } else {
                    let node = frame.0;
                    color.insert(node, DONE);
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    // --- Status transitions ---

    /// Subtasks that are pending/ready with every dependency completed, in
    /// layer order. Pending ones are promoted to `ready`.
    pub fn get_ready_subtasks(&mut self) -> Vec<Subtask> {
        let completed = self.completed_ids();
        let mut ready = Vec::new();
        for layer in &self.layers {
            for id in layer {
                let Some(subtask) = self.subtasks.get_mut(id) else {
                    continue;
                };
                if matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Ready)
                    && subtask.dependencies_met(&completed)
                {
                    subtask.status = SubtaskStatus::Ready;
                    ready.push(subtask.clone());
                }
            }
        }
        ready
    }

    /// `pending/ready → in-progress`. Refused while any dependency is not
    /// completed.
    pub fn mark_started(&mut self, id: Uuid, worker_id: impl Into<String>) -> ConductorResult<()> {
        let completed = self.completed_ids();
        let subtask = self
            .subtasks
            .get_mut(&id)
            .ok_or(ConductorError::UnknownSubtask(id))?;
        if !matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Ready) {
            return Err(transition_error(id, subtask.status, SubtaskStatus::InProgress));
        }
        if !subtask.dependencies_met(&completed) {
            return Err(ConductorError::InvalidTransition {
                id,
                from: subtask.status.to_string(),
                to: "in-progress (dependencies incomplete)".to_string(),
            });
        }

        subtask.status = SubtaskStatus::InProgress;
        subtask.assigned_worker = Some(worker_id.into());
        subtask.started_at = Some(Utc::now());
        self.refresh_status();
        Ok(())
    }

    /// `in-progress → completed`, recording the result and criterion outcomes.
    pub fn mark_completed(&mut self, id: Uuid, result: SubtaskResult) -> ConductorResult<()> {
        let subtask = self
            .subtasks
            .get_mut(&id)
            .ok_or(ConductorError::UnknownSubtask(id))?;
        if subtask.status != SubtaskStatus::InProgress {
            return Err(transition_error(id, subtask.status, SubtaskStatus::Completed));
        }

        apply_verifications(subtask, &result);
        if let Some(worker) = &result.worker_id {
            subtask.assigned_worker = Some(worker.clone());
        }
        subtask.status = SubtaskStatus::Completed;
        subtask.completed_at = Some(Utc::now());
        subtask.result = Some(result);
        self.refresh_status();
        Ok(())
    }

    /// Mark a subtask failed with a plain error message.
    ///
    /// See [`mark_failed_with`](Self::mark_failed_with).
    pub fn mark_failed(&mut self, id: Uuid, error: impl Into<String>) -> ConductorResult<Vec<Uuid>> {
        self.mark_failed_with(id, SubtaskResult::failure(error))
    }

    /// `in-progress → failed`, blocking every transitive dependent that is
    /// not terminal yet. Returns the newly blocked ids.
    pub fn mark_failed_with(
        &mut self,
        id: Uuid,
        result: SubtaskResult,
    ) -> ConductorResult<Vec<Uuid>> {
        let status = self
            .subtasks
            .get(&id)
            .ok_or(ConductorError::UnknownSubtask(id))?
            .status;
        if status != SubtaskStatus::InProgress {
            return Err(transition_error(id, status, SubtaskStatus::Failed));
        }
        Ok(self.fail_and_block(id, result))
    }

    /// `pending/ready → failed` for a subtask that could not be started at
    /// all (no worker could be routed, for example). Blocks dependents like
    /// [`mark_failed_with`](Self::mark_failed_with).
    pub fn mark_start_failed(
        &mut self,
        id: Uuid,
        reason: impl Into<String>,
    ) -> ConductorResult<Vec<Uuid>> {
        let status = self
            .subtasks
            .get(&id)
            .ok_or(ConductorError::UnknownSubtask(id))?
            .status;
        if !matches!(status, SubtaskStatus::Pending | SubtaskStatus::Ready) {
            return Err(transition_error(id, status, SubtaskStatus::Failed));
        }
        Ok(self.fail_and_block(id, SubtaskResult::failure(reason)))
    }

    fn fail_and_block(&mut self, id: Uuid, result: SubtaskResult) -> Vec<Uuid> {
        if let Some(subtask) = self.subtasks.get_mut(&id) {
            apply_verifications(subtask, &result);
            if let Some(worker) = &result.worker_id {
                subtask.assigned_worker = Some(worker.clone());
            }
            subtask.status = SubtaskStatus::Failed;
            subtask.completed_at = Some(Utc::now());
            subtask.result = Some(result);
        }

        let mut blocked = Vec::new();
        for dependent in self.transitive_dependents(id) {
            if let Some(subtask) = self.subtasks.get_mut(&dependent) {
                if subtask.status.is_terminal() || subtask.status == SubtaskStatus::InProgress {
                    continue;
                }
                subtask.status = SubtaskStatus::Blocked;
                subtask.completed_at = Some(Utc::now());
                blocked.push(dependent);
            }
        }
        if !blocked.is_empty() {
            debug!(graph = %self.id, failed = %id, blocked = blocked.len(), "Blocked dependents");
        }

        self.refresh_status();
        blocked
    }

    /// `pending/ready → skipped`.
    pub fn mark_skipped(&mut self, id: Uuid) -> ConductorResult<()> {
        let subtask = self
            .subtasks
            .get_mut(&id)
            .ok_or(ConductorError::UnknownSubtask(id))?;
        if !matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Ready) {
            return Err(transition_error(id, subtask.status, SubtaskStatus::Skipped));
        }
        subtask.status = SubtaskStatus::Skipped;
        subtask.completed_at = Some(Utc::now());
        self.refresh_status();
        Ok(())
    }

    /// Skip every pending/ready subtask and mark the graph cancelled.
    /// In-progress subtasks are left alone. Returns the skipped ids.
    pub fn cancel(&mut self) -> Vec<Uuid> {
        let now = Utc::now();
        let mut skipped = Vec::new();
        for id in &self.order {
            if let Some(subtask) = self.subtasks.get_mut(id) {
                if matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Ready) {
                    subtask.status = SubtaskStatus::Skipped;
                    subtask.completed_at = Some(now);
                    skipped.push(*id);
                }
            }
        }
        self.status = GraphStatus::Cancelled;
        skipped
    }

    // --- Queries ---

    /// The execution layers, as subtask ids.
    pub fn layers(&self) -> &[Vec<Uuid>] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<Vec<&Subtask>> {
        self.layers
            .get(index)
            .map(|ids| ids.iter().filter_map(|id| self.subtasks.get(id)).collect())
    }

    /// Direct dependents of `id`.
    pub fn dependents(&self, id: Uuid) -> Vec<Uuid> {
        self.dependents
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies(&self, id: Uuid) -> Vec<Uuid> {
        self.deps_of(id)
    }

    /// Every subtask that depends on `id` directly or indirectly, breadth first.
    pub fn transitive_dependents(&self, id: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<Uuid> = self.dependents(id).into();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            out.push(next);
            queue.extend(self.dependents(next));
        }
        out
    }

    pub fn subtasks_by_status(&self, status: SubtaskStatus) -> Vec<&Subtask> {
        self.subtasks().filter(|s| s.status == status).collect()
    }

    /// Highest complexity level among all subtasks.
    pub fn total_complexity(&self) -> Option<ComplexityLevel> {
        self.subtasks.values().map(|s| s.complexity.level).max()
    }

    /// Sum over layers of each layer's longest subtask estimate.
    pub fn estimated_total_duration_ms(&self) -> u64 {
        self.layered_duration(|_| true)
    }

    /// Width of the widest layer.
    pub fn max_parallelism(&self) -> usize {
        self.layers.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn summary(&self) -> GraphSummary {
        let count = |status: SubtaskStatus| {
            self.subtasks
                .values()
                .filter(|s| s.status == status)
                .count()
        };
        let total = self.subtasks.len();
        let terminal = self
            .subtasks
            .values()
            .filter(|s| s.status.is_terminal())
            .count();
        let progress_percent = if total == 0 {
            0.0
        } else {
            terminal as f64 / total as f64 * 100.0
        };

        GraphSummary {
            status: self.status,
            total,
            pending: count(SubtaskStatus::Pending),
            ready: count(SubtaskStatus::Ready),
            in_progress: count(SubtaskStatus::InProgress),
            completed: count(SubtaskStatus::Completed),
            failed: count(SubtaskStatus::Failed),
            blocked: count(SubtaskStatus::Blocked),
            skipped: count(SubtaskStatus::Skipped),
            progress_percent,
            estimated_remaining_ms: self.layered_duration(|s| !s.status.is_terminal()),
        }
    }

    /// Text rendering of the graph, one block per layer.
    pub fn visualize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Task graph: {} [{}]", self.goal, self.status);
        if self.layers.is_empty() {
            let _ = writeln!(out, "  (empty)");
            return out;
        }

        for (index, layer) in self.layers.iter().enumerate() {
            let _ = writeln!(out, "Layer {index}:");
            for id in layer {
                let Some(subtask) = self.subtasks.get(id) else {
                    continue;
                };
                let _ = writeln!(
                    out,
                    "  {} {} ({}, ~{}m, {}) #{}",
                    status_marker(subtask.status),
                    subtask.description,
                    subtask.complexity.level,
                    subtask.complexity.estimated_duration_ms / 60_000,
                    subtask.category,
                    short_id(subtask.id),
                );
                if !subtask.dependencies.is_empty() {
                    let deps: Vec<String> =
                        subtask.dependencies.iter().map(|d| short_id(*d)).collect();
                    let _ = writeln!(out, "      after: {}", deps.join(", "));
                }
            }
        }

        let summary = self.summary();
        let _ = writeln!(
            out,
            "Progress: {:.0}% ({}/{} done), ~{}m remaining",
            summary.progress_percent,
            summary.completed,
            summary.total,
            summary.estimated_remaining_ms / 60_000
        );
        out
    }

    /// JSON snapshot: subtasks in insertion order plus derived values.
    pub fn to_json(&self) -> ConductorResult<serde_json::Value> {
        let subtasks: Vec<&Subtask> = self.subtasks().collect();
        Ok(serde_json::json!({
            "id": self.id,
            "goal": self.goal,
            "status": self.status,
            "created_at": self.created_at,
            "subtasks": serde_json::to_value(subtasks)?,
            "layers": self.layers,
            "total_complexity": self.total_complexity(),
            "estimated_total_duration_ms": self.estimated_total_duration_ms(),
            "summary": serde_json::to_value(self.summary())?,
        }))
    }

    // --- Internals ---

    fn insert_indexed(&mut self, subtask: Subtask) {
        let id = subtask.id;
        for dep in &subtask.dependencies {
            self.dependents.entry(*dep).or_default().insert(id);
        }
        self.dependents.entry(id).or_default();
        self.dependencies.insert(id, subtask.dependencies.clone());
        self.order.push(id);
        self.subtasks.insert(id, subtask);
    }

    fn deps_of(&self, id: Uuid) -> Vec<Uuid> {
        self.dependencies
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn completed_ids(&self) -> HashSet<Uuid> {
        self.subtasks
            .values()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .map(|s| s.id)
            .collect()
    }

    /// Path `from → ... → to` following dependency edges, if one exists.
    fn dependency_path(&self, from: Uuid, to: Uuid) -> Option<Vec<Uuid>> {
        let mut parent: HashMap<Uuid, Uuid> = HashMap::new();
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(node) = queue.pop_front() {
            if node == to {
                let mut path = vec![node];
                let mut cursor = node;
                while let Some(prev) = parent.get(&cursor) {
                    path.push(*prev);
                    cursor = *prev;
                }
                path.reverse();
                return Some(path);
            }
            for dep in self.deps_of(node) {
                if seen.insert(dep) {
                    parent.insert(dep, node);
                    queue.push_back(dep);
                }
            }
        }
        None
    }

    /// Kahn's algorithm: peel zero in-degree sets until nothing is left.
    fn recompute_layers(&mut self) {
        let position: HashMap<Uuid, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let mut in_degree: HashMap<Uuid, usize> = self
            .order
            .iter()
            .map(|id| (*id, self.dependencies.get(id).map_or(0, BTreeSet::len)))
            .collect();

        let mut current: Vec<Uuid> = self
            .order
            .iter()
            .copied()
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for id in &current {
                for dependent in self.dependents.get(id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            next.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
            layers.push(current);
            current = next;
        }

        if placed < self.order.len() {
            error!(
                graph = %self.id,
                unplaced = self.order.len() - placed,
                "Layering stalled: dependency cycle in task graph"
            );
        }
        self.layers = layers;
    }

    fn refresh_status(&mut self) {
        if self.status == GraphStatus::Cancelled || self.subtasks.is_empty() {
            return;
        }
        let all_terminal = self.subtasks.values().all(|s| s.status.is_terminal());
        self.status = if all_terminal {
            if self
                .subtasks
                .values()
                .any(|s| s.status == SubtaskStatus::Failed)
            {
                GraphStatus::Failed
            } else {
                GraphStatus::Completed
            }
        } else if self.subtasks.values().any(|s| {
            s.status == SubtaskStatus::InProgress || s.status.is_terminal()
        }) {
            GraphStatus::Executing
        } else {
            GraphStatus::Pending
        };
    }

    fn layered_duration(&self, include: impl Fn(&Subtask) -> bool) -> u64 {
        self.layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .filter_map(|id| self.subtasks.get(id))
                    .filter(|s| include(s))
                    .map(|s| s.complexity.estimated_duration_ms)
                    .max()
                    .unwrap_or(0)
            })
            .sum()
    }
}

fn apply_verifications(subtask: &mut Subtask, result: &SubtaskResult) {
    for verification in &result.verifications {
        if let Some(criterion) = subtask
            .success_criteria
            .iter_mut()
            .find(|c| c.id == verification.criterion_id)
        {
            criterion.met = verification.passed;
            criterion.verified_at = Some(verification.timestamp);
        }
    }
}

fn transition_error(id: Uuid, from: SubtaskStatus, to: SubtaskStatus) -> ConductorError {
    ConductorError::InvalidTransition {
        id,
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn status_marker(status: SubtaskStatus) -> &'static str {
    match status {
        SubtaskStatus::Pending => "[ ]",
        SubtaskStatus::Ready => "[>]",
        SubtaskStatus::InProgress => "[~]",
        SubtaskStatus::Completed => "[x]",
        SubtaskStatus::Failed => "[!]",
        SubtaskStatus::Blocked => "[#]",
        SubtaskStatus::Skipped => "[-]",
    }
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
