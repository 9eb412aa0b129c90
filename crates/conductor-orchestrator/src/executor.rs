use crate::graph::TaskGraph;
use crate::router::RoutingDecision;
use crate::types::{Priority, Subtask};
use crate::worker::{Worker, WorkerPool};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, EventBus, OrchestrationEvent};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Limits and failure policies of the [`ParallelExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Semaphore permits shared by every task of a phase.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Stop scheduling further phases once a task in the current one fails.
    #[serde(default)]
    pub fail_fast: bool,
    /// A phase with some failures still counts as completed.
    #[serde(default = "default_isolate_errors")]
    pub isolate_errors: bool,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_isolate_errors() -> bool {
    true
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            fail_fast: false,
            isolate_errors: default_isolate_errors(),
        }
    }
}

/// `base * 2^attempt`, capped at `retry_max_delay_ms`.
fn compute_backoff(config: &ExecutorConfig, attempt: u32) -> u64 {
    let delay = config
        .retry_base_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(config.retry_max_delay_ms)
}

/// Status of one [`ExecutionTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Status of one [`ExecutionPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Overall status of an [`ExecutionPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    /// Finished with some failed or skipped tasks.
    PartialSuccess,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::PartialSuccess => write!(f, "partial_success"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a worker returns for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TaskOutput {
    pub fn success(output: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            output,
            message: message.into(),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: serde_json::Value::Null,
            message: error.clone(),
            error: Some(error),
            duration_ms: 0,
        }
    }
}

/// A subtask as scheduled by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub id: Uuid,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<TaskOutput>,
}

impl ExecutionTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            category: crate::types::DEFAULT_CATEGORY.to_string(),
            priority: Priority::Normal,
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            assigned_worker: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn from_subtask(subtask: &Subtask) -> Self {
        Self {
            id: subtask.id,
            description: subtask.description.clone(),
            category: subtask.category.clone(),
            priority: subtask.priority,
            capabilities: subtask.required_capabilities(),
            dependencies: subtask.dependencies.iter().copied().collect(),
            assigned_worker: subtask.assigned_worker.clone(),
            status: TaskStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    fn skip(&mut self) {
        self.status = TaskStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.result = Some(TaskOutput::failure(error));
    }
}

/// One graph layer worth of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPhase {
    pub index: usize,
    pub tasks: Vec<ExecutionTask>,
    /// Earlier phases holding at least one dependency of this phase's tasks.
    pub depends_on: Vec<usize>,
    pub status: PhaseStatus,
}

/// A task graph materialized as ordered phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Same id as the graph it was built from.
    pub id: Uuid,
    pub goal: String,
    pub phases: Vec<ExecutionPhase>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// One phase per graph layer.
    pub fn from_graph(graph: &TaskGraph) -> Self {
        let phase_of: HashMap<Uuid, usize> = graph
            .layers()
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| layer.iter().map(move |id| (*id, i)))
            .collect();

        let phases = graph
            .layers()
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                let tasks: Vec<ExecutionTask> = layer
                    .iter()
                    .filter_map(|id| graph.get(*id))
                    .map(ExecutionTask::from_subtask)
                    .collect();
                let depends_on: BTreeSet<usize> = tasks
                    .iter()
                    .flat_map(|t| t.dependencies.iter())
                    .filter_map(|dep| phase_of.get(dep).copied())
                    .collect();
                ExecutionPhase {
                    index,
                    tasks,
                    depends_on: depends_on.into_iter().collect(),
                    status: PhaseStatus::Pending,
                }
            })
            .collect();

        Self {
            id: graph.id(),
            goal: graph.goal().to_string(),
            phases,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &ExecutionTask> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task(&self, id: Uuid) -> Option<&ExecutionTask> {
        self.tasks().find(|t| t.id == id)
    }

    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks().filter(|t| t.status == status).count()
    }
}

/// Outcome of [`ParallelExecutor::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// The plan with every task's final state.
    pub plan: ExecutionPlan,
    pub status: ExecutionStatus,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_duration_ms: u64,
    pub summary: String,
}

impl ExecutionReport {
    pub fn success_rate(&self) -> f64 {
        let total = self.plan.task_count();
        if total == 0 {
            return 0.0;
        }
        self.completed as f64 / total as f64
    }

    /// Outputs of every task that produced one.
    pub fn outputs(&self) -> HashMap<Uuid, TaskOutput> {
        self.plan
            .tasks()
            .filter_map(|t| t.result.clone().map(|r| (t.id, r)))
            .collect()
    }
}

/// Runs an [`ExecutionPlan`] phase by phase against a [`WorkerPool`].
pub struct ParallelExecutor {
    config: ExecutorConfig,
    events: Option<EventBus>,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            events: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Publish progress on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether `plan_id` is currently executing.
    pub fn is_running(&self, plan_id: Uuid) -> bool {
        self.active.lock().contains_key(&plan_id)
    }

    /// Cancel an executing plan. In-flight tasks resolve as failed, tasks not
    /// started yet are skipped, completed results are kept.
    pub fn cancel_execution(&self, plan_id: Uuid) -> bool {
        match self.active.lock().get(&plan_id) {
            Some(token) => {
                info!(plan_id = %plan_id, "Cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Execute every phase of `plan` in order.
    ///
    /// Tasks inside a phase run concurrently, bounded by `max_concurrent`
    /// permits. `routing` maps task ids to workers; tasks without a decision
    /// go to the first pool worker that accepts them.
    pub async fn execute(
        &self,
        mut plan: ExecutionPlan,
        routing: &HashMap<Uuid, RoutingDecision>,
        pool: &WorkerPool,
    ) -> ExecutionReport {
        let start = Instant::now();
        let token = CancellationToken::new();
        self.active.lock().insert(plan.id, token.clone());
        plan.status = ExecutionStatus::Running;

        info!(
            plan_id = %plan.id,
            phases = plan.phases.len(),
            tasks = plan.task_count(),
            max_concurrent = self.config.max_concurrent,
            "Execution started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut finished: HashMap<Uuid, TaskStatus> = HashMap::new();
        let mut halted = false;

        for index in 0..plan.phases.len() {
            let gated = plan.phases[index]
                .depends_on
                .iter()
                .any(|d| plan.phases.get(*d).map(|p| p.status) != Some(PhaseStatus::Completed));

            if halted || gated || token.is_cancelled() {
                let phase = &mut plan.phases[index];
                debug!(plan_id = %plan.id, phase = index, halted, gated, "Phase skipped");
                phase.status = PhaseStatus::Skipped;
                for task in &mut phase.tasks {
                    task.skip();
                    finished.insert(task.id, TaskStatus::Skipped);
                }
                continue;
            }

            plan.phases[index].status = PhaseStatus::Running;
            self.publish(OrchestrationEvent::LayerStarted {
                plan_id: plan.id,
                layer: index,
                task_count: plan.phases[index].tasks.len(),
                timestamp: Utc::now(),
            });

            let mut runnable = Vec::new();
            for task in &mut plan.phases[index].tasks {
                let blocked_by = task
                    .dependencies
                    .iter()
                    .find(|dep| finished.get(dep) != Some(&TaskStatus::Completed));
                if let Some(dep) = blocked_by {
                    debug!(task_id = %task.id, dependency = %dep, "Dependency did not complete; skipping");
                    task.skip();
                } else {
                    runnable.push(task.clone());
                }
            }

            let outcomes = join_all(
                runnable
                    .into_iter()
                    .map(|task| self.run_task(plan.id, task, routing, pool, &semaphore, &token)),
            )
            .await;

            let phase = &mut plan.phases[index];
            for outcome in outcomes {
                if let Some(slot) = phase.tasks.iter_mut().find(|t| t.id == outcome.id) {
                    *slot = outcome;
                }
            }
            let succeeded = phase
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .count();
            let failed = phase
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .count();
            for task in &phase.tasks {
                finished.insert(task.id, task.status);
            }

            phase.status = if failed == 0 || self.config.isolate_errors {
                PhaseStatus::Completed
            } else {
                PhaseStatus::Failed
            };
            if failed > 0 && self.config.fail_fast {
                warn!(plan_id = %plan.id, phase = index, failed, "Fail-fast: halting remaining phases");
                halted = true;
            }

            self.publish(OrchestrationEvent::LayerCompleted {
                plan_id: plan.id,
                layer: index,
                succeeded,
                failed,
                timestamp: Utc::now(),
            });
        }

        self.active.lock().remove(&plan.id);

        let completed = plan.count(TaskStatus::Completed);
        let failed = plan.count(TaskStatus::Failed);
        let skipped = plan.count(TaskStatus::Skipped);
        plan.status = if token.is_cancelled() {
            self.publish(OrchestrationEvent::PlanCancelled {
                plan_id: plan.id,
                skipped,
                timestamp: Utc::now(),
            });
            ExecutionStatus::Cancelled
        } else if failed == 0 && skipped == 0 {
            ExecutionStatus::Completed
        } else if completed > 0 {
            ExecutionStatus::PartialSuccess
        } else {
            ExecutionStatus::Failed
        };

        let total_duration_ms = start.elapsed().as_millis() as u64;
        let summary = format!(
            "Execution {}: {completed}/{} tasks completed, {failed} failed, {skipped} skipped in {total_duration_ms}ms",
            plan.status,
            plan.task_count(),
        );
        info!(plan_id = %plan.id, status = %plan.status, completed, failed, skipped, "Execution finished");
        self.publish(OrchestrationEvent::PlanFinished {
            plan_id: plan.id,
            success: plan.status == ExecutionStatus::Completed,
            duration_ms: total_duration_ms,
            timestamp: Utc::now(),
        });

        ExecutionReport {
            status: plan.status,
            plan,
            completed,
            failed,
            skipped,
            total_duration_ms,
            summary,
        }
    }

    /// Acquire a permit, then run the task with timeout and retries.
    async fn run_task(
        &self,
        plan_id: Uuid,
        mut task: ExecutionTask,
        routing: &HashMap<Uuid, RoutingDecision>,
        pool: &WorkerPool,
        semaphore: &Arc<Semaphore>,
        token: &CancellationToken,
    ) -> ExecutionTask {
        if token.is_cancelled() {
            task.skip();
            return task;
        }

        let permit = tokio::select! {
            permit = Arc::clone(semaphore).acquire_owned() => permit,
            _ = token.cancelled() => {
                task.skip();
                return task;
            }
        };
        let Ok(_permit) = permit else {
            task.fail("Executor semaphore closed");
            return task;
        };

        let Some((worker_id, worker)) = resolve_worker(&task, routing, pool) else {
            error!(task_id = %task.id, "No worker can handle task");
            task.fail(format!("No worker available for task {}", task.id));
            self.publish_failure(plan_id, &task);
            return task;
        };

        task.assigned_worker = Some(worker_id.clone());
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.publish(OrchestrationEvent::SubtaskStarted {
            plan_id,
            subtask_id: task.id,
            worker_id: worker_id.clone(),
            timestamp: Utc::now(),
        });

        let task_start = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let attempt_start = Instant::now();
            let outcome = match pool.start_task(&worker_id) {
                Ok(()) => {
                    let outcome = self.attempt(worker.as_ref(), &task, token).await;
                    let ok = matches!(&outcome, Ok(out) if out.success);
                    pool.finish_task(&worker_id, ok, attempt_start.elapsed().as_millis() as u64);
                    outcome
                }
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(mut output) if output.success => {
                    output.duration_ms = task_start.elapsed().as_millis() as u64;
                    debug!(task_id = %task.id, worker = %worker_id, attempt, "Task completed");
                    self.publish(OrchestrationEvent::SubtaskCompleted {
                        plan_id,
                        subtask_id: task.id,
                        duration_ms: output.duration_ms,
                        timestamp: Utc::now(),
                    });
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(Utc::now());
                    task.result = Some(output);
                    return task;
                }
                Ok(output) => ConductorError::SubtaskExecutionFailed(
                    output.error.unwrap_or(output.message),
                ),
                Err(e) => e,
            };

            let exhausted = attempt >= self.config.max_retries;
            if exhausted || !error.is_retryable() {
                warn!(
                    task_id = %task.id,
                    worker = %worker_id,
                    attempts = attempt + 1,
                    error = %error,
                    "Task failed"
                );
                task.fail(error.to_string());
                self.publish_failure(plan_id, &task);
                return task;
            }

            let delay_ms = compute_backoff(&self.config, attempt);
            attempt += 1;
            task.retry_count = attempt;
            warn!(task_id = %task.id, attempt, delay_ms, error = %error, "Task attempt failed; retrying");
            self.publish(OrchestrationEvent::TaskRetrying {
                plan_id,
                task_id: task.id,
                attempt,
                delay_ms,
                timestamp: Utc::now(),
            });

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = token.cancelled() => {
                    task.fail(ConductorError::TaskCancelled.to_string());
                    self.publish_failure(plan_id, &task);
                    return task;
                }
            }
        }
    }

    /// One attempt: the worker call raced against the timeout and the plan's
    /// cancellation token.
    async fn attempt(
        &self,
        worker: &dyn Worker,
        task: &ExecutionTask,
        token: &CancellationToken,
    ) -> ConductorResult<TaskOutput> {
        let timeout_ms = self.config.task_timeout_ms;
        tokio::select! {
            result = tokio::time::timeout(Duration::from_millis(timeout_ms), worker.execute(task)) => {
                result.unwrap_or(Err(ConductorError::TaskTimeout(timeout_ms)))
            }
            _ = token.cancelled() => Err(ConductorError::TaskCancelled),
        }
    }

    fn publish_failure(&self, plan_id: Uuid, task: &ExecutionTask) {
        let error = task
            .result
            .as_ref()
            .and_then(|r| r.error.clone())
            .unwrap_or_default();
        self.publish(OrchestrationEvent::SubtaskFailed {
            plan_id,
            subtask_id: task.id,
            error,
            blocked: 0,
            timestamp: Utc::now(),
        });
    }

    fn publish(&self, event: OrchestrationEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

/// Routed worker if it is registered; otherwise the first capable one.
fn resolve_worker(
    task: &ExecutionTask,
    routing: &HashMap<Uuid, RoutingDecision>,
    pool: &WorkerPool,
) -> Option<(String, Arc<dyn Worker>)> {
    let routed = routing
        .get(&task.id)
        .map(|d| d.worker_id.as_str())
        .or(task.assigned_worker.as_deref());
    if let Some(id) = routed {
        if let Some(worker) = pool.worker(id) {
            return Some((id.to_string(), worker));
        }
        warn!(task_id = %task.id, worker = %id, "Routed worker not registered; falling back");
    }
    pool.find_capable(task)
        .map(|worker| (worker.descriptor().id, worker))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::SubtaskOptions;
    use crate::worker::WorkerProfile;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Sleeps briefly, tracks peak concurrency, fails tasks whose description
    /// contains "fail" until `fail_times` attempts have been made.
    struct ScriptedWorker {
        id: String,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicU32,
        fail_times: u32,
        delay_ms: u64,
    }

    impl ScriptedWorker {
        fn new(id: &str, fail_times: u32) -> Self {
            Self {
                id: id.to_string(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicU32::new(0),
                fail_times,
                delay_ms: 20,
            }
        }
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn descriptor(&self) -> WorkerProfile {
            WorkerProfile::new(&self.id, &self.id, "general").with_max_concurrent(10)
        }

        async fn execute(&self, task: &ExecutionTask) -> ConductorResult<TaskOutput> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if task.description.contains("fail") {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.fail_times {
                    return Err(ConductorError::Worker("transient glitch".into()));
                }
            }
            if task.description.contains("forbidden") {
                self.calls.fetch_add(1, Ordering::SeqCst);
                return Err(ConductorError::Worker("403 forbidden".into()));
            }
            Ok(TaskOutput::success(
                serde_json::json!(task.description),
                "done",
            ))
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent: 2,
            task_timeout_ms: 1_000,
            max_retries: 2,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 10,
            ..ExecutorConfig::default()
        }
    }

    fn pool_with(worker: Arc<ScriptedWorker>) -> WorkerPool {
        let pool = WorkerPool::new();
        pool.register(worker);
        pool
    }

    #[test]
    fn test_compute_backoff() {
        let config = ExecutorConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 500,
            ..ExecutorConfig::default()
        };
        assert_eq!(compute_backoff(&config, 0), 100);
        assert_eq!(compute_backoff(&config, 1), 200);
        assert_eq!(compute_backoff(&config, 2), 400);
        assert_eq!(compute_backoff(&config, 3), 500);
    }

    #[test]
    fn test_config_defaults_from_toml_like_json() {
        let config: ExecutorConfig = serde_json::from_str("{\"fail_fast\": true}").unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.task_timeout_ms, 60_000);
        assert_eq!(config.max_retries, 2);
        assert!(config.fail_fast);
        assert!(config.isolate_errors);
    }

    #[test]
    fn test_plan_from_graph() {
        let mut graph = TaskGraph::new("g");
        let a = graph.add_subtask("a", SubtaskOptions::new()).unwrap();
        let b = graph
            .add_subtask("b", SubtaskOptions::new().with_dependencies(vec![a]))
            .unwrap();
        graph
            .add_subtask("c", SubtaskOptions::new().with_dependencies(vec![a, b]))
            .unwrap();

        let plan = ExecutionPlan::from_graph(&graph);
        assert_eq!(plan.id, graph.id());
        assert_eq!(plan.phases.len(), 3);
        assert!(plan.phases[0].depends_on.is_empty());
        assert_eq!(plan.phases[1].depends_on, vec![0]);
        assert_eq!(plan.phases[2].depends_on, vec![0, 1]);
        assert_eq!(plan.task_count(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_bound_with_failure() {
        let mut graph = TaskGraph::new("three in one layer");
        graph.add_subtask("one", SubtaskOptions::new()).unwrap();
        graph.add_subtask("two", SubtaskOptions::new()).unwrap();
        graph.add_subtask("three fail", SubtaskOptions::new()).unwrap();

        let worker = Arc::new(ScriptedWorker::new("w", u32::MAX));
        let pool = pool_with(Arc::clone(&worker));
        let executor = ParallelExecutor::new(fast_config());

        let report = executor
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;

        assert!(worker.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.status, ExecutionStatus::PartialSuccess);
        let failed = report
            .plan
            .tasks()
            .find(|t| t.status == TaskStatus::Failed)
            .unwrap();
        assert_eq!(failed.retry_count, 2);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let mut graph = TaskGraph::new("g");
        graph.add_subtask("fail once", SubtaskOptions::new()).unwrap();
        let worker = Arc::new(ScriptedWorker::new("w", 1));
        let pool = pool_with(Arc::clone(&worker));

        let report = ParallelExecutor::new(fast_config())
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        let task = report.plan.tasks().next().unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(pool.profile("w").unwrap().performance.total_tasks, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mut graph = TaskGraph::new("g");
        graph.add_subtask("forbidden op", SubtaskOptions::new()).unwrap();
        let worker = Arc::new(ScriptedWorker::new("w", 0));
        let pool = pool_with(Arc::clone(&worker));

        let report = ParallelExecutor::new(fast_config())
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.plan.tasks().next().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_dependents_of_failure_skipped() {
        let mut graph = TaskGraph::new("g");
        let a = graph.add_subtask("fail root", SubtaskOptions::new()).unwrap();
        let b = graph
            .add_subtask("child", SubtaskOptions::new().with_dependencies(vec![a]))
            .unwrap();
        let other = graph.add_subtask("independent", SubtaskOptions::new()).unwrap();

        let worker = Arc::new(ScriptedWorker::new("w", u32::MAX));
        let pool = pool_with(Arc::clone(&worker));
        let report = ParallelExecutor::new(fast_config())
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;

        assert_eq!(report.plan.task(a).unwrap().status, TaskStatus::Failed);
        assert_eq!(report.plan.task(b).unwrap().status, TaskStatus::Skipped);
        assert_eq!(report.plan.task(other).unwrap().status, TaskStatus::Completed);
        assert!(report.plan.task(b).unwrap().started_at.is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_halts_later_phases() {
        let mut graph = TaskGraph::new("g");
        let a = graph.add_subtask("fail root", SubtaskOptions::new()).unwrap();
        let sibling = graph.add_subtask("sibling", SubtaskOptions::new()).unwrap();
        let b = graph.add_subtask("next", SubtaskOptions::new()).unwrap();
        graph.add_dependency(b, sibling).unwrap();

        let worker = Arc::new(ScriptedWorker::new("w", u32::MAX));
        let pool = pool_with(Arc::clone(&worker));
        let config = ExecutorConfig {
            fail_fast: true,
            ..fast_config()
        };
        let report = ParallelExecutor::new(config)
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;

        assert_eq!(report.plan.task(a).unwrap().status, TaskStatus::Failed);
        assert_eq!(report.plan.task(b).unwrap().status, TaskStatus::Skipped);
        assert_eq!(report.plan.phases[1].status, PhaseStatus::Skipped);
    }

    #[tokio::test]
    async fn test_without_isolation_failed_phase_gates_next() {
        let mut graph = TaskGraph::new("g");
        let a = graph.add_subtask("fail root", SubtaskOptions::new()).unwrap();
        let ok = graph.add_subtask("ok", SubtaskOptions::new()).unwrap();
        let b = graph
            .add_subtask("after ok", SubtaskOptions::new().with_dependencies(vec![ok]))
            .unwrap();

        let worker = Arc::new(ScriptedWorker::new("w", u32::MAX));
        let pool = pool_with(Arc::clone(&worker));
        let isolated = ParallelExecutor::new(fast_config())
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;
        assert_eq!(isolated.plan.task(b).unwrap().status, TaskStatus::Completed);

        let config = ExecutorConfig {
            isolate_errors: false,
            ..fast_config()
        };
        let strict = ParallelExecutor::new(config)
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;
        assert_eq!(strict.plan.phases[0].status, PhaseStatus::Failed);
        assert_eq!(strict.plan.task(a).unwrap().status, TaskStatus::Failed);
        assert_eq!(strict.plan.task(b).unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_timeout_fails_task() {
        let mut graph = TaskGraph::new("g");
        graph.add_subtask("slow", SubtaskOptions::new()).unwrap();
        let mut slow = ScriptedWorker::new("w", 0);
        slow.delay_ms = 200;
        let pool = pool_with(Arc::new(slow));
        let config = ExecutorConfig {
            task_timeout_ms: 10,
            max_retries: 0,
            ..fast_config()
        };

        let report = ParallelExecutor::new(config)
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;
        let task = report.plan.tasks().next().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .result
            .as_ref()
            .unwrap()
            .error
            .as_ref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_execution() {
        let mut graph = TaskGraph::new("g");
        let a = graph.add_subtask("slow", SubtaskOptions::new()).unwrap();
        let b = graph
            .add_subtask("later", SubtaskOptions::new().with_dependencies(vec![a]))
            .unwrap();
        let mut slow = ScriptedWorker::new("w", 0);
        slow.delay_ms = 5_000;
        let pool = pool_with(Arc::new(slow));
        let executor = Arc::new(ParallelExecutor::new(fast_config()));
        let plan = ExecutionPlan::from_graph(&graph);
        let plan_id = plan.id;

        let routing = HashMap::new();
        let canceller = Arc::clone(&executor);
        let cancel = async move {
            while !canceller.is_running(plan_id) {
                tokio::task::yield_now().await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(canceller.cancel_execution(plan_id));
        };
        let (report, ()) = tokio::join!(executor.execute(plan, &routing, &pool), cancel);

        assert_eq!(report.status, ExecutionStatus::Cancelled);
        assert_eq!(report.plan.task(a).unwrap().status, TaskStatus::Failed);
        assert_eq!(report.plan.task(b).unwrap().status, TaskStatus::Skipped);
        assert!(!executor.is_running(plan_id));
        assert!(!executor.cancel_execution(plan_id));
    }

    #[tokio::test]
    async fn test_no_worker_fails_task() {
        let mut graph = TaskGraph::new("g");
        graph
            .add_subtask(
                "fly",
                SubtaskOptions::new().with_capabilities(vec!["aviation".into()]),
            )
            .unwrap();
        let pool = pool_with(Arc::new(ScriptedWorker::new("w", 0)));
        let report = ParallelExecutor::new(fast_config())
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_events_published() {
        let mut graph = TaskGraph::new("g");
        graph.add_subtask("one", SubtaskOptions::new()).unwrap();
        let pool = pool_with(Arc::new(ScriptedWorker::new("w", 0)));
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let report = ParallelExecutor::new(fast_config())
            .with_events(bus)
            .execute(ExecutionPlan::from_graph(&graph), &HashMap::new(), &pool)
            .await;
        assert_eq!(report.status, ExecutionStatus::Completed);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "layer_started",
                "subtask_started",
                "subtask_completed",
                "layer_completed",
                "plan_finished"
            ]
        );
    }
}
