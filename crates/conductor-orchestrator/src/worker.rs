use crate::executor::{ExecutionTask, TaskOutput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Availability of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Collaborating,
    Offline,
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Collaborating => write!(f, "collaborating"),
            WorkerStatus::Offline => write!(f, "offline"),
            WorkerStatus::Error => write!(f, "error"),
        }
    }
}

/// Rolling performance figures the router scores against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPerformance {
    /// `0.0..=1.0`. A worker with no history starts at `1.0`.
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tasks: u64,
    /// Incremented on failure, decremented on success, never below zero.
    pub recent_errors: u32,
    pub last_active: Option<DateTime<Utc>>,
}

impl Default for WorkerPerformance {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            total_tasks: 0,
            recent_errors: 0,
            last_active: None,
        }
    }
}

impl WorkerPerformance {
    /// Fold one outcome into the count-weighted averages.
    pub fn record(&mut self, success: bool, latency_ms: u64) {
        let n = self.total_tasks as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * n + outcome) / (n + 1.0);
        self.avg_latency_ms = (self.avg_latency_ms * n + latency_ms as f64) / (n + 1.0);
        self.total_tasks += 1;
        self.recent_errors = if success {
            self.recent_errors.saturating_sub(1)
        } else {
            self.recent_errors.saturating_add(1)
        };
        self.last_active = Some(Utc::now());
    }
}

/// What the router and pool know about a worker: declared identity plus live
/// status, load and performance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_load: u32,
    pub max_concurrent: u32,
    #[serde(default)]
    pub performance: WorkerPerformance,
}

impl WorkerProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            capabilities: Vec::new(),
            status: WorkerStatus::Idle,
            current_load: 0,
            max_concurrent: 3,
            performance: WorkerPerformance::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = status;
        self
    }

    /// `current_load / max_concurrent`, clamped to `0.0..=1.0`.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        (f64::from(self.current_load) / f64::from(self.max_concurrent)).min(1.0)
    }

    /// Idle or collaborating, and below its concurrency limit.
    pub fn is_available(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Collaborating)
            && self.current_load < self.max_concurrent
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }

    /// Whether the declared category/capabilities cover the task.
    pub fn covers(&self, category: &str, capabilities: &[String]) -> bool {
        if !capabilities.is_empty() {
            return capabilities.iter().all(|c| self.has_capability(c));
        }
        category == crate::types::DEFAULT_CATEGORY || self.category.eq_ignore_ascii_case(category)
    }
}

/// An execution endpoint. The orchestrator only looks at the descriptor and
/// never at a worker's internals.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Static description of the worker; the pool owns the live copy.
    fn descriptor(&self) -> WorkerProfile;

    /// Whether this worker accepts `task`.
    fn can_handle(&self, task: &ExecutionTask) -> bool {
        self.descriptor().covers(&task.category, &task.capabilities)
    }

    /// Run the task and report its output.
    async fn execute(&self, task: &ExecutionTask) -> ConductorResult<TaskOutput>;
}

struct PoolEntry {
    worker: Arc<dyn Worker>,
    profile: WorkerProfile,
}

/// Registered workers with their live load and performance.
///
/// Cheap to share behind an `Arc`; every method takes a short lock.
#[derive(Default)]
pub struct WorkerPool {
    entries: RwLock<HashMap<String, PoolEntry>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under its descriptor id, replacing any previous one.
    pub fn register(&self, worker: Arc<dyn Worker>) -> String {
        let profile = worker.descriptor();
        let id = profile.id.clone();
        let previous = self
            .entries
            .write()
            .insert(id.clone(), PoolEntry { worker, profile });
        if previous.is_some() {
            warn!(worker = %id, "Worker re-registered; previous entry replaced");
        } else {
            debug!(worker = %id, "Worker registered");
        }
        id
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Live profiles sorted by id.
    pub fn snapshot(&self) -> Vec<WorkerProfile> {
        let mut profiles: Vec<WorkerProfile> = self
            .entries
            .read()
            .values()
            .map(|e| e.profile.clone())
            .collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    pub fn profile(&self, id: &str) -> Option<WorkerProfile> {
        self.entries.read().get(id).map(|e| e.profile.clone())
    }

    pub fn worker(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.entries.read().get(id).map(|e| Arc::clone(&e.worker))
    }

    /// First worker (by id) that is not offline and accepts the task.
    pub fn find_capable(&self, task: &ExecutionTask) -> Option<Arc<dyn Worker>> {
        let entries = self.entries.read();
        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| entries.get(id))
            .find(|e| e.profile.status != WorkerStatus::Offline && e.worker.can_handle(task))
            .map(|e| Arc::clone(&e.worker))
    }

    pub fn set_status(&self, id: &str, status: WorkerStatus) -> ConductorResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| ConductorError::Worker(format!("Worker not found: {id}")))?;
        entry.profile.status = status;
        Ok(())
    }

    /// Count one more in-flight task against the worker.
    pub fn start_task(&self, id: &str) -> ConductorResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| ConductorError::Worker(format!("Worker not found: {id}")))?;
        if entry.profile.status == WorkerStatus::Offline {
            return Err(ConductorError::Worker(format!("Worker {id} is offline")));
        }
        let profile = &mut entry.profile;
        profile.current_load += 1;
        if profile.current_load >= profile.max_concurrent {
            profile.status = WorkerStatus::Busy;
        }
        Ok(())
    }

    /// Release one unit of load and fold the outcome into the performance
    /// figures.
    pub fn finish_task(&self, id: &str, success: bool, latency_ms: u64) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id) else {
            warn!(worker = %id, "finish_task for unknown worker");
            return;
        };
        let profile = &mut entry.profile;
        profile.current_load = profile.current_load.saturating_sub(1);
        profile.performance.record(success, latency_ms);
        if profile.status == WorkerStatus::Busy && profile.current_load < profile.max_concurrent
        {
            profile.status = WorkerStatus::Idle;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct EchoWorker {
        profile: WorkerProfile,
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn descriptor(&self) -> WorkerProfile {
            self.profile.clone()
        }

        async fn execute(&self, task: &ExecutionTask) -> ConductorResult<TaskOutput> {
            Ok(TaskOutput::success(
                serde_json::json!(task.description),
                "echoed",
            ))
        }
    }

    fn echo(id: &str, category: &str, caps: &[&str]) -> Arc<dyn Worker> {
        Arc::new(EchoWorker {
            profile: WorkerProfile::new(id, id.to_uppercase(), category)
                .with_capabilities(caps.iter().map(|c| c.to_string()).collect())
                .with_max_concurrent(2),
        })
    }

    #[test]
    fn test_performance_record() {
        let mut perf = WorkerPerformance::default();
        perf.record(true, 100);
        perf.record(false, 300);
        assert_eq!(perf.total_tasks, 2);
        assert!((perf.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((perf.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(perf.recent_errors, 1);
        assert!(perf.last_active.is_some());

        perf.record(true, 200);
        perf.record(true, 200);
        assert_eq!(perf.recent_errors, 0);
    }

    #[test]
    fn test_load_ratio_and_availability() {
        let mut profile = WorkerProfile::new("w", "W", "legal").with_max_concurrent(4);
        assert!(profile.is_available());
        profile.current_load = 2;
        assert!((profile.load_ratio() - 0.5).abs() < f64::EPSILON);
        profile.current_load = 4;
        assert!(!profile.is_available());
        assert!((profile.load_ratio() - 1.0).abs() < f64::EPSILON);

        let offline = WorkerProfile::new("o", "O", "legal").with_status(WorkerStatus::Offline);
        assert!(!offline.is_available());
    }

    #[test]
    fn test_covers() {
        let profile = WorkerProfile::new("legal", "Legal", "legal")
            .with_capabilities(vec!["contracts".into(), "Compliance".into()]);
        assert!(profile.covers("legal", &[]));
        assert!(profile.covers("general", &[]));
        assert!(!profile.covers("finance", &[]));
        assert!(profile.covers("other", &["compliance".into()]));
        assert!(!profile.covers("legal", &["api".into()]));
    }

    #[test]
    fn test_pool_load_tracking() {
        let pool = WorkerPool::new();
        pool.register(echo("legal", "legal", &["contracts"]));

        pool.start_task("legal").unwrap();
        assert_eq!(pool.profile("legal").unwrap().status, WorkerStatus::Idle);
        pool.start_task("legal").unwrap();
        let profile = pool.profile("legal").unwrap();
        assert_eq!(profile.current_load, 2);
        assert_eq!(profile.status, WorkerStatus::Busy);

        pool.finish_task("legal", true, 50);
        let profile = pool.profile("legal").unwrap();
        assert_eq!(profile.current_load, 1);
        assert_eq!(profile.status, WorkerStatus::Idle);
        assert_eq!(profile.performance.total_tasks, 1);
    }

    #[test]
    fn test_pool_unknown_and_offline() {
        let pool = WorkerPool::new();
        assert!(pool.start_task("ghost").is_err());

        pool.register(echo("legal", "legal", &[]));
        pool.set_status("legal", WorkerStatus::Offline).unwrap();
        assert!(pool.start_task("legal").is_err());
    }

    #[test]
    fn test_find_capable() {
        let pool = WorkerPool::new();
        pool.register(echo("builder", "engineering", &["api"]));
        pool.register(echo("legal", "legal", &["contracts"]));

        let task = ExecutionTask::new("Review NDA").with_capabilities(vec!["contracts".into()]);
        let worker = pool.find_capable(&task).unwrap();
        assert_eq!(worker.descriptor().id, "legal");

        let nobody = ExecutionTask::new("Fly").with_capabilities(vec!["aviation".into()]);
        assert!(pool.find_capable(&nobody).is_none());
    }

    #[test]
    fn test_snapshot_sorted() {
        let pool = WorkerPool::new();
        pool.register(echo("zeta", "x", &[]));
        pool.register(echo("alpha", "x", &[]));
        let ids: Vec<String> = pool.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_worker_execute() {
        let worker = echo("legal", "legal", &[]);
        let out = worker.execute(&ExecutionTask::new("hi")).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output, serde_json::json!("hi"));
    }
}
