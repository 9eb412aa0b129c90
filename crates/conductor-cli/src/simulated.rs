//! Stand-in workers for running plans from the command line.

use crate::config::WorkerConfig;
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use conductor_orchestrator::{ExecutionTask, TaskOutput, Worker, WorkerPool, WorkerProfile};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sleeps for its configured latency and echoes the task back.
pub struct SimulatedWorker {
    profile: WorkerProfile,
    latency: Duration,
    fail_on: Vec<String>,
}

impl SimulatedWorker {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            profile: config.profile(),
            latency: Duration::from_millis(config.latency_ms),
            fail_on: config.fail_on.iter().map(|w| w.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl Worker for SimulatedWorker {
    fn descriptor(&self) -> WorkerProfile {
        self.profile.clone()
    }

    async fn execute(&self, task: &ExecutionTask) -> ConductorResult<TaskOutput> {
        debug!(worker = %self.profile.id, task_id = %task.id, "Simulating task");
        tokio::time::sleep(self.latency).await;

        let description = task.description.to_lowercase();
        if let Some(word) = self.fail_on.iter().find(|w| description.contains(w.as_str())) {
            return Err(ConductorError::Worker(format!(
                "{} refused task containing '{word}'",
                self.profile.id
            )));
        }

        Ok(TaskOutput::success(
            serde_json::json!({
                "worker": self.profile.id,
                "task": task.description,
            }),
            format!("{} handled the task", self.profile.name),
        ))
    }
}

/// A pool holding one simulated worker per config entry.
pub fn build_pool(workers: &[WorkerConfig]) -> WorkerPool {
    let pool = WorkerPool::new();
    for config in workers {
        pool.register(Arc::new(SimulatedWorker::new(config)));
    }
    pool
}
