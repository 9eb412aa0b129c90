use crate::executor::ExecutionTask;
use crate::store::RoutingLog;
use crate::types::{Priority, Subtask, DEFAULT_CATEGORY};
use crate::worker::{WorkerProfile, WorkerStatus};
use chrono::{DateTime, Duration, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CAPABILITY_WEIGHT: f64 = 0.30;
const NO_CAPABILITY_SCORE: f64 = 0.15;
const SUCCESS_WEIGHT: f64 = 0.20;
const LOAD_WEIGHT: f64 = 0.15;
const RECENT_BONUS: f64 = 0.10;
const WARM_BONUS: f64 = 0.05;
const PREFERRED_BONUS: f64 = 0.10;
const ERROR_PENALTY: f64 = 0.10;

/// Router tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Alternatives reported next to the top choice.
    #[serde(default = "default_max_alternatives")]
    pub max_alternatives: usize,
    /// Score multiplier at full load is `1 - load_balance_factor`.
    #[serde(default = "default_load_balance_factor")]
    pub load_balance_factor: f64,
    /// Confidence reported for fallback decisions.
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
    /// Workers with more unresolved errors than this are penalised.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

fn default_max_alternatives() -> usize {
    3
}

fn default_load_balance_factor() -> f64 {
    0.5
}

fn default_fallback_confidence() -> f64 {
    0.1
}

fn default_error_threshold() -> u32 {
    2
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_alternatives: default_max_alternatives(),
            load_balance_factor: default_load_balance_factor(),
            fallback_confidence: default_fallback_confidence(),
            error_threshold: default_error_threshold(),
        }
    }
}

/// The router's view of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingTask {
    pub id: Uuid,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl RoutingTask {
    pub fn new(description: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            category: category.into(),
            capabilities: Vec::new(),
            priority: Priority::Normal,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&Subtask> for RoutingTask {
    fn from(subtask: &Subtask) -> Self {
        Self {
            id: subtask.id,
            description: subtask.description.clone(),
            category: subtask.category.clone(),
            capabilities: subtask.required_capabilities(),
            priority: subtask.priority,
        }
    }
}

impl From<&ExecutionTask> for RoutingTask {
    fn from(task: &ExecutionTask) -> Self {
        Self {
            id: task.id,
            description: task.description.clone(),
            category: task.category.clone(),
            capabilities: task.capabilities.clone(),
            priority: task.priority,
        }
    }
}

/// Caller-supplied routing constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingContext {
    /// Worker ids that must not be chosen.
    #[serde(default)]
    pub excluded: Vec<String>,
    /// Worker ids that get a bonus.
    #[serde(default)]
    pub preferred: Vec<String>,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude(mut self, worker_id: impl Into<String>) -> Self {
        self.excluded.push(worker_id.into());
        self
    }

    pub fn prefer(mut self, worker_id: impl Into<String>) -> Self {
        self.preferred.push(worker_id.into());
        self
    }

    fn is_excluded(&self, worker_id: &str) -> bool {
        self.excluded.iter().any(|w| w == worker_id)
    }

    fn is_preferred(&self, worker_id: &str) -> bool {
        self.preferred.iter().any(|w| w == worker_id)
    }
}

/// A runner-up in a routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingAlternative {
    pub worker_id: String,
    pub worker_name: String,
    pub score: f64,
}

/// Which worker gets a task, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_id: Uuid,
    pub worker_id: String,
    pub worker_name: String,
    /// Final score of the chosen worker, `0.0..=1.0`.
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<RoutingAlternative>,
    /// `true` when no scored candidate existed and any worker was picked.
    #[serde(default)]
    pub fallback: bool,
    pub decided_at: DateTime<Utc>,
}

struct Scored<'a> {
    worker: &'a WorkerProfile,
    score: f64,
    reasons: Vec<String>,
}

/// Scores candidate workers for a task and picks the best one.
pub struct AgentRouter {
    config: RouterConfig,
    log: Arc<RoutingLog>,
}

impl AgentRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self::with_log(config, Arc::new(RoutingLog::default()))
    }

    /// Use a caller-owned routing log.
    pub fn with_log(config: RouterConfig, log: Arc<RoutingLog>) -> Self {
        Self { config, log }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<RoutingLog> {
        &self.log
    }

    /// Pick a worker for `task` among `candidates`.
    ///
    /// Only fails when `candidates` holds no usable worker at all; otherwise
    /// a low-confidence fallback is returned when nothing scores.
    pub fn route(
        &self,
        task: &RoutingTask,
        candidates: &[WorkerProfile],
        context: &RoutingContext,
    ) -> ConductorResult<RoutingDecision> {
        let decision = self.decide(task, candidates, context)?;
        info!(
            task_id = %task.id,
            worker = %decision.worker_id,
            confidence = decision.confidence,
            fallback = decision.fallback,
            "Task routed"
        );
        self.log.record(decision.clone());
        Ok(decision)
    }

    /// Route several tasks, highest priority first.
    ///
    /// Each assignment counts as load on the chosen worker for the rest of the
    /// batch, so later tasks spread out instead of piling onto one worker.
    /// Tasks that cannot be routed at all are skipped with a warning.
    pub fn route_batch(
        &self,
        tasks: &[RoutingTask],
        workers: &[WorkerProfile],
        context: &RoutingContext,
    ) -> Vec<RoutingDecision> {
        let mut ordered: Vec<&RoutingTask> = tasks.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut simulated: Vec<WorkerProfile> = workers.to_vec();
        let mut decisions = Vec::with_capacity(tasks.len());

        for task in ordered {
            match self.route(task, &simulated, context) {
                Ok(decision) => {
                    if let Some(worker) = simulated.iter_mut().find(|w| w.id == decision.worker_id)
                    {
                        worker.current_load += 1;
                    }
                    decisions.push(decision);
                }
                Err(e) => warn!(task_id = %task.id, error = %e, "Task could not be routed"),
            }
        }
        decisions
    }

    /// Fold an outcome into a worker's performance figures.
    pub fn update_agent_metrics(&self, worker: &mut WorkerProfile, success: bool, latency_ms: u64) {
        worker.performance.record(success, latency_ms);
        debug!(
            worker = %worker.id,
            success_rate = worker.performance.success_rate,
            recent_errors = worker.performance.recent_errors,
            "Worker metrics updated"
        );
    }

    fn decide(
        &self,
        task: &RoutingTask,
        candidates: &[WorkerProfile],
        context: &RoutingContext,
    ) -> ConductorResult<RoutingDecision> {
        let eligible: Vec<&WorkerProfile> = candidates
            .iter()
            .filter(|w| !context.is_excluded(&w.id) && w.is_available())
            .collect();

        let by_category: Vec<&WorkerProfile> = eligible
            .iter()
            .copied()
            .filter(|w| w.category.eq_ignore_ascii_case(&task.category))
            .collect();

        let pool = if !by_category.is_empty() {
            by_category
        } else if !task.capabilities.is_empty() {
            eligible
                .iter()
                .copied()
                .filter(|w| task.capabilities.iter().any(|c| w.has_capability(c)))
                .collect()
        } else if task.category == DEFAULT_CATEGORY {
            eligible.clone()
        } else {
            Vec::new()
        };

        if pool.is_empty() {
            return self.fallback(task, &eligible, candidates, context);
        }

        let now = Utc::now();
        let mut scored: Vec<Scored<'_>> = pool
            .into_iter()
            .map(|worker| self.score(task, worker, context, now))
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.worker.id.cmp(&b.worker.id))
        });

        let mut ranked = scored.into_iter();
        let Some(best) = ranked.next() else {
            return self.fallback(task, &eligible, candidates, context);
        };
        let alternatives = ranked
            .take(self.config.max_alternatives)
            .map(|s| RoutingAlternative {
                worker_id: s.worker.id.clone(),
                worker_name: s.worker.name.clone(),
                score: s.score,
            })
            .collect();

        Ok(RoutingDecision {
            task_id: task.id,
            worker_id: best.worker.id.clone(),
            worker_name: best.worker.name.clone(),
            confidence: best.score,
            reasoning: format!("Selected {}: {}", best.worker.name, best.reasons.join(", ")),
            alternatives,
            fallback: false,
            decided_at: now,
        })
    }

    fn score<'a>(
        &self,
        task: &RoutingTask,
        worker: &'a WorkerProfile,
        context: &RoutingContext,
        now: DateTime<Utc>,
    ) -> Scored<'a> {
        let mut reasons = Vec::new();
        let mut score = 0.0;

        if task.capabilities.is_empty() {
            score += NO_CAPABILITY_SCORE;
        } else {
            let matched = task
                .capabilities
                .iter()
                .filter(|c| worker.has_capability(c))
                .count();
            score += CAPABILITY_WEIGHT * matched as f64 / task.capabilities.len() as f64;
            reasons.push(format!(
                "capabilities {matched}/{}",
                task.capabilities.len()
            ));
        }

        let success_rate = worker.performance.success_rate.clamp(0.0, 1.0);
        score += SUCCESS_WEIGHT * success_rate;
        reasons.push(format!("success rate {:.0}%", success_rate * 100.0));

        let load_ratio = worker.load_ratio();
        score += LOAD_WEIGHT * (1.0 - load_ratio);
        reasons.push(format!(
            "load {}/{}",
            worker.current_load, worker.max_concurrent
        ));

        if let Some(last_active) = worker.performance.last_active {
            let idle_for = now.signed_duration_since(last_active);
            if idle_for < Duration::minutes(5) {
                score += RECENT_BONUS;
                reasons.push("recently active".to_string());
            } else if idle_for < Duration::minutes(30) {
                score += WARM_BONUS;
            }
        }

        if context.is_preferred(&worker.id) {
            score += PREFERRED_BONUS;
            reasons.push("preferred".to_string());
        }

        if worker.performance.recent_errors > self.config.error_threshold {
            score -= ERROR_PENALTY;
            reasons.push(format!(
                "{} recent errors",
                worker.performance.recent_errors
            ));
        }

        let score = score.clamp(0.0, 1.0) * (1.0 - self.config.load_balance_factor * load_ratio);
        Scored {
            worker,
            score,
            reasons,
        }
    }

    /// Any usable worker, least loaded first, with low confidence.
    fn fallback(
        &self,
        task: &RoutingTask,
        eligible: &[&WorkerProfile],
        candidates: &[WorkerProfile],
        context: &RoutingContext,
    ) -> ConductorResult<RoutingDecision> {
        let chosen = least_loaded(eligible.iter().copied()).or_else(|| {
            least_loaded(
                candidates
                    .iter()
                    .filter(|w| !context.is_excluded(&w.id) && w.status != WorkerStatus::Offline),
            )
        });

        let Some(worker) = chosen else {
            return Err(ConductorError::Worker(format!(
                "No worker available for task {}",
                task.id
            )));
        };

        warn!(task_id = %task.id, worker = %worker.id, "No matching worker; using fallback");
        Ok(RoutingDecision {
            task_id: task.id,
            worker_id: worker.id.clone(),
            worker_name: worker.name.clone(),
            confidence: self.config.fallback_confidence,
            reasoning: format!(
                "Fallback: no available worker matches category '{}'; assigned {}",
                task.category, worker.name
            ),
            alternatives: Vec::new(),
            fallback: true,
            decided_at: Utc::now(),
        })
    }
}

fn least_loaded<'a>(
    workers: impl Iterator<Item = &'a WorkerProfile>,
) -> Option<&'a WorkerProfile> {
    workers.min_by(|a, b| {
        a.load_ratio()
            .total_cmp(&b.load_ratio())
            .then_with(|| a.id.cmp(&b.id))
    })
}

impl Default for AgentRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn worker(id: &str, category: &str, caps: &[&str]) -> WorkerProfile {
        let mut profile = WorkerProfile::new(id, id, category)
            .with_capabilities(caps.iter().map(|c| c.to_string()).collect())
            .with_max_concurrent(4);
        profile.performance.last_active = Some(Utc::now());
        profile
    }

    fn contracts_task() -> RoutingTask {
        RoutingTask::new("Review the supplier contract", "legal")
            .with_capabilities(vec!["contracts".into()])
    }

    #[test]
    fn test_legal_worker_wins_contracts() {
        let router = AgentRouter::default();
        let workers = vec![
            worker("LegalWorker", "legal", &["contracts"]),
            worker("BuilderWorker", "engineering", &["api"]),
        ];

        let decision = router
            .route(&contracts_task(), &workers, &RoutingContext::new())
            .unwrap();
        assert_eq!(decision.worker_id, "LegalWorker");
        assert!(decision.confidence >= 0.65, "confidence {}", decision.confidence);
        assert!(!decision.fallback);
        assert_eq!(router.log().len(), 1);
    }

    #[test]
    fn test_capability_match_across_categories() {
        let router = AgentRouter::default();
        let workers = vec![
            worker("BuilderWorker", "engineering", &["api"]),
            worker("LegalWorker", "legal", &["contracts"]),
        ];
        let task = RoutingTask::new("Check clause", "general")
            .with_capabilities(vec!["contracts".into()]);
        let decision = router.route(&task, &workers, &RoutingContext::new()).unwrap();
        assert_eq!(decision.worker_id, "LegalWorker");
    }

    #[test]
    fn test_routing_is_deterministic() {
        let router = AgentRouter::default();
        let workers = vec![
            worker("b", "legal", &["contracts"]),
            worker("a", "legal", &["contracts"]),
            worker("c", "legal", &["contracts"]),
        ];
        let task = contracts_task();
        let first = router.route(&task, &workers, &RoutingContext::new()).unwrap();
        let second = router.route(&task, &workers, &RoutingContext::new()).unwrap();
        assert_eq!(first.worker_id, second.worker_id);
        assert_eq!(first.confidence, second.confidence);
        // Equal scores fall back to id order.
        assert_eq!(first.worker_id, "a");
        assert_eq!(first.alternatives.len(), 2);
    }

    #[test]
    fn test_alternatives_capped() {
        let router = AgentRouter::default();
        let workers: Vec<WorkerProfile> = (0..6)
            .map(|i| worker(&format!("w{i}"), "legal", &["contracts"]))
            .collect();
        let decision = router
            .route(&contracts_task(), &workers, &RoutingContext::new())
            .unwrap();
        assert_eq!(decision.alternatives.len(), 3);
    }

    #[test]
    fn test_excluded_and_busy_filtered() {
        let router = AgentRouter::default();
        let mut busy = worker("busy", "legal", &["contracts"]);
        busy.current_load = busy.max_concurrent;
        let workers = vec![
            worker("excluded", "legal", &["contracts"]),
            busy,
            worker("free", "legal", &["contracts"]),
        ];
        let decision = router
            .route(
                &contracts_task(),
                &workers,
                &RoutingContext::new().exclude("excluded"),
            )
            .unwrap();
        assert_eq!(decision.worker_id, "free");
        assert!(decision.alternatives.is_empty());
    }

    #[test]
    fn test_fallback_when_nothing_matches() {
        let router = AgentRouter::default();
        let workers = vec![worker("builder", "engineering", &["api"])];
        let task = RoutingTask::new("Translate", "translation")
            .with_capabilities(vec!["spanish".into()]);
        let decision = router.route(&task, &workers, &RoutingContext::new()).unwrap();
        assert!(decision.fallback);
        assert_eq!(decision.worker_id, "builder");
        assert!((decision.confidence - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fallback_when_all_saturated() {
        let router = AgentRouter::default();
        let mut only = worker("only", "legal", &["contracts"]);
        only.current_load = only.max_concurrent;
        let decision = router
            .route(&contracts_task(), &[only], &RoutingContext::new())
            .unwrap();
        assert!(decision.fallback);
        assert_eq!(decision.worker_id, "only");
    }

    #[test]
    fn test_no_workers_is_error() {
        let router = AgentRouter::default();
        assert!(router
            .route(&contracts_task(), &[], &RoutingContext::new())
            .is_err());

        let offline = worker("off", "legal", &[]).with_status(WorkerStatus::Offline);
        assert!(router
            .route(&contracts_task(), &[offline], &RoutingContext::new())
            .is_err());
    }

    #[test]
    fn test_load_balancing_prefers_less_loaded() {
        let router = AgentRouter::default();
        let mut loaded = worker("a-loaded", "legal", &["contracts"]);
        loaded.current_load = 2;
        let workers = vec![loaded, worker("b-free", "legal", &["contracts"])];
        let decision = router
            .route(&contracts_task(), &workers, &RoutingContext::new())
            .unwrap();
        assert_eq!(decision.worker_id, "b-free");
        assert!(decision.alternatives[0].score < decision.confidence);
    }

    #[test]
    fn test_preferred_and_error_penalty() {
        let router = AgentRouter::default();
        let mut flaky = worker("a-flaky", "legal", &["contracts"]);
        flaky.performance.recent_errors = 3;
        let workers = vec![flaky, worker("b-steady", "legal", &["contracts"])];

        let decision = router
            .route(&contracts_task(), &workers, &RoutingContext::new())
            .unwrap();
        assert_eq!(decision.worker_id, "b-steady");

        let decision = router
            .route(
                &contracts_task(),
                &workers,
                &RoutingContext::new().prefer("a-flaky").prefer("b-steady"),
            )
            .unwrap();
        assert_eq!(decision.worker_id, "b-steady");
        assert!(decision.reasoning.contains("preferred"));
    }

    #[test]
    fn test_route_batch_spreads_load() {
        let router = AgentRouter::default();
        let mut a = worker("a", "legal", &["contracts"]);
        let mut b = worker("b", "legal", &["contracts"]);
        a.max_concurrent = 1;
        b.max_concurrent = 1;

        let tasks = vec![
            contracts_task(),
            contracts_task().with_priority(Priority::Urgent),
        ];
        let decisions = router.route_batch(&tasks, &[a, b], &RoutingContext::new());

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].task_id, tasks[1].id);
        assert_ne!(decisions[0].worker_id, decisions[1].worker_id);
        assert!(decisions.iter().all(|d| !d.fallback));
    }

    #[test]
    fn test_update_agent_metrics() {
        let router = AgentRouter::default();
        let mut profile = WorkerProfile::new("w", "W", "legal");
        router.update_agent_metrics(&mut profile, false, 100);
        router.update_agent_metrics(&mut profile, false, 100);
        router.update_agent_metrics(&mut profile, true, 400);
        assert_eq!(profile.performance.total_tasks, 3);
        assert_eq!(profile.performance.recent_errors, 1);
        assert!((profile.performance.avg_latency_ms - 200.0).abs() < 1e-9);
        assert!((profile.performance.success_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_routing_task_from_subtask() {
        use crate::types::SubtaskOptions;
        let subtask = Subtask::new(
            "Review",
            SubtaskOptions::new()
                .with_category("legal")
                .with_priority(Priority::High),
        );
        let task = RoutingTask::from(&subtask);
        assert_eq!(task.id, subtask.id);
        assert_eq!(task.capabilities, vec!["legal"]);
        assert_eq!(task.priority, Priority::High);
    }
}
