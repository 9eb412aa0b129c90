use crate::graph::TaskGraph;
use crate::oracle::{ComplexityAssessment, Decomposition, ReasoningOracle};
use crate::replanner::{RecoveryStrategy, ReplanResult, Replanner, DEFAULT_MAX_REPLAN_ATTEMPTS};
use crate::store::{PlanRecord, PlanStats, PlanStore};
use crate::types::{
    ComplexityLevel, GraphStatus, Subtask, SubtaskOptions, SubtaskResult, SubtaskStatus,
    VerificationKind, VerificationResult,
};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult, EventBus, OrchestrationEvent};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker id recorded on subtasks run through [`Planner::execute_plan`]
/// when the subtask carries no assignment of its own.
pub const DIRECT_WORKER: &str = "direct";

/// Planner behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Replans allowed per subtask, manual or automatic.
    #[serde(default = "default_max_replan_attempts")]
    pub max_replan_attempts: u32,
    /// Replan failed subtasks automatically during `execute_plan`.
    #[serde(default)]
    pub auto_replan: bool,
}

fn default_max_replan_attempts() -> u32 {
    DEFAULT_MAX_REPLAN_ATTEMPTS
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_replan_attempts: default_max_replan_attempts(),
            auto_replan: false,
        }
    }
}

/// Soft limits on a plan. Exceeding one only adds a warning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConstraints {
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub max_subtasks: Option<usize>,
}

/// A goal to plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub goal: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub constraints: PlanConstraints,
}

impl PlanRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            context: None,
            constraints: PlanConstraints::default(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_constraints(mut self, constraints: PlanConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// Outcome of [`Planner::plan`]. Failures are reported here, not as `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub success: bool,
    pub plan_id: Option<Uuid>,
    pub graph: Option<TaskGraph>,
    pub visualization: String,
    pub reasoning: String,
    pub estimated_duration_ms: u64,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl PlanResult {
    fn failed(error: ConductorError, reasoning: String, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            plan_id: None,
            graph: None,
            visualization: String::new(),
            reasoning,
            estimated_duration_ms: 0,
            warnings,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of [`Planner::execute_plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub completed_subtasks: Vec<Uuid>,
    pub failed_subtasks: Vec<Uuid>,
    /// Skipped and blocked subtasks.
    pub skipped_subtasks: Vec<Uuid>,
    pub results: HashMap<Uuid, SubtaskResult>,
    pub total_duration_ms: u64,
    pub summary: String,
}

/// Turns goals into task graphs and drives their execution.
///
/// Plans live in an injectable [`PlanStore`]; each graph is only mutated by
/// the planner call that owns it.
pub struct Planner {
    config: PlannerConfig,
    oracle: Arc<dyn ReasoningOracle>,
    replanner: Replanner,
    store: Arc<PlanStore>,
    events: Option<EventBus>,
}

impl Planner {
    pub fn new(oracle: Arc<dyn ReasoningOracle>, config: PlannerConfig) -> Self {
        let replanner =
            Replanner::new(Arc::clone(&oracle)).with_max_attempts(config.max_replan_attempts);
        Self {
            config,
            oracle,
            replanner,
            store: Arc::new(PlanStore::new()),
            events: None,
        }
    }

    /// Keep plans in `store` instead of a private one.
    pub fn with_store(mut self, store: Arc<PlanStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }

    pub fn replanner(&self) -> &Replanner {
        &self.replanner
    }

    fn publish(&self, event: OrchestrationEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    // --- Planning ---

    /// Classify, decompose and store a plan for `request`.
    pub async fn plan(&self, request: PlanRequest) -> PlanResult {
        let goal = request.goal.trim();
        info!(goal = %goal, "Planning");
        let mut warnings = Vec::new();

        if goal.is_empty() {
            self.store.record_plan_outcome(false);
            return PlanResult::failed(
                ConductorError::InvalidPlan("Goal is empty".to_string()),
                String::new(),
                warnings,
            );
        }

        let context = request.context.as_deref();
        let assessment = match self.oracle.classify_complexity(goal, context).await {
            Ok(assessment) => assessment,
            Err(e) => {
                warn!(error = %e, "Complexity classification failed; assuming moderate");
                warnings.push(format!(
                    "Complexity classification failed ({e}); assuming moderate"
                ));
                ComplexityAssessment::moderate("classification unavailable")
            }
        };
        debug!(level = %assessment.level, "Goal classified");

        let plan_id = Uuid::new_v4();
        let built = if assessment.level <= ComplexityLevel::Simple {
            self.single_subtask_graph(plan_id, goal, &assessment)
        } else {
            match self
                .oracle
                .decompose(goal, context, &request.constraints)
                .await
            {
                Ok(decomposition) => build_graph(plan_id, goal, decomposition, &mut warnings),
                Err(e) => Err(ConductorError::InvalidPlan(format!(
                    "Decomposition failed: {e}"
                ))),
            }
        };

        let (graph, reasoning) = match built {
            Ok(built) => built,
            Err(e) => {
                error!(goal = %goal, error = %e, "Planning failed");
                self.store.record_plan_outcome(false);
                return PlanResult::failed(e, String::new(), warnings);
            }
        };

        check_constraints(&graph, &request.constraints, &mut warnings);
        for warning in &warnings {
            warn!(plan_id = %plan_id, "{warning}");
        }

        let estimated_duration_ms = graph.estimated_total_duration_ms();
        let visualization = graph.visualize();
        self.store
            .insert(PlanRecord::new(graph.clone(), request.clone()));
        self.store.record_plan_outcome(true);

        info!(
            plan_id = %plan_id,
            subtasks = graph.len(),
            layers = graph.layer_count(),
            estimated_ms = estimated_duration_ms,
            "Plan created"
        );
        self.publish(OrchestrationEvent::PlanCreated {
            plan_id,
            subtask_count: graph.len(),
            layer_count: graph.layer_count(),
            timestamp: Utc::now(),
        });

        PlanResult {
            success: true,
            plan_id: Some(plan_id),
            graph: Some(graph),
            visualization,
            reasoning,
            estimated_duration_ms,
            warnings,
            error: None,
        }
    }

    fn single_subtask_graph(
        &self,
        plan_id: Uuid,
        goal: &str,
        assessment: &ComplexityAssessment,
    ) -> ConductorResult<(TaskGraph, String)> {
        let mut graph = TaskGraph::with_id(plan_id, goal);
        graph.add_subtask(
            goal,
            SubtaskOptions::new().with_complexity(assessment.to_estimate()),
        )?;
        let reasoning = format!(
            "Goal classified as {}; planned as a single subtask",
            assessment.level
        );
        Ok((graph, reasoning))
    }

    pub fn get_plan(&self, plan_id: Uuid) -> Option<TaskGraph> {
        self.store.graph(plan_id)
    }

    pub fn stats(&self) -> PlanStats {
        self.store.stats()
    }

    /// Skip every pending/ready subtask of a plan. In-flight work is left to
    /// finish. Returns the skipped ids.
    pub fn cancel_plan(&self, plan_id: Uuid) -> ConductorResult<Vec<Uuid>> {
        let skipped = self.store.with_graph_mut(plan_id, TaskGraph::cancel)?;
        info!(plan_id = %plan_id, skipped = skipped.len(), "Plan cancelled");
        self.publish(OrchestrationEvent::PlanCancelled {
            plan_id,
            skipped: skipped.len(),
            timestamp: Utc::now(),
        });
        Ok(skipped)
    }

    /// Drop every terminal plan from the store.
    pub fn clear_completed_plans(&self) -> usize {
        let removed = self.store.remove_terminal();
        debug!(removed, "Cleared terminal plans");
        removed
    }

    // --- Execution ---

    /// Run a stored plan layer by layer through `executor`.
    ///
    /// Ready subtasks of a layer run concurrently and are joined before the
    /// next layer starts. Each result is verified before it counts; a failure
    /// blocks every transitive dependent while unrelated branches continue.
    pub async fn execute_plan<F, Fut>(
        &self,
        plan_id: Uuid,
        executor: F,
    ) -> ConductorResult<ExecutionResult>
    where
        F: Fn(Subtask) -> Fut,
        Fut: Future<Output = ConductorResult<SubtaskResult>>,
    {
        let start = Instant::now();
        let mut results: HashMap<Uuid, SubtaskResult> = HashMap::new();
        let mut layer = 0usize;
        info!(plan_id = %plan_id, "Executing plan");

        loop {
            let ready = self.store.with_graph_mut(plan_id, |graph| {
                if graph.status() == GraphStatus::Cancelled {
                    Vec::new()
                } else {
                    graph.get_ready_subtasks()
                }
            })?;
            if ready.is_empty() {
                break;
            }

            self.publish(OrchestrationEvent::LayerStarted {
                plan_id,
                layer,
                task_count: ready.len(),
                timestamp: Utc::now(),
            });

            let mut running = Vec::with_capacity(ready.len());
            for subtask in ready {
                let worker = subtask
                    .assigned_worker
                    .clone()
                    .unwrap_or_else(|| DIRECT_WORKER.to_string());
                let marked = self
                    .store
                    .with_graph_mut(plan_id, |graph| graph.mark_started(subtask.id, &worker))?;
                match marked {
                    Ok(()) => {
                        self.publish(OrchestrationEvent::SubtaskStarted {
                            plan_id,
                            subtask_id: subtask.id,
                            worker_id: worker,
                            timestamp: Utc::now(),
                        });
                        running.push(subtask);
                    }
                    Err(e) => warn!(plan_id = %plan_id, subtask = %subtask.id, error = %e, "Subtask not started"),
                }
            }

            let outcomes = join_all(running.into_iter().map(|subtask| {
                let pending = executor(subtask.clone());
                async move {
                    let started = Instant::now();
                    let outcome = pending.await;
                    let elapsed = started.elapsed().as_millis() as u64;
                    let result = match outcome {
                        Ok(result) => self.verify_subtask_result(&subtask, result).await,
                        Err(e) => SubtaskResult::failure(e.to_string()),
                    };
                    let result = if result.duration_ms == 0 {
                        result.with_duration(elapsed)
                    } else {
                        result
                    };
                    (subtask.id, result)
                }
            }))
            .await;

            let mut succeeded = 0;
            let mut failed_ids = Vec::new();
            for (id, result) in outcomes {
                results.insert(id, result.clone());
                if result.success {
                    let duration_ms = result.duration_ms;
                    match self
                        .store
                        .with_graph_mut(plan_id, |graph| graph.mark_completed(id, result))?
                    {
                        Ok(()) => {
                            succeeded += 1;
                            self.publish(OrchestrationEvent::SubtaskCompleted {
                                plan_id,
                                subtask_id: id,
                                duration_ms,
                                timestamp: Utc::now(),
                            });
                        }
                        Err(e) => warn!(plan_id = %plan_id, subtask = %id, error = %e, "Result not recorded"),
                    }
                } else {
                    let error = result.error.clone().unwrap_or_else(|| result.message.clone());
                    match self
                        .store
                        .with_graph_mut(plan_id, |graph| graph.mark_failed_with(id, result))?
                    {
                        Ok(blocked) => {
                            warn!(plan_id = %plan_id, subtask = %id, error = %error, blocked = blocked.len(), "Subtask failed");
                            self.publish(OrchestrationEvent::SubtaskFailed {
                                plan_id,
                                subtask_id: id,
                                error,
                                blocked: blocked.len(),
                                timestamp: Utc::now(),
                            });
                            failed_ids.push(id);
                        }
                        Err(e) => warn!(plan_id = %plan_id, subtask = %id, error = %e, "Failure not recorded"),
                    }
                }
            }

            self.publish(OrchestrationEvent::LayerCompleted {
                plan_id,
                layer,
                succeeded,
                failed: failed_ids.len(),
                timestamp: Utc::now(),
            });
            layer += 1;

            let cancelled = self
                .store
                .graph(plan_id)
                .is_some_and(|graph| graph.status() == GraphStatus::Cancelled);
            if cancelled {
                info!(plan_id = %plan_id, layer, "Plan cancelled; not scheduling further work");
                break;
            }

            if self.config.auto_replan {
                for id in failed_ids {
                    match self.replan(plan_id, id).await {
                        Ok(outcome) if outcome.strategy != RecoveryStrategy::Abandon => {
                            for reset in &outcome.reset {
                                results.remove(reset);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(plan_id = %plan_id, subtask = %id, error = %e, "Replan failed"),
                    }
                }
            }
        }

        let graph = self
            .store
            .graph(plan_id)
            .ok_or(ConductorError::PlanNotFound(plan_id))?;
        results.retain(|id, _| graph.contains(*id));

        let ids = |status: SubtaskStatus| -> Vec<Uuid> {
            graph.subtasks_by_status(status).iter().map(|s| s.id).collect()
        };
        let completed_subtasks = ids(SubtaskStatus::Completed);
        let failed_subtasks = ids(SubtaskStatus::Failed);
        let mut skipped_subtasks = ids(SubtaskStatus::Skipped);
        skipped_subtasks.extend(ids(SubtaskStatus::Blocked));

        let success = graph.status() == GraphStatus::Completed;
        let total_duration_ms = start.elapsed().as_millis() as u64;
        let summary = format!(
            "{}/{} subtasks completed, {} failed, {} skipped in {total_duration_ms}ms",
            completed_subtasks.len(),
            graph.len(),
            failed_subtasks.len(),
            skipped_subtasks.len(),
        );
        info!(plan_id = %plan_id, success, status = %graph.status(), "{summary}");
        self.publish(OrchestrationEvent::PlanFinished {
            plan_id,
            success,
            duration_ms: total_duration_ms,
            timestamp: Utc::now(),
        });

        Ok(ExecutionResult {
            success,
            completed_subtasks,
            failed_subtasks,
            skipped_subtasks,
            results,
            total_duration_ms,
            summary,
        })
    }

    /// Check `result` against every criterion of `subtask`.
    ///
    /// Automated criteria pass iff the raw result succeeded; oracle-checked
    /// ones ask the oracle (falling back to the raw result if it errors);
    /// manual ones are deferred and pass. The returned result succeeds only
    /// if the raw result did and every criterion passed.
    pub async fn verify_subtask_result(
        &self,
        subtask: &Subtask,
        mut result: SubtaskResult,
    ) -> SubtaskResult {
        let mut verifications = Vec::with_capacity(subtask.success_criteria.len());
        for criterion in &subtask.success_criteria {
            let (passed, details) = match criterion.kind {
                VerificationKind::Automated => (
                    result.success,
                    if result.success {
                        "Result reported success".to_string()
                    } else {
                        "Result reported failure".to_string()
                    },
                ),
                VerificationKind::OracleCheck if !result.success => {
                    (false, "Not judged: result reported failure".to_string())
                }
                VerificationKind::OracleCheck => match self
                    .oracle
                    .judge_criterion(&subtask.description, &result.output, criterion)
                    .await
                {
                    Ok(judgement) => (judgement.passed, judgement.details),
                    Err(e) => {
                        warn!(subtask = %subtask.id, error = %e, "Oracle judgement failed; using raw result");
                        (
                            result.success,
                            format!("Oracle unavailable ({e}); used raw result"),
                        )
                    }
                },
                VerificationKind::Manual => (true, "Deferred to manual review".to_string()),
            };
            verifications.push(VerificationResult::new(criterion.id, passed, details));
        }

        if result.success {
            let unmet: Vec<&str> = subtask
                .success_criteria
                .iter()
                .zip(&verifications)
                .filter(|(_, v)| !v.passed)
                .map(|(c, _)| c.description.as_str())
                .collect();
            if !unmet.is_empty() {
                let error = ConductorError::VerificationFailed(unmet.join("; ")).to_string();
                result.success = false;
                result.message = error.clone();
                result.error = Some(error);
            }
        }
        result.verifications = verifications;
        result
    }

    // --- Replanning ---

    /// Revise a plan around a failed subtask and store the revised graph.
    pub async fn replan(&self, plan_id: Uuid, subtask_id: Uuid) -> ConductorResult<ReplanResult> {
        let graph = self
            .store
            .graph(plan_id)
            .ok_or(ConductorError::PlanNotFound(plan_id))?;
        if graph.status() == GraphStatus::Cancelled {
            return Err(ConductorError::InvalidPlan(format!(
                "Plan {plan_id} is cancelled"
            )));
        }
        let error = graph
            .get(subtask_id)
            .ok_or(ConductorError::UnknownSubtask(subtask_id))?
            .result
            .as_ref()
            .and_then(|r| r.error.clone())
            .unwrap_or_default();

        let outcome = self.replanner.replan(&graph, subtask_id, &error).await?;
        if let Some(revised) = &outcome.graph {
            self.store.replace_graph(plan_id, revised.clone())?;
        }
        self.publish(OrchestrationEvent::Replanned {
            plan_id,
            subtask_id,
            strategy: outcome.strategy.to_string(),
            timestamp: Utc::now(),
        });
        Ok(outcome)
    }
}

/// Two-pass construction: insert every proposal without edges, then resolve
/// the transient dependency ids.
fn build_graph(
    plan_id: Uuid,
    goal: &str,
    decomposition: Decomposition,
    warnings: &mut Vec<String>,
) -> ConductorResult<(TaskGraph, String)> {
    if decomposition.subtasks.is_empty() {
        return Err(ConductorError::InvalidPlan(
            "Decomposition contains no subtasks".to_string(),
        ));
    }
    warnings.extend(decomposition.warnings.iter().cloned());

    let mut graph = TaskGraph::with_id(plan_id, goal);
    let mut ids: HashMap<&str, Uuid> = HashMap::new();
    let mut inserted = Vec::with_capacity(decomposition.subtasks.len());

    for proposal in &decomposition.subtasks {
        let id = graph.add_subtask(proposal.description.clone(), proposal.to_options())?;
        if ids.contains_key(proposal.id.as_str()) {
            warnings.push(format!(
                "Duplicate subtask id '{}'; references resolve to the first",
                proposal.id
            ));
        } else {
            ids.insert(proposal.id.as_str(), id);
        }
        inserted.push(id);
    }

    for (proposal, &dependent) in decomposition.subtasks.iter().zip(&inserted) {
        for reference in &proposal.dependencies {
            match ids.get(reference.as_str()) {
                None => warnings.push(format!(
                    "Subtask '{}' depends on unknown '{reference}'; dependency dropped",
                    proposal.id
                )),
                Some(&dependency) if dependency == dependent => warnings.push(format!(
                    "Subtask '{}' depends on itself; dependency dropped",
                    proposal.id
                )),
                Some(&dependency) => {
                    graph.add_dependency(dependent, dependency).map_err(|e| {
                        ConductorError::InvalidPlan(format!("Decomposition is not acyclic: {e}"))
                    })?;
                }
            }
        }
    }
    graph
        .validate_no_cycles()
        .map_err(|e| ConductorError::InvalidPlan(e.to_string()))?;

    Ok((graph, decomposition.reasoning))
}

fn check_constraints(graph: &TaskGraph, constraints: &PlanConstraints, warnings: &mut Vec<String>) {
    if let Some(max) = constraints.max_subtasks {
        if graph.len() > max {
            warnings.push(format!(
                "Plan has {} subtasks, more than the requested maximum of {max}",
                graph.len()
            ));
        }
    }
    if let Some(max) = constraints.max_parallel {
        let widest = graph.max_parallelism();
        if widest > max {
            warnings.push(format!(
                "Widest layer runs {widest} subtasks in parallel, more than the requested {max}"
            ));
        }
    }
    if let Some(max) = constraints.max_duration_ms {
        let estimate = graph.estimated_total_duration_ms();
        if estimate > max {
            warnings.push(format!(
                "Estimated duration {estimate}ms exceeds the requested {max}ms"
            ));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::oracle::{CriterionJudgement, HeuristicOracle, ProposedSubtask};
    use crate::types::SuccessCriterion;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Oracle with scripted answers; `None` makes the call fail.
    #[derive(Default)]
    struct ScriptedOracle {
        level: Option<ComplexityLevel>,
        decomposition: Option<Decomposition>,
        verdict: Option<bool>,
    }

    #[async_trait]
    impl ReasoningOracle for ScriptedOracle {
        async fn classify_complexity(
            &self,
            _description: &str,
            _context: Option<&str>,
        ) -> ConductorResult<ComplexityAssessment> {
            let level = self
                .level
                .ok_or_else(|| ConductorError::Oracle("offline".into()))?;
            Ok(crate::types::ComplexityEstimate::new(level).into())
        }

        async fn decompose(
            &self,
            _description: &str,
            _context: Option<&str>,
            _constraints: &PlanConstraints,
        ) -> ConductorResult<Decomposition> {
            self.decomposition
                .clone()
                .ok_or_else(|| ConductorError::Oracle("offline".into()))
        }

        async fn judge_criterion(
            &self,
            _description: &str,
            _output: &serde_json::Value,
            _criterion: &SuccessCriterion,
        ) -> ConductorResult<CriterionJudgement> {
            let passed = self
                .verdict
                .ok_or_else(|| ConductorError::Oracle("offline".into()))?;
            Ok(CriterionJudgement {
                passed,
                details: "scripted".into(),
            })
        }
    }

    fn diamond() -> Decomposition {
        Decomposition {
            subtasks: vec![
                ProposedSubtask::new("a", "Fetch the data"),
                ProposedSubtask::new("b", "Check the totals").after(&["a"]),
                ProposedSubtask::new("c", "List the outliers").after(&["a"]),
                ProposedSubtask::new("d", "Write the summary").after(&["b", "c", "ghost", "d"]),
            ],
            reasoning: "diamond".into(),
            warnings: Vec::new(),
        }
    }

    fn planner(oracle: ScriptedOracle) -> Planner {
        Planner::new(Arc::new(oracle), PlannerConfig::default())
    }

    async fn ok(subtask: Subtask) -> ConductorResult<SubtaskResult> {
        Ok(SubtaskResult::success(
            serde_json::json!({ "done": subtask.description }),
            "ok",
        ))
    }

    #[tokio::test]
    async fn test_plan_diamond_with_dropped_references() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Complex),
            decomposition: Some(diamond()),
            ..Default::default()
        });
        let result = planner.plan(PlanRequest::new("Quarterly review")).await;
        assert!(result.success, "{:?}", result.error);
        let graph = result.graph.unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.layer_count(), 3);
        assert_eq!(graph.layers()[1].len(), 2);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings.iter().any(|w| w.contains("ghost")));
        assert!(result.warnings.iter().any(|w| w.contains("itself")));
        assert_eq!(result.reasoning, "diamond");
        assert!(planner.get_plan(result.plan_id.unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_simple_goal_skips_decomposition() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Simple),
            ..Default::default()
        });
        let result = planner.plan(PlanRequest::new("Send the invoice")).await;
        assert!(result.success);
        assert_eq!(result.graph.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_classification_failure_degrades_to_moderate() {
        let planner = planner(ScriptedOracle {
            decomposition: Some(diamond()),
            ..Default::default()
        });
        let result = planner.plan(PlanRequest::new("Quarterly review")).await;
        assert!(result.success);
        assert!(result.warnings[0].contains("assuming moderate"));
        assert_eq!(result.graph.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_cyclic_decomposition_is_invalid_plan() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Complex),
            decomposition: Some(Decomposition {
                subtasks: vec![
                    ProposedSubtask::new("a", "first").after(&["b"]),
                    ProposedSubtask::new("b", "second").after(&["a"]),
                ],
                ..Default::default()
            }),
            ..Default::default()
        });
        let result = planner.plan(PlanRequest::new("loop")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Invalid plan"));
        let stats = planner.stats();
        assert_eq!(stats.total_plans, 1);
        assert_eq!(stats.failed_plans, 1);
        assert_eq!(stats.stored_plans, 0);
    }

    #[tokio::test]
    async fn test_decomposition_failure_is_reported() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Complex),
            ..Default::default()
        });
        let result = planner.plan(PlanRequest::new("anything")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Decomposition failed"));
    }

    #[tokio::test]
    async fn test_constraints_only_warn() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Complex),
            decomposition: Some(diamond()),
            ..Default::default()
        });
        let request = PlanRequest::new("Quarterly review").with_constraints(PlanConstraints {
            max_duration_ms: Some(1),
            max_parallel: Some(1),
            max_subtasks: Some(2),
        });
        let result = planner.plan(request).await;
        assert!(result.success);
        assert_eq!(result.warnings.len(), 5);
    }

    #[tokio::test]
    async fn test_execute_plan_completes_diamond() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Complex),
            decomposition: Some(diamond()),
            verdict: Some(true),
            ..Default::default()
        });
        let plan_id = planner
            .plan(PlanRequest::new("Quarterly review"))
            .await
            .plan_id
            .unwrap();

        let result = planner.execute_plan(plan_id, ok).await.unwrap();
        assert!(result.success, "{}", result.summary);
        assert_eq!(result.completed_subtasks.len(), 4);
        assert_eq!(result.results.len(), 4);
        assert!(result.results.values().all(|r| r.verifications.len() == 1));

        let graph = planner.get_plan(plan_id).unwrap();
        assert_eq!(graph.status(), GraphStatus::Completed);
        assert!(graph
            .subtasks()
            .all(|s| s.success_criteria.iter().all(|c| c.met)));
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_only() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Complex),
            decomposition: Some(diamond()),
            verdict: Some(true),
            ..Default::default()
        });
        let plan_id = planner
            .plan(PlanRequest::new("Quarterly review"))
            .await
            .plan_id
            .unwrap();

        let result = planner
            .execute_plan(plan_id, |subtask: Subtask| async move {
                if subtask.description.starts_with("Check") {
                    Err(ConductorError::SubtaskExecutionFailed("totals off".into()))
                } else {
                    ok(subtask).await
                }
            })
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.completed_subtasks.len(), 2);
        assert_eq!(result.failed_subtasks.len(), 1);
        assert_eq!(result.skipped_subtasks.len(), 1);
        let graph = planner.get_plan(plan_id).unwrap();
        assert_eq!(graph.status(), GraphStatus::Failed);
        assert_eq!(graph.subtasks_by_status(SubtaskStatus::Blocked).len(), 1);
    }

    #[tokio::test]
    async fn test_unmet_criterion_fails_subtask() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Simple),
            verdict: Some(false),
            ..Default::default()
        });
        let plan_id = planner
            .plan(PlanRequest::new("Send the invoice"))
            .await
            .plan_id
            .unwrap();
        let result = planner.execute_plan(plan_id, ok).await.unwrap();
        assert!(!result.success);
        let failure = result.results.values().next().unwrap();
        assert!(failure
            .error
            .as_deref()
            .unwrap()
            .starts_with("Verification failed"));
    }

    #[tokio::test]
    async fn test_verify_rules() {
        let oracle = ScriptedOracle::default();
        let planner = planner(oracle);
        let subtask = Subtask::new(
            "x",
            SubtaskOptions::new().with_criteria(vec![
                SuccessCriterion::automated("raw"),
                SuccessCriterion::oracle_check("judged"),
                SuccessCriterion::manual("human"),
            ]),
        );

        // Oracle offline: oracle-check falls back to the raw result.
        let verified = planner
            .verify_subtask_result(&subtask, SubtaskResult::success(serde_json::json!(1), ""))
            .await;
        assert!(verified.success);
        assert_eq!(verified.verifications.len(), 3);
        assert!(verified.verifications.iter().all(|v| v.passed));
        assert!(verified.verifications[1].details.starts_with("Oracle unavailable"));

        let verified = planner
            .verify_subtask_result(&subtask, SubtaskResult::failure("boom"))
            .await;
        assert!(!verified.success);
        assert_eq!(verified.error.as_deref(), Some("boom"));
        let passed: Vec<bool> = verified.verifications.iter().map(|v| v.passed).collect();
        assert_eq!(passed, vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_cancel_and_clear() {
        let planner = planner(ScriptedOracle {
            level: Some(ComplexityLevel::Complex),
            decomposition: Some(diamond()),
            ..Default::default()
        });
        let plan_id = planner
            .plan(PlanRequest::new("Quarterly review"))
            .await
            .plan_id
            .unwrap();

        assert_eq!(planner.cancel_plan(plan_id).unwrap().len(), 4);
        let result = planner.execute_plan(plan_id, ok).await.unwrap();
        assert!(!result.success);
        assert!(result.completed_subtasks.is_empty());

        assert_eq!(planner.clear_completed_plans(), 1);
        assert!(planner.get_plan(plan_id).is_none());
        assert!(matches!(
            planner.cancel_plan(plan_id),
            Err(ConductorError::PlanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_replan_retries_transient_failure() {
        let planner = Planner::new(
            Arc::new(HeuristicOracle::new()),
            PlannerConfig {
                auto_replan: true,
                ..Default::default()
            },
        );
        let plan_id = planner
            .plan(PlanRequest::new("Research the rates then write the report"))
            .await
            .plan_id
            .unwrap();

        let attempts = Mutex::new(0u32);
        let result = planner
            .execute_plan(plan_id, |subtask: Subtask| {
                let first = {
                    let mut n = attempts.lock();
                    *n += 1;
                    *n == 1
                };
                async move {
                    if first {
                        Err(ConductorError::Worker("connection timed out".into()))
                    } else {
                        ok(subtask).await
                    }
                }
            })
            .await
            .unwrap();

        assert!(result.success, "{}", result.summary);
        assert_eq!(*attempts.lock(), 3);
        let record = planner.store().record(plan_id).unwrap();
        assert_eq!(record.replans, 1);
    }

    #[tokio::test]
    async fn test_reassign_excludes_worker_reported_by_callback() {
        let planner = Planner::new(
            Arc::new(HeuristicOracle::new()),
            PlannerConfig {
                auto_replan: true,
                ..Default::default()
            },
        );
        let plan_id = planner
            .plan(PlanRequest::new("Research the rates then write the report"))
            .await
            .plan_id
            .unwrap();

        let calls = Mutex::new(Vec::new());
        let result = planner
            .execute_plan(plan_id, |subtask: Subtask| {
                let first = {
                    let mut calls = calls.lock();
                    calls.push(subtask.excluded_workers());
                    calls.len() == 1
                };
                async move {
                    if first {
                        Ok(SubtaskResult::failure("403 forbidden").with_worker("counsel"))
                    } else {
                        ok(subtask).await.map(|r| r.with_worker("analyst"))
                    }
                }
            })
            .await
            .unwrap();

        assert!(result.success, "{}", result.summary);
        let calls = calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1], vec!["counsel".to_string()]);

        let graph = planner.get_plan(plan_id).unwrap();
        let research = graph
            .subtasks()
            .find(|s| s.description.contains("Research"))
            .unwrap();
        assert_eq!(research.excluded_workers(), vec!["counsel"]);
        assert_eq!(research.assigned_worker.as_deref(), Some("analyst"));
    }

    #[tokio::test]
    async fn test_cancelled_plan_schedules_no_more_work() {
        let planner = Planner::new(
            Arc::new(HeuristicOracle::new()),
            PlannerConfig {
                auto_replan: true,
                ..Default::default()
            },
        );
        let plan_id = planner
            .plan(PlanRequest::new(
                "Research the rates; check the flaky feed then write the report",
            ))
            .await
            .plan_id
            .unwrap();

        let calls = Mutex::new(Vec::new());
        let result = planner
            .execute_plan(plan_id, |subtask: Subtask| {
                calls.lock().push(subtask.description.clone());
                let flaky = subtask.description.contains("flaky");
                if !flaky {
                    planner.cancel_plan(plan_id).unwrap();
                }
                async move {
                    if flaky {
                        Err(ConductorError::Worker("connection timed out".into()))
                    } else {
                        ok(subtask).await
                    }
                }
            })
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(calls.lock().len(), 2);
        assert_eq!(result.failed_subtasks.len(), 1);

        let record = planner.store().record(plan_id).unwrap();
        assert_eq!(record.replans, 0);
        assert_eq!(record.graph.status(), GraphStatus::Cancelled);
        assert!(planner.replan(plan_id, result.failed_subtasks[0]).await.is_err());
    }
}
