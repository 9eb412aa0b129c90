use crate::graph::TaskGraph;
use crate::oracle::ReasoningOracle;
use crate::planner::{PlanConstraints, DIRECT_WORKER};
use crate::types::{
    ComplexityLevel, Subtask, SubtaskStatus, META_EXCLUDED_WORKERS, META_REPLAN_ATTEMPTS,
};
use conductor_core::{is_permanent_message, ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of times one subtask may be replanned.
pub const DEFAULT_MAX_REPLAN_ATTEMPTS: u32 = 2;

/// How a failed subtask is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Run the same subtask again.
    Retry,
    /// Run it again on a different worker.
    Reassign,
    /// Split it into smaller subtasks.
    Decompose,
    /// Give up; the failure stands.
    Abandon,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::Retry => write!(f, "retry"),
            RecoveryStrategy::Reassign => write!(f, "reassign"),
            RecoveryStrategy::Decompose => write!(f, "decompose"),
            RecoveryStrategy::Abandon => write!(f, "abandon"),
        }
    }
}

/// A ranked recovery candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOption {
    pub strategy: RecoveryStrategy,
    pub score: f64,
    pub rationale: String,
}

/// Outcome of [`Replanner::replan`].
#[derive(Debug, Clone)]
pub struct ReplanResult {
    pub strategy: RecoveryStrategy,
    /// The revised graph; `None` when the failure was abandoned.
    pub graph: Option<TaskGraph>,
    /// Subtasks put back to `pending`.
    pub reset: Vec<Uuid>,
    /// Subtasks created by a decomposition.
    pub added: Vec<Uuid>,
    pub reasoning: String,
}

/// Revises a graph after a subtask failed.
///
/// Revised graphs are assembled from cloned subtasks and validated through
/// [`TaskGraph::from_subtasks`]; the input graph is never touched.
pub struct Replanner {
    oracle: Arc<dyn ReasoningOracle>,
    max_attempts: u32,
}

impl Replanner {
    pub fn new(oracle: Arc<dyn ReasoningOracle>) -> Self {
        Self {
            oracle,
            max_attempts: DEFAULT_MAX_REPLAN_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Rank recovery strategies for `subtask`, best first. `Abandon` is
    /// always present and is the only option once the attempt budget is
    /// spent.
    pub fn recovery_options(&self, subtask: &Subtask, error: &str) -> Vec<RecoveryOption> {
        let attempts = subtask.replan_attempts();
        let mut options = vec![RecoveryOption {
            strategy: RecoveryStrategy::Abandon,
            score: 0.1,
            rationale: "Accept the failure and leave dependents blocked".to_string(),
        }];
        if attempts >= self.max_attempts {
            options[0].score = 1.0;
            options[0].rationale = format!("Replan budget spent ({attempts}/{})", self.max_attempts);
            return options;
        }

        let lower = error.to_lowercase();
        let permanent = is_permanent_message(error);
        let transient = ["timeout", "timed out", "connection", "temporar", "unavailable", "rate limit"]
            .iter()
            .any(|k| lower.contains(k));
        let unverified = lower.contains("verification failed");
        // Each previous attempt makes repeating the same thing less attractive.
        let fatigue = 0.25 * attempts as f64;

        let retry = if permanent {
            0.1
        } else if transient {
            0.8
        } else {
            0.5
        };
        options.push(RecoveryOption {
            strategy: RecoveryStrategy::Retry,
            score: (retry - fatigue).max(0.0),
            rationale: if transient {
                "Failure looks transient".to_string()
            } else {
                "Run the subtask again unchanged".to_string()
            },
        });

        // The direct placeholder names no real worker to steer away from.
        if let Some(worker) = subtask
            .assigned_worker
            .as_deref()
            .filter(|w| *w != DIRECT_WORKER)
        {
            let reassign = if permanent { 0.75 } else { 0.55 };
            options.push(RecoveryOption {
                strategy: RecoveryStrategy::Reassign,
                score: (reassign - fatigue / 2.0).max(0.0),
                rationale: format!("Try a worker other than '{worker}'"),
            });
        }

        let level = subtask.complexity.level;
        if level >= ComplexityLevel::Moderate {
            let mut decompose = if level >= ComplexityLevel::Complex { 0.6 } else { 0.35 };
            if unverified {
                decompose += 0.2;
            }
            options.push(RecoveryOption {
                strategy: RecoveryStrategy::Decompose,
                score: (decompose + fatigue).min(1.0),
                rationale: format!("Split the {level} subtask into smaller pieces"),
            });
        }

        options.sort_by(|a, b| b.score.total_cmp(&a.score));
        options
    }

    /// Apply the best workable recovery option to the failed subtask.
    ///
    /// A decomposition the oracle cannot deliver falls through to the next
    /// ranked option.
    pub async fn replan(
        &self,
        graph: &TaskGraph,
        failed_id: Uuid,
        error: &str,
    ) -> ConductorResult<ReplanResult> {
        let subtask = graph
            .get(failed_id)
            .ok_or(ConductorError::UnknownSubtask(failed_id))?;
        if subtask.status != SubtaskStatus::Failed {
            return Err(ConductorError::InvalidTransition {
                id: failed_id,
                from: subtask.status.to_string(),
                to: "replanned".to_string(),
            });
        }

        for option in self.recovery_options(subtask, error) {
            let outcome = match option.strategy {
                RecoveryStrategy::Retry => self.rerun(graph, failed_id, false),
                RecoveryStrategy::Reassign => self.rerun(graph, failed_id, true),
                RecoveryStrategy::Decompose => match self.decompose(graph, failed_id).await {
                    Ok(result) => Ok(result),
                    Err(e) => {
                        warn!(subtask = %failed_id, error = %e, "Decomposition unavailable, trying next option");
                        continue;
                    }
                },
                RecoveryStrategy::Abandon => Ok(ReplanResult {
                    strategy: RecoveryStrategy::Abandon,
                    graph: None,
                    reset: Vec::new(),
                    added: Vec::new(),
                    reasoning: option.rationale.clone(),
                }),
            };
            let mut result = outcome?;
            if result.strategy != RecoveryStrategy::Abandon {
                result.reasoning = format!("{}: {}", option.strategy, option.rationale);
            }
            info!(
                graph = %graph.id(),
                subtask = %failed_id,
                strategy = %result.strategy,
                reset = result.reset.len(),
                added = result.added.len(),
                "Replanned failed subtask"
            );
            return Ok(result);
        }

        // Abandon is always ranked, so the loop returns before this.
        Err(ConductorError::InvalidPlan(format!(
            "No recovery option for subtask {failed_id}"
        )))
    }

    fn rerun(
        &self,
        graph: &TaskGraph,
        failed_id: Uuid,
        exclude_worker: bool,
    ) -> ConductorResult<ReplanResult> {
        let unblock = unblockable(graph, failed_id);
        let mut reset = Vec::new();
        let mut subtasks: Vec<Subtask> = graph.subtasks().cloned().collect();

        for subtask in &mut subtasks {
            if subtask.id == failed_id {
                let previous = subtask.assigned_worker.clone();
                reset_subtask(subtask);
                bump_attempts(subtask);
                if exclude_worker {
                    if let Some(worker) = previous.filter(|w| w != DIRECT_WORKER) {
                        exclude(subtask, worker);
                    }
                }
                reset.push(subtask.id);
            } else if unblock.contains(&subtask.id) {
                reset_subtask(subtask);
                reset.push(subtask.id);
            }
        }

        Ok(ReplanResult {
            strategy: if exclude_worker {
                RecoveryStrategy::Reassign
            } else {
                RecoveryStrategy::Retry
            },
            graph: Some(TaskGraph::from_subtasks(graph.id(), graph.goal(), subtasks)?),
            reset,
            added: Vec::new(),
            reasoning: String::new(),
        })
    }

    async fn decompose(&self, graph: &TaskGraph, failed_id: Uuid) -> ConductorResult<ReplanResult> {
        let failed = graph
            .get(failed_id)
            .ok_or(ConductorError::UnknownSubtask(failed_id))?;
        let decomposition = self
            .oracle
            .decompose(&failed.description, Some(graph.goal()), &PlanConstraints::default())
            .await?;
        if decomposition.subtasks.len() < 2 {
            return Err(ConductorError::Oracle(
                "Decomposition produced fewer than two pieces".to_string(),
            ));
        }

        let attempts = failed.replan_attempts() + 1;
        let local: HashMap<&str, Uuid> = decomposition
            .subtasks
            .iter()
            .map(|p| (p.id.as_str(), Uuid::new_v4()))
            .collect();

        let mut pieces = Vec::with_capacity(decomposition.subtasks.len());
        let mut referenced = HashSet::new();
        for proposal in &decomposition.subtasks {
            let id = local[proposal.id.as_str()];
            let mut deps: BTreeSet<Uuid> = proposal
                .dependencies
                .iter()
                .filter_map(|d| local.get(d.as_str()).copied())
                .filter(|d| *d != id)
                .collect();
            referenced.extend(deps.iter().copied());
            if deps.is_empty() {
                deps = failed.dependencies.clone();
            }

            let mut options = proposal.to_options();
            options.id = Some(id);
            options.parent_id = Some(failed_id);
            if options.category.is_none() {
                options.category = Some(failed.category.clone());
            }
            let mut piece = Subtask::new(proposal.description.clone(), options);
            piece.dependencies = deps;
            piece
                .metadata
                .insert(META_REPLAN_ATTEMPTS.to_string(), attempts.into());
            pieces.push(piece);
        }
        let sinks: BTreeSet<Uuid> = pieces
            .iter()
            .map(|p| p.id)
            .filter(|id| !referenced.contains(id))
            .collect();

        let unblock = unblockable(graph, failed_id);
        let mut reset = Vec::new();
        let mut subtasks = Vec::with_capacity(graph.len() + pieces.len());
        let added: Vec<Uuid> = pieces.iter().map(|p| p.id).collect();

        for subtask in graph.subtasks() {
            if subtask.id == failed_id {
                subtasks.append(&mut pieces);
                continue;
            }
            let mut subtask = subtask.clone();
            if subtask.dependencies.remove(&failed_id) {
                subtask.dependencies.extend(sinks.iter().copied());
            }
            if unblock.contains(&subtask.id) {
                reset_subtask(&mut subtask);
                reset.push(subtask.id);
            }
            subtasks.push(subtask);
        }

        Ok(ReplanResult {
            strategy: RecoveryStrategy::Decompose,
            graph: Some(TaskGraph::from_subtasks(graph.id(), graph.goal(), subtasks)?),
            reset,
            added,
            reasoning: decomposition.reasoning,
        })
    }
}

/// Blocked dependents of `failed_id` that no other failure still blocks.
fn unblockable(graph: &TaskGraph, failed_id: Uuid) -> HashSet<Uuid> {
    let still_blocked: HashSet<Uuid> = graph
        .subtasks_by_status(SubtaskStatus::Failed)
        .into_iter()
        .filter(|s| s.id != failed_id)
        .flat_map(|s| graph.transitive_dependents(s.id))
        .collect();
    graph
        .transitive_dependents(failed_id)
        .into_iter()
        .filter(|id| !still_blocked.contains(id))
        .filter(|id| graph.get(*id).is_some_and(|s| s.status == SubtaskStatus::Blocked))
        .collect()
}

fn reset_subtask(subtask: &mut Subtask) {
    subtask.status = SubtaskStatus::Pending;
    subtask.result = None;
    subtask.assigned_worker = None;
    subtask.started_at = None;
    subtask.completed_at = None;
    for criterion in &mut subtask.success_criteria {
        criterion.met = false;
        criterion.verified_at = None;
    }
}

fn bump_attempts(subtask: &mut Subtask) {
    let next = subtask.replan_attempts() + 1;
    subtask
        .metadata
        .insert(META_REPLAN_ATTEMPTS.to_string(), next.into());
}

fn exclude(subtask: &mut Subtask, worker: String) {
    let mut excluded = subtask.excluded_workers();
    if !excluded.contains(&worker) {
        excluded.push(worker);
    }
    subtask
        .metadata
        .insert(META_EXCLUDED_WORKERS.to_string(), excluded.into());
}
