//! Task orchestration for multi-agent workloads.
//!
//! A goal is decomposed into a DAG of subtasks, each subtask is routed to the
//! best available worker, independent subtasks run concurrently while
//! dependencies are respected, outcomes are verified against their success
//! criteria, and failures are recovered by replanning.
//!
//! # Main types
//!
//! - [`TaskGraph`]: Dependency graph with cycle checks, layering and a subtask state machine.
//! - [`Planner`]: Turns goals into stored task graphs and executes them layer by layer.
//! - [`AgentRouter`]: Scores workers for a task and picks the best one.
//! - [`ParallelExecutor`]: Runs an [`ExecutionPlan`] phase by phase with bounded concurrency.
//! - [`Replanner`]: Revises a graph around a failed subtask.
//! - [`ReasoningOracle`]: Seam for classification, decomposition and criterion judging.
//! - [`WorkerPool`]: Registered [`Worker`]s with live status, load and performance.

/// Parallel execution of plans against a worker pool.
pub mod executor;
/// The task graph.
pub mod graph;
/// Reasoning oracle trait, reply parsing and the offline oracle.
pub mod oracle;
/// Planning, verification and layer-by-layer execution.
pub mod planner;
/// Failure recovery.
pub mod replanner;
/// Worker scoring and selection.
pub mod router;
/// Plan and routing history stores.
pub mod store;
/// Shared data model (Subtask, SuccessCriterion, ComplexityEstimate, etc.).
pub mod types;
/// Worker trait, profiles and the worker pool.
pub mod worker;

pub use executor::{
    ExecutionPhase, ExecutionPlan, ExecutionReport, ExecutionStatus, ExecutionTask,
    ExecutorConfig, ParallelExecutor, PhaseStatus, TaskOutput, TaskStatus,
};
pub use graph::{GraphSummary, TaskGraph};
pub use oracle::{
    CompletionBackend, ComplexityAssessment, CriterionJudgement, Decomposition,
    HeuristicOracle, OracleParseError, PromptOracle, ProposedSubtask, ReasoningOracle,
};
pub use planner::{
    ExecutionResult, PlanConstraints, PlanRequest, PlanResult, Planner, PlannerConfig,
    DIRECT_WORKER,
};
pub use replanner::{RecoveryOption, RecoveryStrategy, ReplanResult, Replanner};
pub use router::{
    AgentRouter, RouterConfig, RoutingAlternative, RoutingContext, RoutingDecision, RoutingTask,
};
pub use store::{PlanRecord, PlanStats, PlanStore, RoutingLog};
pub use types::{
    ComplexityEstimate, ComplexityLevel, GraphStatus, Priority, Subtask, SubtaskOptions,
    SubtaskResult, SubtaskStatus, SuccessCriterion, VerificationKind, VerificationResult,
};
pub use worker::{Worker, WorkerPerformance, WorkerPool, WorkerProfile, WorkerStatus};
