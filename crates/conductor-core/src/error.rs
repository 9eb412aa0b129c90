use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor orchestration core.
///
/// Structural variants (`UnknownDependency`, `CycleDetected`, `HasDependents`,
/// `InvalidTransition`) are local to the graph mutation that raised them.
/// Execution variants never escape a phase join: they are folded into failed
/// results by the planner and executor.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A subtask referenced a dependency that is not part of the graph.
    #[error("Unknown dependency: {dependency} is not part of the graph")]
    UnknownDependency {
        /// The missing dependency id.
        dependency: Uuid,
    },

    /// An operation referenced a subtask id that is not part of the graph.
    #[error("Unknown subtask: {0}")]
    UnknownSubtask(Uuid),

    /// Adding an edge (or loading a graph) would produce a dependency cycle.
    #[error("Dependency cycle detected: {}", format_path(.path))]
    CycleDetected {
        /// The offending path; first and last element are the same subtask.
        path: Vec<Uuid>,
    },

    /// A subtask cannot be removed while other subtasks still depend on it.
    #[error("Subtask {id} still has {count} dependent(s)")]
    HasDependents {
        /// The subtask that was going to be removed.
        id: Uuid,
        /// How many subtasks depend on it.
        count: usize,
    },

    /// A status transition that the subtask state machine does not allow.
    #[error("Invalid transition for subtask {id}: {from} -> {to}")]
    InvalidTransition {
        /// The subtask.
        id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The decomposition could not be turned into a valid plan.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// No plan is stored under the given id.
    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    /// The executor callback or worker reported a failure.
    #[error("Subtask execution failed: {0}")]
    SubtaskExecutionFailed(String),

    /// The raw result succeeded but one or more success criteria did not pass.
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// A task exceeded its execution timeout.
    #[error("Task timed out after {0}ms")]
    TaskTimeout(u64),

    /// A task was cancelled before it could finish.
    #[error("Task cancelled")]
    TaskCancelled,

    /// The reasoning oracle failed or returned an unusable response.
    #[error("Oracle error: {0}")]
    Oracle(String),

    /// A worker could not be found or refused the task.
    #[error("Worker error: {0}")]
    Worker(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// Missing resources and authorization failures are permanent; everything
    /// else (timeouts, transient worker failures) is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConductorError::TaskCancelled
            | ConductorError::UnknownDependency { .. }
            | ConductorError::UnknownSubtask(_)
            | ConductorError::CycleDetected { .. }
            | ConductorError::HasDependents { .. }
            | ConductorError::InvalidTransition { .. }
            | ConductorError::InvalidPlan(_)
            | ConductorError::PlanNotFound(_)
            | ConductorError::Config(_) => false,
            ConductorError::TaskTimeout(_) => true,
            other => !is_permanent_message(&other.to_string()),
        }
    }
}

/// Returns `true` for messages that describe a permanent failure
/// (not found / not authorized).
///
/// Status codes only count as whole words, so "after 4030ms" is not a 403.
pub fn is_permanent_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if lower.contains("not found")
        || lower.contains("not authorized")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
    {
        return true;
    }
    permanent_status_code()
        .as_ref()
        .is_some_and(|re| re.is_match(&lower))
}

fn permanent_status_code() -> &'static Option<Regex> {
    static STATUS: OnceLock<Option<Regex>> = OnceLock::new();
    STATUS.get_or_init(|| Regex::new(r"\b40[134]\b").ok())
}

fn format_path(path: &[Uuid]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
