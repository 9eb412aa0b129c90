use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Category assigned to subtasks that do not declare one.
pub const DEFAULT_CATEGORY: &str = "general";

/// Scheduling priority of a subtask.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Lenient parse; unknown values map to [`Priority::Normal`].
    pub fn parse_level(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" | "critical" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Five-level complexity scale, ordered `Trivial < ... < VeryComplex`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    #[default]
    Moderate,
    Complex,
    VeryComplex,
}

impl ComplexityLevel {
    /// Lenient parse; unknown values map to [`ComplexityLevel::Moderate`].
    pub fn parse_level(s: &str) -> Self {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "trivial" => ComplexityLevel::Trivial,
            "simple" => ComplexityLevel::Simple,
            "complex" => ComplexityLevel::Complex,
            "very-complex" | "verycomplex" => ComplexityLevel::VeryComplex,
            _ => ComplexityLevel::Moderate,
        }
    }

    /// Baseline duration used when no estimate is supplied.
    pub fn default_duration_ms(self) -> u64 {
        const MINUTE: u64 = 60_000;
        match self {
            ComplexityLevel::Trivial => MINUTE,
            ComplexityLevel::Simple => 5 * MINUTE,
            ComplexityLevel::Moderate => 15 * MINUTE,
            ComplexityLevel::Complex => 45 * MINUTE,
            ComplexityLevel::VeryComplex => 120 * MINUTE,
        }
    }

    fn bump(self) -> Self {
        match self {
            ComplexityLevel::Trivial => ComplexityLevel::Simple,
            ComplexityLevel::Simple => ComplexityLevel::Moderate,
            ComplexityLevel::Moderate => ComplexityLevel::Complex,
            ComplexityLevel::Complex | ComplexityLevel::VeryComplex => {
                ComplexityLevel::VeryComplex
            }
        }
    }
}

impl std::fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplexityLevel::Trivial => write!(f, "trivial"),
            ComplexityLevel::Simple => write!(f, "simple"),
            ComplexityLevel::Moderate => write!(f, "moderate"),
            ComplexityLevel::Complex => write!(f, "complex"),
            ComplexityLevel::VeryComplex => write!(f, "very-complex"),
        }
    }
}

// Checked from most to least complex; the first hit wins.
const KEYWORD_LEVELS: &[(ComplexityLevel, &[&str])] = &[
    (
        ComplexityLevel::VeryComplex,
        &[
            "architecture",
            "migrate",
            "migration",
            "redesign",
            "distributed",
            "end-to-end",
            "entire",
            "platform",
        ],
    ),
    (
        ComplexityLevel::Complex,
        &[
            "implement",
            "integrate",
            "build",
            "analyze",
            "analyse",
            "research",
            "optimize",
            "deploy",
            "refactor",
        ],
    ),
    (
        ComplexityLevel::Moderate,
        &[
            "create", "write", "update", "design", "review", "configure", "draft", "compare",
        ],
    ),
    (
        ComplexityLevel::Simple,
        &[
            "check",
            "list",
            "send",
            "fetch",
            "find",
            "summarize",
            "summarise",
            "lookup",
            "look up",
        ],
    ),
    (
        ComplexityLevel::Trivial,
        &["ping", "echo", "print", "hello", "say"],
    ),
];

const LONG_DESCRIPTION_CHARS: usize = 300;

/// Estimated effort for a subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    pub level: ComplexityLevel,
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub factors: Vec<String>,
    /// Confidence in the estimate, `0.0..=1.0`.
    pub confidence: f64,
}

impl ComplexityEstimate {
    /// An estimate at `level` with the level's baseline duration.
    pub fn new(level: ComplexityLevel) -> Self {
        Self {
            level,
            estimated_duration_ms: level.default_duration_ms(),
            factors: Vec::new(),
            confidence: 0.5,
        }
    }

    /// Conservative default used whenever an estimate cannot be obtained.
    pub fn moderate(reason: impl Into<String>) -> Self {
        Self {
            factors: vec![reason.into()],
            confidence: 0.3,
            ..Self::new(ComplexityLevel::Moderate)
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.estimated_duration_ms = duration_ms;
        self
    }

    /// Keyword heuristic over the description.
    ///
    /// Keywords match whole words only. The most complex keyword found
    /// decides the level; long descriptions
    /// are bumped one level. No keyword at all yields `Moderate`.
    pub fn estimate(description: &str) -> Self {
        let tokens = words(description);
        let mut factors = Vec::new();
        let mut level = None;

        for (candidate, keywords) in KEYWORD_LEVELS {
            let hits: Vec<&str> = keywords
                .iter()
                .copied()
                .filter(|k| contains_phrase(&tokens, k))
                .collect();
            if !hits.is_empty() {
                factors.extend(hits.iter().map(|k| format!("keyword:{k}")));
                level = Some(*candidate);
                break;
            }
        }

        let matched = level.is_some();
        let mut level = level.unwrap_or(ComplexityLevel::Moderate);
        if description.chars().count() > LONG_DESCRIPTION_CHARS {
            level = level.bump();
            factors.push("long description".to_string());
        }
        if !matched {
            factors.push("no complexity keywords".to_string());
        }

        Self {
            level,
            estimated_duration_ms: level.default_duration_ms(),
            factors,
            confidence: if matched { 0.5 } else { 0.3 },
        }
    }
}

/// Lowercased alphanumeric words of `text`.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether `phrase` occurs in `tokens` as a run of whole words.
fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle = words(phrase);
    !needle.is_empty()
        && tokens
            .windows(needle.len())
            .any(|window| window == needle.as_slice())
}

/// How a success criterion is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationKind {
    /// Passes iff the raw result reports success.
    Automated,
    /// Judged by the reasoning oracle.
    OracleCheck,
    /// Deferred to a human outside this system; always passes here.
    Manual,
}

/// A condition a subtask's result must satisfy before it counts as completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub id: Uuid,
    pub description: String,
    pub kind: VerificationKind,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub met: bool,
    #[serde(default)]
    pub verified_at: Option<DateTime<Utc>>,
}

impl SuccessCriterion {
    pub fn new(description: impl Into<String>, kind: VerificationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            kind,
            instructions: None,
            met: false,
            verified_at: None,
        }
    }

    pub fn automated(description: impl Into<String>) -> Self {
        Self::new(description, VerificationKind::Automated)
    }

    pub fn oracle_check(description: impl Into<String>) -> Self {
        Self::new(description, VerificationKind::OracleCheck)
    }

    pub fn manual(description: impl Into<String>) -> Self {
        Self::new(description, VerificationKind::Manual)
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// The single oracle-checked criterion given to subtasks that declare none.
    pub fn default_for(description: &str) -> Self {
        Self::oracle_check(format!("The result accomplishes: {description}"))
    }
}

/// Outcome of checking one [`SuccessCriterion`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub criterion_id: Uuid,
    pub passed: bool,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl VerificationResult {
    pub fn new(criterion_id: Uuid, passed: bool, details: impl Into<String>) -> Self {
        Self {
            criterion_id,
            passed,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Result of executing (and verifying) one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub verifications: Vec<VerificationResult>,
    #[serde(default)]
    pub duration_ms: u64,
    /// The worker that actually produced this result, when the caller routed
    /// the subtask itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl SubtaskResult {
    pub fn success(output: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            success: true,
            output,
            message: message.into(),
            error: None,
            verifications: Vec::new(),
            duration_ms: 0,
            worker_id: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: serde_json::Value::Null,
            message: error.clone(),
            error: Some(error),
            verifications: Vec::new(),
            duration_ms: 0,
            worker_id: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Status of a subtask.
///
/// `pending → ready → in-progress → {completed | failed}`, `pending → blocked`,
/// `pending/ready → skipped`. Terminal states have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubtaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl SubtaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubtaskStatus::Completed
                | SubtaskStatus::Failed
                | SubtaskStatus::Blocked
                | SubtaskStatus::Skipped
        )
    }

    /// Every status, in lifecycle order.
    pub const ALL: [SubtaskStatus; 7] = [
        SubtaskStatus::Pending,
        SubtaskStatus::Ready,
        SubtaskStatus::InProgress,
        SubtaskStatus::Completed,
        SubtaskStatus::Failed,
        SubtaskStatus::Blocked,
        SubtaskStatus::Skipped,
    ];
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskStatus::Pending => write!(f, "pending"),
            SubtaskStatus::Ready => write!(f, "ready"),
            SubtaskStatus::InProgress => write!(f, "in-progress"),
            SubtaskStatus::Completed => write!(f, "completed"),
            SubtaskStatus::Failed => write!(f, "failed"),
            SubtaskStatus::Blocked => write!(f, "blocked"),
            SubtaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Aggregate status of a task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl GraphStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GraphStatus::Completed | GraphStatus::Failed | GraphStatus::Cancelled
        )
    }
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphStatus::Pending => write!(f, "pending"),
            GraphStatus::Executing => write!(f, "executing"),
            GraphStatus::Completed => write!(f, "completed"),
            GraphStatus::Failed => write!(f, "failed"),
            GraphStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Metadata key holding the capabilities a subtask requires.
pub const META_CAPABILITIES: &str = "capabilities";
/// Metadata key holding worker ids that must not be routed this subtask.
pub const META_EXCLUDED_WORKERS: &str = "excluded_workers";
/// Metadata key counting how often the replanner touched this subtask.
pub const META_REPLAN_ATTEMPTS: &str = "replan_attempts";

/// A node of the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    pub success_criteria: Vec<SuccessCriterion>,
    pub complexity: ComplexityEstimate,
    #[serde(default)]
    pub dependencies: BTreeSet<Uuid>,
    pub category: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    pub status: SubtaskStatus,
    #[serde(default)]
    pub result: Option<SubtaskResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Subtask {
    /// Build a pending subtask from a description and options, filling in the
    /// default criterion and heuristic complexity where they are missing.
    pub fn new(description: impl Into<String>, options: SubtaskOptions) -> Self {
        let description = description.into();
        let success_criteria = if options.success_criteria.is_empty() {
            vec![SuccessCriterion::default_for(&description)]
        } else {
            options.success_criteria
        };
        let complexity = options
            .complexity
            .unwrap_or_else(|| ComplexityEstimate::estimate(&description));

        Self {
            id: options.id.unwrap_or_else(Uuid::new_v4),
            parent_id: options.parent_id,
            description,
            steps: options.steps,
            success_criteria,
            complexity,
            dependencies: options.dependencies.into_iter().collect(),
            category: options
                .category
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            priority: options.priority,
            assigned_worker: None,
            status: SubtaskStatus::Pending,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: options.metadata,
        }
    }

    /// Whether every dependency is in `completed`.
    pub fn dependencies_met(&self, completed: &HashSet<Uuid>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Capabilities the router should match against: the `capabilities`
    /// metadata array if present, otherwise the category itself.
    pub fn required_capabilities(&self) -> Vec<String> {
        let declared = string_list(self.metadata.get(META_CAPABILITIES));
        if !declared.is_empty() {
            return declared;
        }
        if self.category == DEFAULT_CATEGORY {
            Vec::new()
        } else {
            vec![self.category.clone()]
        }
    }

    /// Worker ids this subtask must not be routed to.
    pub fn excluded_workers(&self) -> Vec<String> {
        string_list(self.metadata.get(META_EXCLUDED_WORKERS))
    }

    /// How many times the replanner has revised this subtask.
    pub fn replan_attempts(&self) -> u32 {
        self.metadata
            .get(META_REPLAN_ATTEMPTS)
            .and_then(serde_json::Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Optional settings for [`crate::graph::TaskGraph::add_subtask`].
#[derive(Debug, Clone, Default)]
pub struct SubtaskOptions {
    /// Explicit id; a fresh one is generated when absent.
    pub id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub steps: Vec<String>,
    /// Empty means "one default oracle-check criterion".
    pub success_criteria: Vec<SuccessCriterion>,
    /// `None` means "estimate from the description".
    pub complexity: Option<ComplexityEstimate>,
    pub dependencies: Vec<Uuid>,
    pub category: Option<String>,
    pub priority: Priority,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SubtaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_complexity(mut self, complexity: ComplexityEstimate) -> Self {
        self.complexity = Some(complexity);
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<SuccessCriterion>) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.metadata.insert(
            META_CAPABILITIES.to_string(),
            serde_json::Value::from(capabilities),
        );
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
