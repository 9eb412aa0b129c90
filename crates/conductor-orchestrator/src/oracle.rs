//! Reasoning oracle seam.
//!
//! The planner asks an oracle to classify goals, decompose them and judge
//! success criteria. Replies are untrusted: [`PromptOracle`] parses free text
//! into typed values and degrades to conservative defaults when a reply
//! cannot be used. [`HeuristicOracle`] answers offline from keywords.

use crate::planner::PlanConstraints;
use crate::types::{
    ComplexityEstimate, ComplexityLevel, Priority, SubtaskOptions, SuccessCriterion,
    VerificationKind,
};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Complexity classification of a goal or subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityAssessment {
    #[serde(deserialize_with = "lenient_level")]
    pub level: ComplexityLevel,
    #[serde(default)]
    pub factors: Vec<String>,
    #[serde(default, alias = "estimatedMinutes")]
    pub estimated_minutes: Option<u64>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl ComplexityAssessment {
    /// Conservative default for unusable replies.
    pub fn moderate(reason: impl Into<String>) -> Self {
        Self::from(ComplexityEstimate::moderate(reason))
    }

    pub fn to_estimate(&self) -> ComplexityEstimate {
        let duration = self
            .estimated_minutes
            .map_or(self.level.default_duration_ms(), |m| m.saturating_mul(60_000));
        ComplexityEstimate {
            level: self.level,
            estimated_duration_ms: duration,
            factors: self.factors.clone(),
            confidence: self.confidence.clamp(0.0, 1.0),
        }
    }
}

impl From<ComplexityEstimate> for ComplexityAssessment {
    fn from(estimate: ComplexityEstimate) -> Self {
        Self {
            level: estimate.level,
            factors: estimate.factors,
            estimated_minutes: Some(estimate.estimated_duration_ms / 60_000),
            confidence: estimate.confidence,
        }
    }
}

/// A criterion as proposed by the oracle: either bare text or a full object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProposedCriterion {
    Text(String),
    Detailed {
        description: String,
        #[serde(default = "default_kind")]
        kind: VerificationKind,
        #[serde(default)]
        instructions: Option<String>,
    },
}

fn default_kind() -> VerificationKind {
    VerificationKind::OracleCheck
}

impl ProposedCriterion {
    pub fn into_criterion(self) -> SuccessCriterion {
        match self {
            ProposedCriterion::Text(description) => SuccessCriterion::oracle_check(description),
            ProposedCriterion::Detailed {
                description,
                kind,
                instructions,
            } => {
                let criterion = SuccessCriterion::new(description, kind);
                match instructions {
                    Some(text) => criterion.with_instructions(text),
                    None => criterion,
                }
            }
        }
    }
}

/// One subtask of a decomposition. `id` and `dependencies` are transient ids
/// local to the reply; the planner maps them to real ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedSubtask {
    #[serde(alias = "local_id", alias = "localId", alias = "tempId")]
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Priority,
    #[serde(default, alias = "depends_on", alias = "dependsOn")]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "successCriteria", alias = "criteria")]
    pub success_criteria: Vec<ProposedCriterion>,
    #[serde(default, deserialize_with = "lenient_optional_level")]
    pub complexity: Option<ComplexityLevel>,
    #[serde(default, alias = "estimatedMinutes")]
    pub estimated_minutes: Option<u64>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ProposedSubtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            steps: Vec::new(),
            category: None,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            success_criteria: Vec::new(),
            complexity: None,
            estimated_minutes: None,
            capabilities: Vec::new(),
        }
    }

    pub fn after(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Graph options for this proposal. Dependencies are left empty: the
    /// transient ids have to be resolved by the caller.
    pub fn to_options(&self) -> SubtaskOptions {
        let mut options = SubtaskOptions::new()
            .with_priority(self.priority)
            .with_steps(self.steps.clone())
            .with_criteria(
                self.success_criteria
                    .iter()
                    .cloned()
                    .map(ProposedCriterion::into_criterion)
                    .collect(),
            );
        if let Some(category) = self.category.as_ref().filter(|c| !c.trim().is_empty()) {
            options = options.with_category(category.trim().to_lowercase());
        }
        if let Some(estimate) = self.estimate() {
            options = options.with_complexity(estimate);
        }
        if !self.capabilities.is_empty() {
            options = options.with_capabilities(self.capabilities.clone());
        }
        options
    }

    /// The estimate implied by the proposal, if it carried one.
    pub fn estimate(&self) -> Option<ComplexityEstimate> {
        let level = self.complexity?;
        let estimate = ComplexityEstimate::new(level);
        Some(match self.estimated_minutes {
            Some(minutes) => estimate.with_duration_ms(minutes.saturating_mul(60_000)),
            None => estimate,
        })
    }
}

/// A goal split into subtasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub subtasks: Vec<ProposedSubtask>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Verdict on one success criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionJudgement {
    pub passed: bool,
    #[serde(default, alias = "explanation", alias = "reason")]
    pub details: String,
}

/// Why an oracle reply could not be used.
#[derive(Debug, Error)]
pub enum OracleParseError {
    #[error("no JSON object found in oracle reply")]
    NoJson,
    #[error("malformed oracle reply: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("decomposition contains no subtasks")]
    Empty,
}

/// External reasoning service used for planning and verification.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn classify_complexity(
        &self,
        description: &str,
        context: Option<&str>,
    ) -> ConductorResult<ComplexityAssessment>;

    async fn decompose(
        &self,
        description: &str,
        context: Option<&str>,
        constraints: &PlanConstraints,
    ) -> ConductorResult<Decomposition>;

    async fn judge_criterion(
        &self,
        description: &str,
        output: &serde_json::Value,
        criterion: &SuccessCriterion,
    ) -> ConductorResult<CriterionJudgement>;
}

// --- Parsing ---

fn fenced_block() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok())
        .as_ref()
}

/// The JSON object inside a free-text reply: a fenced block if present,
/// otherwise the span from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(captures) = fenced_block().and_then(|re| re.captures(text)) {
        if let Some(body) = captures.get(1) {
            return Some(body.as_str());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_assessment(text: &str) -> Result<ComplexityAssessment, OracleParseError> {
    let json = extract_json(text).ok_or(OracleParseError::NoJson)?;
    Ok(serde_json::from_str(json)?)
}

pub fn parse_decomposition(text: &str) -> Result<Decomposition, OracleParseError> {
    let json = extract_json(text).ok_or(OracleParseError::NoJson)?;
    let decomposition: Decomposition = serde_json::from_str(json)?;
    if decomposition.subtasks.is_empty() {
        return Err(OracleParseError::Empty);
    }
    Ok(decomposition)
}

pub fn parse_judgement(text: &str) -> Result<CriterionJudgement, OracleParseError> {
    let json = extract_json(text).ok_or(OracleParseError::NoJson)?;
    Ok(serde_json::from_str(json)?)
}

fn lenient_level<'de, D: Deserializer<'de>>(d: D) -> Result<ComplexityLevel, D::Error> {
    let raw = String::deserialize(d)?;
    Ok(ComplexityLevel::parse_level(&raw))
}

fn lenient_optional_level<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<ComplexityLevel>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.map(|s| ComplexityLevel::parse_level(&s)))
}

fn lenient_priority<'de, D: Deserializer<'de>>(d: D) -> Result<Priority, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw.map_or(Priority::Normal, |s| Priority::parse_level(&s)))
}

// --- Prompt-backed oracle ---

/// A plain text-completion endpoint.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, system_prompt: &str, prompt: &str) -> ConductorResult<String>;
}

const CLASSIFY_SYSTEM: &str = "Classify the complexity of the task. Reply with a JSON object: \
{\"level\": \"trivial|simple|moderate|complex|very-complex\", \"factors\": [..], \
\"estimated_minutes\": n, \"confidence\": 0..1}.";

const DECOMPOSE_SYSTEM: &str = "Split the goal into subtasks. Reply with a JSON object: \
{\"subtasks\": [{\"id\": \"t1\", \"description\": .., \"steps\": [..], \"category\": .., \
\"priority\": \"low|normal|high|urgent\", \"dependencies\": [\"t0\"], \
\"success_criteria\": [..], \"complexity\": .., \"estimated_minutes\": n}], \
\"reasoning\": .., \"warnings\": [..]}. Dependencies reference sibling ids only.";

const JUDGE_SYSTEM: &str = "Decide whether the output satisfies the criterion. Reply with a JSON \
object: {\"passed\": true|false, \"details\": ..}.";

/// [`ReasoningOracle`] over any [`CompletionBackend`].
///
/// Unparsable classifications fall back to `moderate`. Unparsable
/// decompositions and judgements are reported as [`ConductorError::Oracle`]
/// so the planner can apply its own fallback.
pub struct PromptOracle<B> {
    backend: B,
}

impl<B: CompletionBackend> PromptOracle<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: CompletionBackend> ReasoningOracle for PromptOracle<B> {
    async fn classify_complexity(
        &self,
        description: &str,
        context: Option<&str>,
    ) -> ConductorResult<ComplexityAssessment> {
        let prompt = with_context(format!("Task: {description}"), context);
        let reply = self.backend.complete(CLASSIFY_SYSTEM, &prompt).await?;
        match parse_assessment(&reply) {
            Ok(assessment) => Ok(assessment),
            Err(e) => {
                warn!(error = %e, "Unusable classification; assuming moderate");
                Ok(ComplexityAssessment::moderate(format!(
                    "classification fallback: {e}"
                )))
            }
        }
    }

    async fn decompose(
        &self,
        description: &str,
        context: Option<&str>,
        constraints: &PlanConstraints,
    ) -> ConductorResult<Decomposition> {
        let mut prompt = with_context(format!("Goal: {description}"), context);
        if let Some(max) = constraints.max_subtasks {
            prompt.push_str(&format!("\nUse at most {max} subtasks."));
        }
        if let Some(max) = constraints.max_parallel {
            prompt.push_str(&format!("\nAt most {max} subtasks may run in parallel."));
        }
        let reply = self.backend.complete(DECOMPOSE_SYSTEM, &prompt).await?;
        parse_decomposition(&reply).map_err(|e| ConductorError::Oracle(e.to_string()))
    }

    async fn judge_criterion(
        &self,
        description: &str,
        output: &serde_json::Value,
        criterion: &SuccessCriterion,
    ) -> ConductorResult<CriterionJudgement> {
        let mut prompt = format!(
            "Task: {description}\nCriterion: {}\nOutput: {output}",
            criterion.description
        );
        if let Some(instructions) = &criterion.instructions {
            prompt.push_str(&format!("\nInstructions: {instructions}"));
        }
        let reply = self.backend.complete(JUDGE_SYSTEM, &prompt).await?;
        parse_judgement(&reply).map_err(|e| ConductorError::Oracle(e.to_string()))
    }
}

fn with_context(mut prompt: String, context: Option<&str>) -> String {
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\nContext: ");
        prompt.push_str(context);
    }
    prompt
}

// --- Offline oracle ---

// First match wins.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("legal", &["contract", "legal", "nda", "clause", "compliance"]),
    (
        "engineering",
        &["api", "code", "endpoint", "deploy", "build", "implement", "test", "database"],
    ),
    ("research", &["research", "analy", "investigate", "compare", "data"]),
    ("writing", &["write", "draft", "report", "summar", "document", "email"]),
];

/// Keyword-driven oracle that needs no network.
///
/// Goals written as `A then B; C` become stages: items of a stage run in
/// parallel and depend on every item of the previous stage. A goal that does
/// not split becomes an analyze → execute → review chain.
#[derive(Debug, Clone, Default)]
pub struct HeuristicOracle;

impl HeuristicOracle {
    pub fn new() -> Self {
        Self
    }

    /// Category guessed from the description, `general` when nothing matches.
    pub fn categorize(description: &str) -> String {
        let lower = description.to_lowercase();
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map_or(crate::types::DEFAULT_CATEGORY, |(category, _)| *category)
            .to_string()
    }

    fn stages(description: &str) -> Vec<Vec<String>> {
        let normalized = description.replace(", then ", " then ").replace(". Then ", " then ");
        normalized
            .split(" then ")
            .map(|stage| {
                stage
                    .split(['\n', ';'])
                    .map(|item| item.trim().trim_end_matches('.').trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|stage| !stage.is_empty())
            .collect()
    }

    fn proposal(id: String, description: String, after: Vec<String>) -> ProposedSubtask {
        let estimate = ComplexityEstimate::estimate(&description);
        ProposedSubtask {
            category: Some(Self::categorize(&description)),
            complexity: Some(estimate.level),
            dependencies: after,
            ..ProposedSubtask::new(id, description)
        }
    }
}

#[async_trait]
impl ReasoningOracle for HeuristicOracle {
    async fn classify_complexity(
        &self,
        description: &str,
        _context: Option<&str>,
    ) -> ConductorResult<ComplexityAssessment> {
        Ok(ComplexityEstimate::estimate(description).into())
    }

    async fn decompose(
        &self,
        description: &str,
        _context: Option<&str>,
        _constraints: &PlanConstraints,
    ) -> ConductorResult<Decomposition> {
        let stages = Self::stages(description);
        let single = stages.iter().map(Vec::len).sum::<usize>() <= 1;

        let subtasks = if single {
            let goal = description.trim();
            vec![
                Self::proposal("analyze".into(), format!("Analyze: {goal}"), Vec::new()),
                Self::proposal("execute".into(), format!("Execute: {goal}"), vec!["analyze".into()]),
                Self::proposal("review".into(), format!("Review: {goal}"), vec!["execute".into()]),
            ]
        } else {
            let mut out = Vec::new();
            let mut previous: Vec<String> = Vec::new();
            for (s, stage) in stages.into_iter().enumerate() {
                let mut current = Vec::new();
                for (i, item) in stage.into_iter().enumerate() {
                    let id = format!("s{s}-{i}");
                    out.push(Self::proposal(id.clone(), item, previous.clone()));
                    current.push(id);
                }
                previous = current;
            }
            out
        };

        debug!(subtasks = subtasks.len(), "Heuristic decomposition");
        Ok(Decomposition {
            reasoning: if single {
                "Goal does not split; using an analyze/execute/review chain".to_string()
            } else {
                "Split on 'then' into sequential stages and on ';' into parallel items".to_string()
            },
            subtasks,
            warnings: Vec::new(),
        })
    }

    async fn judge_criterion(
        &self,
        _description: &str,
        output: &serde_json::Value,
        criterion: &SuccessCriterion,
    ) -> ConductorResult<CriterionJudgement> {
        let empty = match output {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.trim().is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        Ok(CriterionJudgement {
            passed: !empty,
            details: if empty {
                format!("No output to satisfy '{}'", criterion.description)
            } else {
                format!("Output present for '{}'", criterion.description)
            },
        })
    }
}
