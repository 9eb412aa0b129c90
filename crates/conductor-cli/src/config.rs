//! `conductor.toml` loading.
//!
//! Every section is optional; a missing file section falls back to the
//! library defaults, and a config without `[[workers]]` gets the built-in
//! roster from [`default_workers`].

use conductor_core::{ConductorError, ConductorResult};
use conductor_orchestrator::{ExecutorConfig, PlannerConfig, RouterConfig, WorkerProfile};
use serde::Deserialize;
use std::path::Path;

/// Full CLI configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// One simulated worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub category: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Simulated time spent on every task.
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// Tasks whose description contains one of these words fail.
    #[serde(default)]
    pub fail_on: Vec<String>,
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_latency_ms() -> u64 {
    50
}

impl WorkerConfig {
    fn new(id: &str, category: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            category: category.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_concurrent: default_max_concurrent(),
            latency_ms: default_latency_ms(),
            fail_on: Vec::new(),
        }
    }

    pub fn profile(&self) -> WorkerProfile {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("{} worker", self.id));
        WorkerProfile::new(&self.id, name, &self.category)
            .with_capabilities(self.capabilities.clone())
            .with_max_concurrent(self.max_concurrent)
    }
}

impl ConductorConfig {
    /// Configured workers, or the built-in roster when none are configured.
    pub fn workers(&self) -> Vec<WorkerConfig> {
        if self.workers.is_empty() {
            default_workers()
        } else {
            self.workers.clone()
        }
    }
}

/// Built-in roster: one worker per category the offline planner emits.
pub fn default_workers() -> Vec<WorkerConfig> {
    vec![
        WorkerConfig::new("generalist", "general", &[]),
        WorkerConfig::new("engineer", "engineering", &["engineering", "code", "api"]),
        WorkerConfig::new("counsel", "legal", &["legal", "contracts", "compliance"]),
        WorkerConfig::new("analyst", "research", &["research", "data"]),
        WorkerConfig::new("writer", "writing", &["writing", "editing"]),
    ]
}

/// Read and parse a TOML config file.
pub fn parse_config(path: &Path) -> ConductorResult<ConductorConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConductorError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        ConductorError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}

/// `path` parsed, or the defaults when no path was given.
pub fn load(path: Option<&Path>) -> ConductorResult<ConductorConfig> {
    match path {
        Some(path) => parse_config(path),
        None => Ok(ConductorConfig::default()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            tmp.as_file_mut(),
            r#"
[planner]
auto_replan = true

[executor]
max_concurrent = 2
fail_fast = true

[[workers]]
id = "counsel"
category = "legal"
capabilities = ["contracts"]
fail_on = ["forgery"]
"#
        )
        .unwrap();

        let config = parse_config(tmp.path()).unwrap();
        assert!(config.planner.auto_replan);
        assert_eq!(config.planner.max_replan_attempts, 2);
        assert_eq!(config.executor.max_concurrent, 2);
        assert!(config.executor.fail_fast);
        assert_eq!(config.executor.max_retries, 2);
        assert_eq!(config.router.max_alternatives, 3);

        let workers = config.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].latency_ms, 50);
        let profile = workers[0].profile();
        assert_eq!(profile.name, "counsel worker");
        assert!(profile.has_capability("CONTRACTS"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut()).unwrap();

        let config = parse_config(tmp.path()).unwrap();
        assert!(!config.planner.auto_replan);
        assert_eq!(config.executor.max_concurrent, 5);
        assert_eq!(config.workers().len(), default_workers().len());
    }

    #[test]
    fn test_parse_invalid_toml_returns_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "{{{{invalid toml!!!!").unwrap();
        let err = parse_config(tmp.path()).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config"), "unexpected error: {err}");
    }

    #[test]
    fn test_missing_file_returns_error() {
        let err = load(Some(Path::new("/nonexistent/conductor.toml")))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read config"), "unexpected error: {err}");
        assert!(load(None).is_ok());
    }
}
