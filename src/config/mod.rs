//! Pipeline configuration.
//!
//! One YAML file per pipeline, deserialized into defaulted serde structs.
//! The config is loaded once (at `--init` it is snapshotted into the run's
//! `config/` directory; every later invocation reads the snapshot) and passed
//! down as an immutable value.
//!
//! # File format
//!
//! ```yaml
//! pipeline:
//!   name: people-profiles
//!   steps:
//!     - name: generate
//!       provider: openai
//!     - name: simulate
//!       scope: expression
//!       init: { pos: 5 }
//!       expressions: { move: "random.choice([-1, 1])", pos: "pos + move" }
//!       loop_until: "pos <= 0 or pos >= 10"
//!     - name: score
//! api:
//!   max_inflight_batches: 4
//!   poll_interval_seconds: 30
//!   retry: { max_attempts: 3, initial_delay_seconds: 2, backoff_multiplier: 2.0 }
//! processing:
//!   strategy: direct
//!   chunk_size: 50
//!   items: { source: items.yaml, key: people, name_field: name }
//! prompts:
//!   template_dir: templates
//!   templates: { generate: generate.j2, score: score.j2 }
//! schemas:
//!   schema_dir: schemas
//!   files: { generate: generate.json, score: score.json }
//! validation:
//!   generate:
//!     required: [name, summary]
//! ```

pub mod validate;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub api: ApiConfig,
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub schemas: SchemasConfig,
    #[serde(default)]
    pub validation: BTreeMap<String, RuleSet>,
    #[serde(default)]
    pub post_process: Vec<PostProcessStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<StepConfig>,
}

/// Stage scope: where and how often the stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    /// Per-unit LLM stage: renders a prompt, calls a provider, validates.
    #[default]
    Llm,
    /// Per-unit local computation: no API calls, zero cost.
    Expression,
    /// Executes once per run after all chunks are terminal; idempotent via
    /// `completed_run_steps`.
    Run,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub scope: StageScope,
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Ordered: each expression's result is visible to the ones after it.
    #[serde(default)]
    pub init: IndexMap<String, String>,
    #[serde(default)]
    pub expressions: IndexMap<String, String>,
    #[serde(default)]
    pub loop_until: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub script: Option<String>,
}

fn default_max_iterations() -> u32 {
    1000
}

impl StepConfig {
    pub fn is_llm(&self) -> bool {
        self.scope == StageScope::Llm
    }

    pub fn is_expression(&self) -> bool {
        self.scope == StageScope::Expression
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Default provider for LLM stages; stages may override, the CLI may
    /// override both.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_inflight")]
    pub max_inflight_batches: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_seconds: u64,
}

fn default_max_inflight() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    30
}

fn default_subprocess_timeout() -> u64 {
    600
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            max_inflight_batches: default_max_inflight(),
            poll_interval_seconds: default_poll_interval(),
            retry: RetryConfig::default(),
            realtime: RealtimeConfig::default(),
            subprocess_timeout_seconds: default_subprocess_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    2.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_seconds: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff delay before attempt `attempt` (0-based retry).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let secs = self.initial_delay_seconds * self.backoff_multiplier.powi(attempt as i32);
        std::time::Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub cost_cap_usd: Option<f64>,
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
}

fn default_auto_retry() -> bool {
    true
}

/// Unit-generation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Ordered arrangements of the item list across the declared positions.
    Permutation,
    /// Cartesian product, one source list per position (`source_key`).
    CrossProduct,
    /// One unit per item.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub strategy: Strategy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Monte-Carlo repetition count.
    #[serde(default)]
    pub repeat: Option<u32>,
    /// Applied to every generated unit before chunking.
    #[serde(default)]
    pub expressions: IndexMap<String, String>,
    #[serde(default)]
    pub positions: Vec<PositionConfig>,
    pub items: ItemsConfig,
    #[serde(default)]
    pub validation_retry: ValidationRetryConfig,
}

fn default_chunk_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    pub name: String,
    /// For `cross_product`: the key in the items source feeding this position.
    #[serde(default)]
    pub source_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsConfig {
    /// Items file, relative to the config file (YAML or JSON).
    pub source: PathBuf,
    /// Key under which the item list lives.
    pub key: String,
    /// Field used to build `unit_id`s.
    pub name_field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRetryConfig {
    #[serde(default = "default_validation_retries")]
    pub max_attempts: u32,
}

fn default_validation_retries() -> u32 {
    2
}

impl Default for ValidationRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_validation_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptsConfig {
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    /// Stage name → template file under `template_dir`.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Merged into every render context.
    #[serde(default)]
    pub global_context: BTreeMap<String, serde_json::Value>,
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("templates")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemasConfig {
    #[serde(default = "default_schema_dir")]
    pub schema_dir: PathBuf,
    /// Stage name → schema file under `schema_dir`.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub strict_mode: bool,
    #[serde(default = "default_true")]
    pub log_validation_errors: bool,
}

fn default_schema_dir() -> PathBuf {
    PathBuf::from("schemas")
}

fn default_true() -> bool {
    true
}

/// Business-rule block for one stage (Phase 2 validation).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleSet {
    #[serde(default)]
    pub required: Vec<String>,
    /// field → expected type name (string/number/boolean/object/array).
    #[serde(default)]
    pub types: BTreeMap<String, String>,
    /// field → allowed members, case-insensitive.
    #[serde(default)]
    pub enums: BTreeMap<String, Vec<serde_json::Value>>,
    /// field → [min, max] inclusive.
    #[serde(default)]
    pub ranges: BTreeMap<String, [f64; 2]>,
    #[serde(default)]
    pub rules: Vec<BusinessRule>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
            && self.types.is_empty()
            && self.enums.is_empty()
            && self.ranges.is_empty()
            && self.rules.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRule {
    /// Boolean expression evaluated in the sandboxed evaluator.
    pub rule: String,
    /// Error message template; `{field}` placeholders interpolate from the
    /// record.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub level: RuleLevel,
    /// Gate: the rule only runs when this expression is true (and the fields
    /// it names are present).
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleLevel {
    #[default]
    Error,
    Warning,
}

/// One post-processing step, run in the run directory after all chunks are
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessStep {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<PostProcessKind>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: Option<String>,
    /// Globs of artifacts to compress (gzip kind).
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub keep_originals: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessKind {
    Script,
    Gzip,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config at {}", path.display()))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline config at {}", path.display()))?;
        if config.pipeline.name.is_empty() {
            config.pipeline.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("pipeline")
                .to_string();
        }
        Ok(config)
    }

    /// Load the config snapshotted into a run directory at `--init`.
    pub fn load_snapshot(run_dir: &Path) -> Result<Self> {
        Self::load(&run_dir.join("config").join("config.yaml"))
    }

    /// Per-chunk stages, in order (LLM and expression; run-scope excluded).
    pub fn chunk_stages(&self) -> Vec<&StepConfig> {
        self.pipeline
            .steps
            .iter()
            .filter(|s| s.scope != StageScope::Run)
            .collect()
    }

    /// Names of per-chunk stages — the manifest's `pipeline_list`.
    pub fn stage_names(&self) -> Vec<String> {
        self.chunk_stages().iter().map(|s| s.name.clone()).collect()
    }

    /// Run-scope stages, executed once per run in the epilogue.
    pub fn run_steps(&self) -> Vec<&StepConfig> {
        self.pipeline
            .steps
            .iter()
            .filter(|s| s.scope == StageScope::Run)
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StepConfig> {
        self.pipeline.steps.iter().find(|s| s.name == name)
    }

    /// Resolved provider name for a stage: stage override → api default →
    /// registry requirement surfaces as an error at prerequisite check.
    pub fn provider_for(&self, stage: &StepConfig) -> Option<String> {
        stage
            .provider
            .clone()
            .or_else(|| self.api.provider.clone())
    }

    pub fn model_for(&self, stage: &StepConfig) -> Option<String> {
        stage.model.clone().or_else(|| self.api.model.clone())
    }

    /// Distinct providers referenced by any LLM stage, for the prerequisite
    /// check.
    pub fn providers_in_use(&self) -> Vec<String> {
        let mut providers: Vec<String> = self
            .chunk_stages()
            .iter()
            .filter(|s| s.is_llm())
            .filter_map(|s| self.provider_for(s))
            .collect();
        providers.sort();
        providers.dedup();
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
pipeline:
  name: demo
  steps:
    - name: generate
    - name: simulate
      scope: expression
      expressions:
        score: "len(name) * 2"
    - name: finalize
      scope: run
      script: scripts/report.sh
processing:
  strategy: direct
  chunk_size: 10
  items:
    source: items.yaml
    key: people
    name_field: name
prompts:
  templates:
    generate: generate.j2
schemas:
  files:
    generate: generate.json
validation:
  generate:
    required: [name]
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: PipelineConfig = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.pipeline.name, "demo");
        assert_eq!(config.api.max_inflight_batches, 4);
        assert_eq!(config.api.poll_interval_seconds, 30);
        assert_eq!(config.api.subprocess_timeout_seconds, 600);
        assert_eq!(config.api.retry.max_attempts, 3);
        assert_eq!(config.processing.chunk_size, 10);
    }

    #[test]
    fn stage_scopes_partition_correctly() {
        let config: PipelineConfig = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.stage_names(), vec!["generate", "simulate"]);
        assert_eq!(config.run_steps().len(), 1);
        assert!(config.stage("generate").unwrap().is_llm());
        assert!(config.stage("simulate").unwrap().is_expression());
    }

    #[test]
    fn expression_order_is_preserved() {
        let yaml = r#"
name: ordered
expressions:
  first: "1"
  second: "first + 1"
  third: "second + 1"
"#;
        let step: StepConfig = serde_yaml::from_str(yaml).unwrap();
        let keys: Vec<&String> = step.expressions.keys().collect();
        assert_eq!(keys, vec!["first", "second", "third"]);
    }

    #[test]
    fn provider_resolution_prefers_stage_override() {
        let mut config: PipelineConfig = serde_yaml::from_str(MINIMAL).unwrap();
        config.api.provider = Some("openai".to_string());
        config.pipeline.steps[0].provider = Some("anthropic".to_string());
        let stage = config.stage("generate").unwrap();
        assert_eq!(config.provider_for(stage), Some("anthropic".to_string()));
        assert_eq!(config.providers_in_use(), vec!["anthropic"]);
    }

    #[test]
    fn backoff_delays_grow_exponentially() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_seconds: 2.0,
            backoff_multiplier: 3.0,
        };
        assert_eq!(retry.delay_for_attempt(0).as_secs_f64(), 2.0);
        assert_eq!(retry.delay_for_attempt(1).as_secs_f64(), 6.0);
        assert_eq!(retry.delay_for_attempt(2).as_secs_f64(), 18.0);
    }
}
