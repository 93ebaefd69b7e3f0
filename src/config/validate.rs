//! Offline configuration validation (`--validate-config`).
//!
//! Enforces the 4-point link rule — every LLM stage name must appear
//! identically in `pipeline.steps`, `prompts.templates`, `schemas.files`,
//! and `validation` — and dry-runs every expression against a mock context.
//! When an expression fails, a safe fallback is injected into the mock
//! symbol table so later expressions do not cascade into spurious
//! "undefined" errors.

use super::{PipelineConfig, StepConfig};
use crate::expr::{self, EvalContext, StageRng};
use anyhow::Result;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validate a pipeline config against the directory it was loaded from
/// (templates, schemas, and items resolve relative to it).
pub fn validate_config(config: &PipelineConfig, config_dir: &Path) -> Result<ConfigReport> {
    let mut report = ConfigReport::default();

    if config.pipeline.steps.is_empty() {
        report.error("pipeline has no steps");
        return Ok(report);
    }

    let mut seen = std::collections::BTreeSet::new();
    for step in &config.pipeline.steps {
        if !seen.insert(&step.name) {
            report.error(format!("duplicate stage name '{}'", step.name));
        }
    }

    check_four_point_link(config, &mut report);
    check_files(config, config_dir, &mut report);

    let mock = mock_context(config);
    for step in &config.pipeline.steps {
        check_step_expressions(step, &mock, &mut report);
    }
    for (stage, rules) in &config.validation {
        for rule in &rules.rules {
            if let Err(e) = expr::parse(&rule.rule) {
                report.error(format!("validation rule for '{stage}': {e}"));
            }
            if let Some(when) = &rule.when {
                if let Err(e) = expr::parse(when) {
                    report.error(format!("'when' guard for '{stage}': {e}"));
                }
            }
        }
    }

    if config.processing.items.name_field.is_empty() {
        report.error("processing.items.name_field is empty");
    }

    Ok(report)
}

/// Every LLM stage needs all four links; expression and run stages are
/// exempt. Orphaned wiring entries are warnings, not errors.
fn check_four_point_link(config: &PipelineConfig, report: &mut ConfigReport) {
    let llm_stages: Vec<&String> = config
        .pipeline
        .steps
        .iter()
        .filter(|s| s.is_llm())
        .map(|s| &s.name)
        .collect();

    for stage in &llm_stages {
        if !config.prompts.templates.contains_key(*stage) {
            report.error(format!(
                "LLM stage '{stage}' has no entry in prompts.templates"
            ));
        }
        if !config.schemas.files.contains_key(*stage) {
            report.error(format!("LLM stage '{stage}' has no entry in schemas.files"));
        }
        if !config.validation.contains_key(*stage) {
            report.error(format!("LLM stage '{stage}' has no validation block"));
        }
    }

    let stage_names: std::collections::BTreeSet<&String> =
        config.pipeline.steps.iter().map(|s| &s.name).collect();
    for key in config
        .prompts
        .templates
        .keys()
        .chain(config.schemas.files.keys())
        .chain(config.validation.keys())
    {
        if !stage_names.contains(key) {
            report.warning(format!("'{key}' is wired but not a pipeline step"));
        }
    }
}

fn check_files(config: &PipelineConfig, config_dir: &Path, report: &mut ConfigReport) {
    for (stage, file) in &config.prompts.templates {
        let path = config_dir.join(&config.prompts.template_dir).join(file);
        if !path.exists() {
            report.error(format!(
                "template for '{stage}' not found at {}",
                path.display()
            ));
        }
    }
    for (stage, file) in &config.schemas.files {
        let path = config_dir.join(&config.schemas.schema_dir).join(file);
        match std::fs::read_to_string(&path) {
            Err(_) => report.error(format!(
                "schema for '{stage}' not found at {}",
                path.display()
            )),
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Err(e) => report.error(format!("schema for '{stage}' is not JSON: {e}")),
                Ok(schema) => {
                    if let Err(e) = crate::validation::SchemaValidator::new(schema) {
                        report.error(format!("schema for '{stage}' does not compile: {e:#}"));
                    }
                }
            },
        }
    }
    let items = config_dir.join(&config.processing.items.source);
    if !items.exists() {
        report.error(format!("items source not found at {}", items.display()));
    }
}

/// Placeholder context covering every field a unit could carry.
fn mock_context(config: &PipelineConfig) -> Map<String, Value> {
    let mut mock = Map::new();
    mock.insert("unit_id".to_string(), json!("mock_unit"));
    mock.insert("_repetition_id".to_string(), json!(0));
    mock.insert("_repetition_seed".to_string(), json!(1));
    mock.insert(config.processing.items.name_field.clone(), json!("mock"));
    for position in &config.processing.positions {
        mock.insert(
            position.name.clone(),
            json!({config.processing.items.name_field.clone(): "mock"}),
        );
    }
    for (key, value) in &config.prompts.global_context {
        mock.insert(key.clone(), value.clone());
    }
    mock
}

/// Dry-run a step's expression blocks against the mock context.
fn check_step_expressions(
    step: &StepConfig,
    mock: &Map<String, Value>,
    report: &mut ConfigReport,
) {
    if step.init.is_empty() && step.expressions.is_empty() && step.loop_until.is_none() {
        return;
    }

    let mut vars: HashMap<String, Value> =
        mock.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let mut rng = StageRng::from_seed(0);

    for (name, source) in step.init.iter().chain(step.expressions.iter()) {
        let outcome = expr::parse(source).and_then(|ast| {
            let mut ctx = EvalContext::new(&mut vars, Some(&mut rng));
            expr::eval(&ast, &mut ctx)
        });
        match outcome {
            Ok(value) => {
                vars.insert(name.clone(), value);
            }
            Err(e) => {
                report.error(format!("step '{}', expression '{name}': {e}", step.name));
                // Fallback injection: keep downstream checks meaningful.
                vars.insert(name.clone(), json!(0));
            }
        }
    }

    if let Some(cond) = &step.loop_until {
        let outcome = expr::parse(cond).and_then(|ast| {
            let mut ctx = EvalContext::new(&mut vars, Some(&mut rng));
            expr::eval(&ast, &mut ctx)
        });
        if let Err(e) = outcome {
            report.error(format!("step '{}', loop_until: {e}", step.name));
        }
    }
}
