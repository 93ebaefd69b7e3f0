//! `--revalidate`: re-run validation for one stage from persisted raw
//! responses, with no provider calls.
//!
//! Raw text comes from `{stage}_results.jsonl` where present, falling back
//! to the `raw_response` captured in failure records. With
//! `--use-source-config` the schema and rules are reloaded from the
//! original config path instead of the run's snapshot.

use crate::config::PipelineConfig;
use crate::manifest::{self};
use crate::orchestrator::{Orchestrator, RuntimeOptions};
use crate::rundir;
use crate::validation::{
    FailureRecord, ResponseRecord, SchemaValidator, validate_stage,
};
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub async fn cmd_revalidate(
    run_dir: &Path,
    stage_name: &str,
    use_source_config: bool,
    opts: RuntimeOptions,
) -> Result<()> {
    let orch = Orchestrator::open(run_dir.to_path_buf(), opts)?;
    let stage_index = orch
        .stage_index(stage_name)
        .with_context(|| format!("Unknown stage '{stage_name}'"))?;

    // Optionally re-resolve schema and rules from the source config.
    let (schema, rules) = if use_source_config {
        let m = manifest::load(run_dir)?;
        let source = m
            .metadata
            .source_config_path
            .context("Run does not record a source config path")?;
        if !source.exists() {
            bail!("source config no longer exists at {}", source.display());
        }
        let config = PipelineConfig::load(&source)?;
        let config_dir = source.parent().context("source config has no parent")?;
        let schema = match config.schemas.files.get(stage_name) {
            Some(file) => Some(SchemaValidator::load(
                &config_dir.join(&config.schemas.schema_dir).join(file),
            )?),
            None => None,
        };
        let rules = config.validation.get(stage_name).cloned();
        (schema, rules)
    } else {
        (None, None)
    };
    let schema_ref = schema.as_ref().or_else(|| orch.schema_for(stage_name));
    let rules_ref = rules.as_ref().or_else(|| orch.rules_for(stage_name));

    let mut total_valid = 0usize;
    let mut total_failed = 0usize;
    let mut manifest = orch.store.load()?;

    for chunk in orch.run.list_chunks()? {
        let inputs = match orch.stage_inputs(&chunk, stage_index) {
            Ok(inputs) => inputs,
            Err(_) => continue,
        };
        if inputs.is_empty() {
            continue;
        }

        // Raw text by unit: results file first, failure records second.
        let mut raw: HashMap<String, String> = HashMap::new();
        let results: Vec<Value> =
            rundir::read_jsonl_or_empty(&orch.run.results_file(&chunk, stage_name))?;
        for row in results {
            if let (Some(id), Some(content)) =
                (row["unit_id"].as_str(), row["content"].as_str())
            {
                raw.insert(id.to_string(), content.to_string());
            }
        }
        let failures: Vec<FailureRecord> =
            rundir::read_jsonl_or_empty(&orch.run.failures_file(&chunk, stage_name))?;
        for failure in &failures {
            if !failure.raw_response.is_empty() {
                raw.entry(failure.unit_id.clone())
                    .or_insert_with(|| failure.raw_response.clone());
            }
        }
        if raw.is_empty() {
            continue;
        }

        let responses: Vec<ResponseRecord> = inputs
            .into_iter()
            .filter_map(|input| {
                let unit_id = input.get("unit_id")?.as_str()?.to_string();
                let content = raw.get(&unit_id)?.clone();
                Some(ResponseRecord {
                    unit_id,
                    stage_input: input,
                    content: Some(content),
                    error: None,
                })
            })
            .collect();
        if responses.is_empty() {
            continue;
        }

        let count = responses.len();
        let validation = validate_stage(
            responses,
            schema_ref,
            rules_ref,
            orch.validation_budget(),
            manifest.chunks.get(&chunk).map(|c| c.retry_count).unwrap_or(0),
        )
        .await?;

        rundir::write_jsonl(
            &orch.run.validated_file(&chunk, stage_name),
            &validation.validated,
        )?;
        rundir::write_jsonl(
            &orch.run.failures_file(&chunk, stage_name),
            &validation.failures,
        )?;
        if let Some(info) = manifest.chunks.get_mut(&chunk) {
            info.valid_count = validation.validated.len();
            info.failed_count = validation.failures.len();
        }
        total_valid += validation.validated.len();
        total_failed += validation.failures.len();
        println!(
            "{chunk}/{stage_name}: revalidated {count} response(s) -> {} valid, {} failed",
            validation.validated.len(),
            validation.failures.len()
        );
    }

    orch.store.save(&mut manifest)?;
    println!("revalidation done: {total_valid} valid, {total_failed} failed");
    Ok(())
}
