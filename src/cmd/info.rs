//! `--info`: detailed view of one run.

use crate::manifest::{self, Summary};
use crate::orchestrator::lifecycle::classify;
use crate::registry::ModelRegistry;
use crate::rundir::RunDir;
use anyhow::Result;
use console::style;
use serde_json::json;
use std::path::Path;

pub fn cmd_info(run_dir: &Path, json_output: bool) -> Result<()> {
    let m = manifest::load(run_dir)?;
    let registry = ModelRegistry::load_for_run(run_dir);
    let summary = Summary::derive(&m, &registry);
    let liveness = classify(&RunDir::new(run_dir), &m);

    if json_output {
        let output = json!({
            "run_dir": run_dir.display().to_string(),
            "summary": summary,
            "metadata": m.metadata,
            "pipeline": m.pipeline_list,
            "chunks": m.chunks,
            "completed_run_steps": m.completed_run_steps,
            "liveness": format!("{liveness:?}").to_lowercase(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", style(format!("run {}", run_dir.display())).bold());
    println!("  pipeline:  {} [{}]", summary.pipeline_name, m.pipeline_list.join(" -> "));
    println!("  status:    {} ({liveness:?})", summary.status);
    println!("  mode:      {}", summary.mode);
    println!(
        "  provider:  {} / {}",
        m.metadata.provider, m.metadata.model
    );
    println!("  progress:  {:.1}%", summary.progress_pct);
    println!(
        "  units:     {} total, {} valid, {} failed",
        summary.total_units, summary.valid_units, summary.failed_units
    );
    println!(
        "  tokens:    {} (initial in/out {}/{}, retry in/out {}/{})",
        summary.total_tokens,
        m.metadata.initial_input_tokens,
        m.metadata.initial_output_tokens,
        m.metadata.retry_input_tokens,
        m.metadata.retry_output_tokens
    );
    println!("  cost:      ${:.4}", summary.cost_usd);
    if let Some(error) = &m.metadata.error {
        println!("  error:     {}", style(error).red());
    }
    println!("  chunks:");
    for (name, info) in &m.chunks {
        let batch = info
            .batch_id
            .as_deref()
            .map(|id| format!(" batch={id}"))
            .unwrap_or_default();
        println!(
            "    {:<12} {:<24} units={:<5} valid={:<5} failed={:<5} retries={}{}",
            name, info.state, info.unit_count, info.valid_count, info.failed_count,
            info.retry_count, batch
        );
    }
    if !m.completed_run_steps.is_empty() {
        println!("  run steps: {}", m.completed_run_steps.join(", "));
    }
    Ok(())
}
