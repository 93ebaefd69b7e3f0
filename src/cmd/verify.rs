//! `--verify` and `--repair`: offline integrity check and retry-chunk
//! construction for missing units.

use crate::config::PipelineConfig;
use crate::orchestrator::{Orchestrator, RuntimeOptions};
use crate::rundir::RunDir;
use crate::verify::{repair_run, verify_run};
use anyhow::{Result, bail};
use console::style;
use std::path::Path;

/// Display-only cap on id lists; the underlying report is never truncated.
const DISPLAY_IDS: usize = 10;

pub fn cmd_verify(run_dir: &Path, json_output: bool) -> Result<i32> {
    let config = PipelineConfig::load_snapshot(run_dir)?;
    let run = RunDir::new(run_dir);
    let report = verify_run(&run, &config)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for stage in &report.stages {
            let marker = if stage.clean() {
                style("ok").green().to_string()
            } else {
                style("BAD").red().to_string()
            };
            println!(
                "{marker}  {}: expected={} valid={} failed={} missing={} duplicated={} orphaned={}",
                stage.stage,
                stage.expected,
                stage.valid,
                stage.failed,
                stage.missing.len(),
                stage.duplicated.len(),
                stage.orphaned.len()
            );
            print_ids("missing", &stage.missing);
            print_ids("duplicated", &stage.duplicated);
            print_ids("orphaned", &stage.orphaned);
        }
    }
    Ok(if report.clean() { 0 } else { 1 })
}

fn print_ids(label: &str, ids: &[String]) {
    if ids.is_empty() {
        return;
    }
    let shown: Vec<&String> = ids.iter().take(DISPLAY_IDS).collect();
    let suffix = if ids.len() > DISPLAY_IDS {
        format!(" ... and {} more", ids.len() - DISPLAY_IDS)
    } else {
        String::new()
    };
    println!(
        "      {label}: {}{suffix}",
        shown
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

pub fn cmd_repair(run_dir: &Path, assume_yes: bool, opts: RuntimeOptions) -> Result<i32> {
    if !assume_yes {
        bail!("--repair mutates the run; pass --yes to confirm");
    }
    let mut orch = Orchestrator::open(run_dir.to_path_buf(), opts)?;
    let report = verify_run(&orch.run, &orch.config)?;
    if report.total_missing() == 0 {
        println!("nothing to repair: no missing units");
        return Ok(0);
    }

    let created = repair_run(&mut orch, &report)?;
    if created.is_empty() {
        println!(
            "{} missing unit(s) already covered by pending chunks; nothing created",
            report.total_missing()
        );
        return Ok(0);
    }
    println!(
        "created {} retry chunk(s) covering {} missing unit(s)",
        created.len(),
        report.total_missing()
    );
    for name in created {
        println!("  {name}");
    }
    Ok(0)
}
