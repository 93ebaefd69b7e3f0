//! `--ps`: list every run under the working directory with status,
//! progress, and cost.

use crate::manifest::{self, Summary};
use crate::orchestrator::lifecycle::{Liveness, classify};
use crate::registry::ModelRegistry;
use crate::rundir::RunDir;
use anyhow::Result;
use console::style;
use serde_json::json;
use std::path::PathBuf;

pub fn cmd_ps(json_output: bool) -> Result<()> {
    let mut run_dirs: Vec<PathBuf> = Vec::new();
    for pattern in ["runs/*/MANIFEST.json", "*/MANIFEST.json"] {
        for path in glob::glob(pattern)?.filter_map(|p| p.ok()) {
            if let Some(dir) = path.parent() {
                let dir = dir.to_path_buf();
                if !run_dirs.contains(&dir) {
                    run_dirs.push(dir);
                }
            }
        }
    }
    run_dirs.sort();

    let mut rows = Vec::new();
    for dir in run_dirs {
        let Ok(m) = manifest::load(&dir) else {
            continue;
        };
        let registry = ModelRegistry::load_for_run(&dir);
        let summary = Summary::derive(&m, &registry);
        let liveness = classify(&RunDir::new(&dir), &m);
        rows.push((dir, summary, liveness));
    }

    if json_output {
        let out: Vec<serde_json::Value> = rows
            .iter()
            .map(|(dir, summary, liveness)| {
                json!({
                    "run_dir": dir.display().to_string(),
                    "summary": summary,
                    "liveness": liveness_str(*liveness),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("no runs found");
        return Ok(());
    }
    println!(
        "{:<32} {:<10} {:>8} {:>7}/{:<7} {:>10}  {}",
        "RUN", "STATUS", "PROG", "VALID", "FAILED", "COST", "LIVENESS"
    );
    for (dir, summary, liveness) in rows {
        let status = match liveness {
            Liveness::Zombie => style(format!("{} (zombie)", summary.status)).red().to_string(),
            Liveness::Detached => style(format!("{} (detached)", summary.status))
                .yellow()
                .to_string(),
            _ => summary.status.to_string(),
        };
        println!(
            "{:<32} {:<10} {:>7.1}% {:>7}/{:<7} {:>9.4}  {}",
            dir.display(),
            status,
            summary.progress_pct,
            summary.valid_units,
            summary.failed_units,
            summary.cost_usd,
            liveness_str(liveness),
        );
    }
    Ok(())
}

fn liveness_str(liveness: Liveness) -> &'static str {
    match liveness {
        Liveness::Alive => "alive",
        Liveness::Zombie => "zombie",
        Liveness::Detached => "detached",
        Liveness::AtRest => "at_rest",
    }
}
