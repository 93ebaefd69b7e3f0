//! `--status`: machine-readable status for one run.

use crate::manifest::{self, Summary};
use crate::orchestrator::lifecycle::{Liveness, classify};
use crate::registry::ModelRegistry;
use crate::rundir::RunDir;
use anyhow::Result;
use serde_json::json;
use std::path::Path;

pub fn cmd_status(run_dir: &Path) -> Result<()> {
    let manifest = manifest::load(run_dir)?;
    let run = RunDir::new(run_dir);
    let registry = ModelRegistry::load_for_run(run_dir);
    let summary = Summary::derive(&manifest, &registry);

    let liveness = match classify(&run, &manifest) {
        Liveness::Alive => "alive",
        Liveness::Zombie => "zombie",
        Liveness::Detached => "detached",
        Liveness::AtRest => "at_rest",
    };

    let chunk_states: serde_json::Map<String, serde_json::Value> = manifest
        .chunks
        .iter()
        .map(|(name, info)| (name.clone(), json!(info.state)))
        .collect();

    let output = json!({
        "run_dir": run_dir.display().to_string(),
        "summary": summary,
        "liveness": liveness,
        "pid": manifest.metadata.pid,
        "error": manifest.metadata.error,
        "chunk_states": chunk_states,
        "completed_run_steps": manifest.completed_run_steps,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
