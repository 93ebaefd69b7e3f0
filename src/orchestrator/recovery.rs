//! Retry recovery: the startup sweep that archives validation failures and
//! resets their chunks, plus explicit retry-chunk construction.
//!
//! The scan acts ONLY on chunks in terminal states. Touching a `_SUBMITTED`
//! chunk would orphan an in-flight provider batch; touching any other
//! non-terminal state races the main loop. The cascade is chunk-level: a
//! reset re-submits every unit in the chunk, not just the failed subset.

use super::Orchestrator;
use crate::chunks::{self, ChunkState};
use crate::manifest::{ChunkInfo, Manifest};
use crate::rundir::{self};
use crate::telemetry::LogTag;
use crate::units::Unit;
use crate::validation::FailureRecord;
use anyhow::{Context, Result};

/// Archive retryable failures and reset their chunks to the failing stage.
///
/// Runs once at the start of every batch and realtime invocation, before
/// the main loop.
pub fn retry_recovery_scan(orch: &mut Orchestrator, manifest: &mut Manifest) -> Result<()> {
    let stage_names = orch.config.stage_names();
    let chunk_names: Vec<String> = manifest.chunks.keys().cloned().collect();
    let mut touched = false;

    for chunk in chunk_names {
        let state = ChunkState::parse(&manifest.chunks[&chunk].state);
        if !state.is_terminal() {
            // Non-terminal chunks are the main loop's property. In
            // particular a _SUBMITTED chunk has a live provider batch.
            continue;
        }

        // Earliest stage with retryable failures wins; the cascade re-runs
        // everything after it anyway.
        for stage in stage_names.iter() {
            let failures_path = orch.run.failures_file(&chunk, stage);
            let failures: Vec<FailureRecord> = rundir::read_jsonl_or_empty(&failures_path)?;
            let retryable = failures
                .iter()
                .filter(|f| f.failure_stage.is_retryable())
                .count();
            if retryable == 0 {
                continue;
            }

            // 1. Rotate the failures file to .bak (atomic rename). The .bak
            //    also disables the resume short-circuit for this stage.
            let bak_path = orch.run.failures_backup_file(&chunk, stage);
            std::fs::rename(&failures_path, &bak_path).with_context(|| {
                format!("Failed to archive {}", failures_path.display())
            })?;

            // 2. Unretryable records stay behind in a fresh failures file;
            //    the archive keeps only what is actually being retried.
            let unretryable: Vec<&FailureRecord> = failures
                .iter()
                .filter(|f| !f.failure_stage.is_retryable())
                .collect();
            if !unretryable.is_empty() {
                rundir::write_jsonl(&failures_path, &unretryable)?;
                let archived: Vec<&FailureRecord> = failures
                    .iter()
                    .filter(|f| f.failure_stage.is_retryable())
                    .collect();
                rundir::write_jsonl(&bak_path, &archived)?;
            }

            // 3. Reset the chunk in place.
            let info = manifest
                .chunks
                .get_mut(&chunk)
                .with_context(|| format!("Unknown chunk '{chunk}'"))?;
            info.state = ChunkState::pending(stage);
            info.batch_id = None;
            info.submitted_at = None;
            info.provider_status = None;
            info.retry_count += 1;
            touched = true;

            orch.log.log(
                LogTag::Retry,
                &format!(
                    "{chunk}: archived {retryable} retryable failure(s) at '{stage}', reset to {} (attempt {})",
                    ChunkState::pending(stage),
                    info.retry_count
                ),
            );
            break;
        }
    }

    if touched {
        orch.store.save(manifest)?;
    }
    Ok(())
}

/// Create a retry chunk seeded at `stage_index` with the given units.
///
/// The units are the stage inputs; they are written both as `units.jsonl`
/// (so the chunk accounts for them) and as every prior stage's validated
/// file (so stage-input resolution and integrity checks see a consistent
/// history).
pub fn create_retry_chunk(
    orch: &Orchestrator,
    manifest: &mut Manifest,
    stage_index: usize,
    units: &[Unit],
) -> Result<String> {
    anyhow::ensure!(!units.is_empty(), "refusing to create an empty retry chunk");

    let mut index = 0;
    let name = loop {
        let candidate = chunks::retry_chunk_name(index);
        if !manifest.chunks.contains_key(&candidate) {
            break candidate;
        }
        index += 1;
    };

    let dir = orch.run.chunk_dir(&name);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    rundir::write_jsonl(&orch.run.units_file(&name), units)?;

    let stage_names = orch.config.stage_names();
    for prior in stage_names.iter().take(stage_index) {
        rundir::write_jsonl(&orch.run.validated_file(&name, prior), units)?;
    }

    let stage = &stage_names[stage_index];
    let mut info = ChunkInfo::new(units.len(), ChunkState::pending(stage));
    info.retry_count = 1;
    manifest.chunks.insert(name.clone(), info);
    Ok(name)
}

/// `--retry-failures`: build explicit retry chunks from the retryable
/// failures of terminal chunks, then archive those failure files.
pub fn build_retry_chunks(orch: &mut Orchestrator) -> Result<usize> {
    let mut manifest = orch.store.load()?;
    let stage_names = orch.config.stage_names();
    let chunk_names: Vec<String> = manifest.chunks.keys().cloned().collect();

    // Collect per stage across all terminal chunks.
    let mut per_stage: Vec<Vec<Unit>> = vec![Vec::new(); stage_names.len()];
    let mut archives: Vec<(String, String)> = Vec::new();
    for chunk in &chunk_names {
        if !ChunkState::parse(&manifest.chunks[chunk].state).is_terminal() {
            continue;
        }
        for (stage_index, stage) in stage_names.iter().enumerate() {
            let failures: Vec<FailureRecord> =
                rundir::read_jsonl_or_empty(&orch.run.failures_file(chunk, stage))?;
            let mut any = false;
            for failure in failures.iter().filter(|f| f.failure_stage.is_retryable()) {
                if let serde_json::Value::Object(input) = &failure.stage_input {
                    per_stage[stage_index].push(input.clone());
                    any = true;
                }
            }
            if any {
                archives.push((chunk.clone(), stage.clone()));
            }
        }
    }

    let chunk_size = orch.config.processing.chunk_size.max(1);
    let mut created = 0;
    for (stage_index, units) in per_stage.into_iter().enumerate() {
        for batch in units.chunks(chunk_size) {
            let name = create_retry_chunk(orch, &mut manifest, stage_index, batch)?;
            orch.log.log(
                LogTag::Retry,
                &format!(
                    "created {name}: {} unit(s) at '{}'",
                    batch.len(),
                    stage_names[stage_index]
                ),
            );
            created += 1;
        }
    }

    // Archive the routed failure files the same way the scan does, keeping
    // unretryable records in place.
    for (chunk, stage) in archives {
        let failures_path = orch.run.failures_file(&chunk, &stage);
        let failures: Vec<FailureRecord> = rundir::read_jsonl_or_empty(&failures_path)?;
        let bak_path = orch.run.failures_backup_file(&chunk, &stage);
        std::fs::rename(&failures_path, &bak_path)
            .with_context(|| format!("Failed to archive {}", failures_path.display()))?;
        let unretryable: Vec<&FailureRecord> = failures
            .iter()
            .filter(|f| !f.failure_stage.is_retryable())
            .collect();
        if !unretryable.is_empty() {
            rundir::write_jsonl(&failures_path, &unretryable)?;
            let archived: Vec<&FailureRecord> = failures
                .iter()
                .filter(|f| f.failure_stage.is_retryable())
                .collect();
            rundir::write_jsonl(&bak_path, &archived)?;
        }
    }

    if created > 0 {
        orch.store.save(&mut manifest)?;
    }
    Ok(created)
}
