//! Realtime mode: synchronous per-unit provider calls.
//!
//! The outer convergence loop is bounded by `pipeline_length + 1` because a
//! stage advance during a pass can re-enable earlier stages on
//! retry-recovered chunks. Within a stage a chunk is strictly sequential:
//! render, call, validate, append — with the cost cap checked after every
//! unit, not every chunk.

use super::{ExitStatus, Orchestrator};
use crate::chunks::ChunkState;
use crate::manifest::{Manifest, RunMode};
use crate::rundir;
use crate::telemetry::LogTag;
use crate::units::Unit;
use crate::validation::{
    FailureRecord, ResponseRecord, StageValidation, validate_stage,
};
use anyhow::{Context, Result};
use std::time::Instant;

/// Validated-output fraction above which a clean stage is skipped on
/// resume. Bypassed whenever a `.bak` retry signal is present.
const RESUME_SKIP_THRESHOLD: f64 = 0.90;

/// Early-exit reasons bubbled out of chunk processing.
enum Interruption {
    Interrupted,
    CostCap(f64),
    Fatal(String),
}

pub async fn run_realtime(orch: &mut Orchestrator) -> Result<ExitStatus> {
    let mut manifest = orch.prologue(RunMode::Realtime)?;
    orch.log.log(
        LogTag::Realtime,
        &format!(
            "realtime loop: {} chunk(s), cost cap {}",
            manifest.chunks.len(),
            orch.cost_cap()
                .map(|c| format!("${c:.2}"))
                .unwrap_or_else(|| "none".to_string())
        ),
    );
    let stage_names = orch.config.stage_names();
    let started = Instant::now();

    // pipeline_length + 1 passes: retry-recovered chunks can reappear at
    // earlier stages mid-pass.
    for _pass in 0..=stage_names.len() {
        let mut progressed = false;

        for (stage_index, stage_name) in stage_names.iter().enumerate() {
            let pending = orch.chunks_in_state(&manifest, |s| {
                matches!(s, ChunkState::Pending { stage } if stage == stage_name)
            });
            for chunk in pending {
                if orch.interrupted() {
                    return orch.pause(&mut manifest, "interrupted");
                }
                if let Some(ceiling) = orch.opts.timeout {
                    if started.elapsed() >= ceiling {
                        return orch.pause(&mut manifest, "invocation timeout reached");
                    }
                }
                let stage = orch
                    .config
                    .stage(stage_name)
                    .with_context(|| format!("Unknown stage '{stage_name}'"))?
                    .clone();

                if stage.is_expression() {
                    orch.run_expression_chunk(&mut manifest, &chunk, &stage, stage_index)?;
                    progressed = true;
                    continue;
                }

                match llm_chunk(orch, &mut manifest, &chunk, stage_name, stage_index).await? {
                    None => progressed = true,
                    Some(Interruption::Interrupted) => {
                        return orch.pause(&mut manifest, "interrupted");
                    }
                    Some(Interruption::CostCap(cost)) => {
                        return orch.pause(
                            &mut manifest,
                            &format!("cost cap reached (${cost:.4})"),
                        );
                    }
                    Some(Interruption::Fatal(message)) => {
                        return orch.fail(&mut manifest, &message);
                    }
                }
            }
        }

        if manifest.all_chunks_terminal() {
            break;
        }
        if !progressed {
            break;
        }
    }

    if manifest.all_chunks_terminal() {
        orch.epilogue(&mut manifest)?;
        Ok(ExitStatus::Complete)
    } else {
        orch.pause(&mut manifest, "chunks remain after convergence passes")
    }
}

/// Drive one LLM stage on one chunk to completion.
async fn llm_chunk(
    orch: &mut Orchestrator,
    manifest: &mut Manifest,
    chunk: &str,
    stage_name: &str,
    stage_index: usize,
) -> Result<Option<Interruption>> {
    let stage = orch
        .config
        .stage(stage_name)
        .with_context(|| format!("Unknown stage '{stage_name}'"))?
        .clone();
    let inputs = orch.stage_inputs(chunk, stage_index)?;
    let expected = inputs.len();

    let mut validated: Vec<Unit> =
        rundir::read_jsonl_or_empty(&orch.run.validated_file(chunk, stage_name))?;
    let mut failures: Vec<FailureRecord> =
        rundir::read_jsonl_or_empty(&orch.run.failures_file(chunk, stage_name))?;
    let bak_present = orch.run.failures_backup_file(chunk, stage_name).exists();

    // Resume optimisation: a stage that already materialised >=90% of its
    // units cleanly is skipped. A .bak file is an explicit retry signal and
    // disables the short-circuit.
    if !bak_present
        && expected > 0
        && failures.is_empty()
        && validated.len() as f64 >= RESUME_SKIP_THRESHOLD * expected as f64
    {
        orch.log.log(
            LogTag::Skip,
            &format!(
                "{chunk}/{stage_name}: {}/{expected} already validated, skipping",
                validated.len()
            ),
        );
        let validation = StageValidation {
            validated,
            failures,
            ..Default::default()
        };
        orch.finish_stage(manifest, chunk, stage_name, &validation, 0, 0)?;
        return Ok(None);
    }

    let provider = orch.provider_for_stage(&stage)?;
    let schema = orch.schema_for(stage_name).map(|s| s.schema().clone());
    let retry_config = orch.config.api.retry.clone();
    let auto_retry = orch.config.api.realtime.auto_retry;
    let max_attempts = orch.max_attempts();

    // Only units not already validated get calls (resume). Units with a
    // preserved pipeline_internal failure are not retryable and keep their
    // existing record.
    let mut done: std::collections::BTreeSet<String> = validated
        .iter()
        .filter_map(|r| r.get("unit_id").and_then(|v| v.as_str()).map(String::from))
        .collect();
    for failure in &failures {
        if !failure.failure_stage.is_retryable() {
            done.insert(failure.unit_id.clone());
        }
    }
    let mut todo: Vec<Unit> = inputs
        .into_iter()
        .filter(|u| {
            u.get("unit_id")
                .and_then(|v| v.as_str())
                .map(|id| !done.contains(id))
                .unwrap_or(true)
        })
        .collect();
    // Units archived for retry get fresh calls; drop their stale failure
    // records so the fresh outcome is authoritative.
    let todo_ids: std::collections::BTreeSet<String> = todo
        .iter()
        .filter_map(|u| u.get("unit_id").and_then(|v| v.as_str()).map(String::from))
        .collect();
    failures.retain(|f| !todo_ids.contains(&f.unit_id));

    let mut prompt_rows = Vec::new();
    let retry_count = manifest.chunks[chunk].retry_count;
    let mut attempt: u32 = 0;

    loop {
        let mut still_failing: Vec<(Unit, FailureRecord)> = Vec::new();

        for unit in todo.drain(..) {
            if orch.interrupted() {
                // Persist what we have; the chunk resumes mid-stage.
                persist_partial(orch, chunk, stage_name, &validated, &failures)?;
                return Ok(Some(Interruption::Interrupted));
            }
            let unit_id = unit
                .get("unit_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let prompt = orch.renderer.render(stage_name, &unit)?;
            prompt_rows.push(serde_json::json!({"unit_id": unit_id, "prompt": prompt}));

            let started = Instant::now();
            let call = provider.generate_realtime(&prompt, schema.as_ref()).await;
            let elapsed = started.elapsed();
            let _ = orch.trace.record(
                provider.name(),
                chunk,
                &unit_id,
                elapsed,
                if call.is_ok() { "ok" } else { "error" },
            );

            let (response, tokens) = match call {
                Ok(r) => {
                    let tokens = (r.input_tokens, r.output_tokens);
                    (
                        ResponseRecord {
                            unit_id: unit_id.clone(),
                            stage_input: unit.clone(),
                            content: Some(r.content),
                            error: None,
                        },
                        tokens,
                    )
                }
                Err(e) if e.is_fatal() => {
                    persist_partial(orch, chunk, stage_name, &validated, &failures)?;
                    return Ok(Some(Interruption::Fatal(e.to_string())));
                }
                Err(e) => (
                    ResponseRecord {
                        unit_id: unit_id.clone(),
                        stage_input: unit.clone(),
                        content: None,
                        error: Some(e.to_string()),
                    },
                    (0, 0),
                ),
            };

            let mut result = validate_stage(
                vec![response],
                orch.schema_for(stage_name),
                orch.rules_for(stage_name),
                orch.validation_budget(),
                retry_count,
            )
            .await?;
            for (u, trace) in result.coercions.drain(..) {
                orch.log.log(
                    LogTag::Coerce,
                    &format!("{chunk}/{u}: {} ({})", trace.field, trace.action),
                );
            }
            if let Some(record) = result.validated.pop() {
                rundir::append_jsonl(
                    &orch.run.validated_file(chunk, stage_name),
                    std::slice::from_ref(&record),
                )?;
                validated.push(record);
            } else if let Some(failure) = result.failures.pop() {
                rundir::append_jsonl(
                    &orch.run.failures_file(chunk, stage_name),
                    std::slice::from_ref(&failure),
                )?;
                // Transient provider errors are retried like validation
                // failures; pipeline_internal from a genuine response is not.
                still_failing.push((unit, failure));
            }

            // Token accounting and the per-unit cost cap check.
            let info = manifest
                .chunks
                .get_mut(chunk)
                .with_context(|| format!("Unknown chunk '{chunk}'"))?;
            info.input_tokens += tokens.0;
            info.output_tokens += tokens.1;
            if retry_count > 0 {
                manifest.metadata.retry_input_tokens += tokens.0;
                manifest.metadata.retry_output_tokens += tokens.1;
            } else {
                manifest.metadata.initial_input_tokens += tokens.0;
                manifest.metadata.initial_output_tokens += tokens.1;
            }
            self_save(orch, manifest)?;
            if let Some(cap) = orch.cost_cap() {
                let cost = manifest.estimated_cost(orch.store.registry());
                if cost > cap {
                    persist_partial(orch, chunk, stage_name, &validated, &failures)?;
                    return Ok(Some(Interruption::CostCap(cost)));
                }
            }
        }

        // Auto-retry failed units within the stage, exponential backoff.
        attempt += 1;
        let retryable: Vec<(Unit, FailureRecord)> = still_failing
            .iter()
            .filter(|(_, f)| {
                f.failure_stage.is_retryable()
                    || f.errors.iter().any(|e| e.rule == "provider")
            })
            .cloned()
            .collect();
        if !auto_retry || retryable.is_empty() || attempt >= max_attempts {
            failures.extend(still_failing.into_iter().map(|(_, f)| f));
            break;
        }
        failures.extend(
            still_failing
                .iter()
                .filter(|(u, _)| {
                    !retryable.iter().any(|(ru, _)| {
                        ru.get("unit_id") == u.get("unit_id")
                    })
                })
                .map(|(_, f)| f.clone()),
        );
        let delay = retry_config.delay_for_attempt(attempt - 1);
        orch.log.log(
            LogTag::Retry,
            &format!(
                "{chunk}/{stage_name}: retrying {} unit(s) after {:.1}s (attempt {attempt})",
                retryable.len(),
                delay.as_secs_f64()
            ),
        );
        tokio::time::sleep(delay).await;
        todo = retryable.into_iter().map(|(u, _)| u).collect();
        // Stale failure records for retried units are superseded.
        let retry_ids: std::collections::BTreeSet<String> = todo
            .iter()
            .filter_map(|u| u.get("unit_id").and_then(|v| v.as_str()).map(String::from))
            .collect();
        failures.retain(|f| !retry_ids.contains(&f.unit_id));
    }

    if !prompt_rows.is_empty() {
        rundir::write_jsonl(&orch.run.prompts_file(chunk, stage_name), &prompt_rows)?;
    }
    let validation = StageValidation {
        validated,
        failures,
        ..Default::default()
    };
    orch.finish_stage(manifest, chunk, stage_name, &validation, 0, 0)?;
    Ok(None)
}

/// Write current progress without advancing state — used on early exits so
/// resume picks up mid-stage.
fn persist_partial(
    orch: &Orchestrator,
    chunk: &str,
    stage_name: &str,
    validated: &[Unit],
    failures: &[FailureRecord],
) -> Result<()> {
    rundir::write_jsonl(&orch.run.validated_file(chunk, stage_name), validated)?;
    rundir::write_jsonl(&orch.run.failures_file(chunk, stage_name), failures)?;
    Ok(())
}

fn self_save(orch: &Orchestrator, manifest: &mut Manifest) -> Result<()> {
    orch.store.save(manifest).map_err(anyhow::Error::from)
}
