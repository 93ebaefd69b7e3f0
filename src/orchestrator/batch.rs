//! Batch mode: the submit-poll-collect tick loop.
//!
//! Each tick polls every `_SUBMITTED` chunk, then submits eligible
//! `_PENDING` chunks up to `max_inflight_batches`, then checks for
//! completion and sleeps. Every state transition saves the manifest before
//! anything downstream relies on it.

use super::{ExitStatus, Orchestrator};
use crate::chunks::{ChunkState, FAILED};
use crate::manifest::{Manifest, RunMode};
use crate::providers::{BatchResultItem, BatchStatus, Provider};
use crate::rundir;
use crate::telemetry::LogTag;
use crate::validation::{ResponseRecord, validate_stage};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Idle heartbeat period.
const HEARTBEAT: Duration = Duration::from_secs(60);
/// Interrupt-check granularity inside the tick sleep.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

pub async fn run_batch(orch: &mut Orchestrator, single_tick: bool) -> Result<ExitStatus> {
    let mut manifest = orch.prologue(RunMode::Batch)?;
    orch.log.log(
        LogTag::Batch,
        &format!(
            "batch loop: {} chunk(s), poll interval {}s, max {} inflight",
            manifest.chunks.len(),
            orch.poll_interval().as_secs(),
            orch.config.api.max_inflight_batches
        ),
    );
    let started = Instant::now();
    let mut last_change = Instant::now();
    let mut last_heartbeat = Instant::now();

    loop {
        if orch.interrupted() {
            return orch.pause(&mut manifest, "interrupted");
        }
        if let Some(ceiling) = orch.opts.timeout {
            if started.elapsed() >= ceiling {
                return orch.pause(&mut manifest, "invocation timeout reached");
            }
        }

        let changed = match tick(orch, &mut manifest).await {
            Ok(changed) => changed,
            Err(TickError::Fatal(message)) => return orch.fail(&mut manifest, &message),
            Err(TickError::Other(e)) => return Err(e),
        };
        if changed {
            last_change = Instant::now();
        }

        if manifest.all_chunks_terminal() {
            orch.epilogue(&mut manifest)?;
            return Ok(ExitStatus::Complete);
        }
        if single_tick {
            return orch.pause(&mut manifest, "single tick complete");
        }

        if last_change.elapsed() >= HEARTBEAT && last_heartbeat.elapsed() >= HEARTBEAT {
            heartbeat(orch, &manifest, last_change.elapsed());
            last_heartbeat = Instant::now();
        }

        // Sleep in slices so an interrupt is observed within ~250ms rather
        // than a full poll interval.
        let interval = orch.poll_interval();
        let sleep_started = Instant::now();
        while sleep_started.elapsed() < interval {
            if orch.interrupted() {
                return orch.pause(&mut manifest, "interrupted");
            }
            tokio::time::sleep(SLEEP_SLICE).await;
        }
    }
}

enum TickError {
    /// Auth/billing — abort the run, no retries at any layer.
    Fatal(String),
    Other(anyhow::Error),
}

impl From<anyhow::Error> for TickError {
    fn from(e: anyhow::Error) -> Self {
        TickError::Other(e)
    }
}

/// One tick: poll phase, then submit phase. Returns whether any chunk
/// changed state.
async fn tick(orch: &mut Orchestrator, manifest: &mut Manifest) -> Result<bool, TickError> {
    orch.log.log(LogTag::Tick, "tick");
    let mut changed = false;
    changed |= poll_phase(orch, manifest).await?;
    if orch.interrupted() {
        return Ok(changed);
    }
    changed |= submit_phase(orch, manifest).await?;
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Poll phase
// ---------------------------------------------------------------------------

async fn poll_phase(orch: &mut Orchestrator, manifest: &mut Manifest) -> Result<bool, TickError> {
    let submitted = orch.chunks_in_state(manifest, |s| matches!(s, ChunkState::Submitted { .. }));
    if submitted.is_empty() {
        return Ok(false);
    }

    // Status queries run concurrently, bounded by the inflight limit; the
    // resulting transitions apply sequentially below.
    let mut queries = Vec::new();
    for chunk in &submitted {
        let stage_name = ChunkState::parse(&manifest.chunks[chunk].state)
            .stage()
            .with_context(|| format!("{chunk} is SUBMITTED without a stage"))?
            .to_string();
        let stage = orch
            .config
            .stage(&stage_name)
            .with_context(|| format!("Unknown stage '{stage_name}' in chunk state"))?
            .clone();
        let provider = orch.provider_for_stage(&stage)?;
        let batch_id = manifest.chunks[chunk]
            .batch_id
            .clone()
            .with_context(|| format!("{chunk} is SUBMITTED without a batch_id"))?;
        queries.push((chunk.clone(), stage_name, provider, batch_id));
    }

    let max_inflight = orch.config.api.max_inflight_batches.max(1);
    let polled: Vec<_> = futures::stream::iter(queries.into_iter().map(
        |(chunk, stage_name, provider, batch_id)| async move {
            let started = Instant::now();
            let status = provider.get_batch_status(&batch_id).await;
            (chunk, stage_name, provider, batch_id, started.elapsed(), status)
        },
    ))
    .buffer_unordered(max_inflight)
    .collect()
    .await;

    let mut changed = false;
    for (chunk, stage_name, provider, batch_id, elapsed, status) in polled {
        let _ = orch.trace.record(
            provider.name(),
            &chunk,
            &batch_id,
            elapsed,
            match &status {
                Ok(info) => match info.status {
                    BatchStatus::Completed => "completed",
                    BatchStatus::Failed => "failed",
                    BatchStatus::Cancelled => "cancelled",
                    BatchStatus::Running => "running",
                    BatchStatus::Pending => "pending",
                },
                Err(_) => "error",
            },
        );

        match status {
            Ok(info) => {
                orch.log.log(
                    LogTag::Poll,
                    &format!("{chunk}/{stage_name}: {} ({})", info.provider_status, batch_id),
                );
                if let Some(entry) = manifest.chunks.get_mut(&chunk) {
                    entry.provider_status = Some(info.provider_status.clone());
                }
                match info.status {
                    BatchStatus::Completed => {
                        collect_chunk(orch, manifest, &chunk, &stage_name, provider).await?;
                        changed = true;
                    }
                    BatchStatus::Failed | BatchStatus::Cancelled => {
                        transient_batch_failure(
                            orch,
                            manifest,
                            &chunk,
                            &stage_name,
                            provider,
                            info.error.as_deref().unwrap_or("batch ended unsuccessfully"),
                        )
                        .await?;
                        changed = true;
                    }
                    BatchStatus::Pending | BatchStatus::Running => {
                        orch.store.save(manifest).map_err(anyhow::Error::from)?;
                    }
                }
            }
            Err(e) if e.is_fatal() => return Err(TickError::Fatal(e.to_string())),
            Err(e) => {
                // Transient poll failure: leave the chunk SUBMITTED; the
                // provider may well answer on the next tick.
                orch.log
                    .error(&format!("{chunk}/{stage_name}: poll failed: {e}"));
            }
        }
        if orch.interrupted() {
            break;
        }
    }
    Ok(changed)
}

async fn collect_chunk(
    orch: &mut Orchestrator,
    manifest: &mut Manifest,
    chunk: &str,
    stage_name: &str,
    provider: Arc<dyn Provider>,
) -> Result<(), TickError> {
    let batch_id = manifest.chunks[chunk].batch_id.clone().unwrap_or_default();
    let started = Instant::now();
    let (items, meta) = match provider.download_batch_results(&batch_id).await {
        Ok(results) => results,
        Err(e) if e.is_fatal() => return Err(TickError::Fatal(e.to_string())),
        Err(e) => {
            orch.log
                .error(&format!("{chunk}/{stage_name}: download failed: {e}"));
            return Ok(());
        }
    };
    let _ = orch
        .trace
        .record(provider.name(), chunk, &batch_id, started.elapsed(), "collected");
    orch.log.log(
        LogTag::Collect,
        &format!("{chunk}/{stage_name}: {} result(s)", items.len()),
    );

    let stage_index = orch
        .stage_index(stage_name)
        .with_context(|| format!("Unknown stage '{stage_name}'"))?;
    let inputs = orch.stage_inputs(chunk, stage_index)?;

    // Persist the raw payloads before validation: they are the ground
    // truth for --revalidate.
    let raw_rows: Vec<serde_json::Value> = items
        .iter()
        .map(|item| {
            serde_json::json!({
                "unit_id": item.unit_id,
                "content": item.content,
                "error": item.error,
            })
        })
        .collect();
    rundir::write_jsonl(&orch.run.results_file(chunk, stage_name), &raw_rows)?;

    let responses = reconcile(inputs, items);
    let retry_count = manifest.chunks[chunk].retry_count;
    let validation = validate_stage(
        responses,
        orch.schema_for(stage_name),
        orch.rules_for(stage_name),
        orch.validation_budget(),
        retry_count,
    )
    .await?;

    orch.finish_stage(
        manifest,
        chunk,
        stage_name,
        &validation,
        meta.input_tokens,
        meta.output_tokens,
    )?;
    Ok(())
}

/// Match batch results back to stage inputs by unit id. Ordering across the
/// provider round-trip is not preserved; `unit_id` is the join key. Inputs
/// with no result become explicit no-response records.
fn reconcile(
    inputs: Vec<crate::units::Unit>,
    items: Vec<BatchResultItem>,
) -> Vec<ResponseRecord> {
    let mut by_id: std::collections::HashMap<String, BatchResultItem> = items
        .into_iter()
        .map(|item| (item.unit_id.clone(), item))
        .collect();

    inputs
        .into_iter()
        .map(|input| {
            let unit_id = input
                .get("unit_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            match by_id.remove(&unit_id) {
                Some(item) => ResponseRecord {
                    unit_id,
                    stage_input: input,
                    content: item.content,
                    error: item.error,
                },
                None => ResponseRecord {
                    unit_id,
                    stage_input: input,
                    content: None,
                    error: Some("no result for unit in batch output".to_string()),
                },
            }
        })
        .collect()
}

async fn transient_batch_failure(
    orch: &mut Orchestrator,
    manifest: &mut Manifest,
    chunk: &str,
    stage_name: &str,
    provider: Arc<dyn Provider>,
    reason: &str,
) -> Result<(), TickError> {
    let info = manifest
        .chunks
        .get_mut(chunk)
        .with_context(|| format!("Unknown chunk '{chunk}'"))?;
    info.retry_count += 1;
    let attempts = info.retry_count;

    // The provider-side batch is terminal, but cancel anyway: a batch_id is
    // never discarded while the remote side could still be doing work.
    if let Some(batch_id) = info.batch_id.clone() {
        let _ = provider.cancel_batch(&batch_id).await;
    }

    let info = manifest
        .chunks
        .get_mut(chunk)
        .with_context(|| format!("Unknown chunk '{chunk}'"))?;
    if attempts > orch.max_attempts() {
        info.state = FAILED.to_string();
        info.batch_id = None;
        orch.log.error(&format!(
            "{chunk}/{stage_name}: {reason}; attempts exhausted ({attempts}), chunk FAILED"
        ));
    } else {
        info.state = ChunkState::pending(stage_name);
        info.batch_id = None;
        info.submitted_at = None;
        orch.log.log(
            LogTag::Retry,
            &format!("{chunk}/{stage_name}: {reason}; retrying (attempt {attempts})"),
        );
    }
    orch.store.save(manifest).map_err(anyhow::Error::from)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Submit phase
// ---------------------------------------------------------------------------

async fn submit_phase(orch: &mut Orchestrator, manifest: &mut Manifest) -> Result<bool, TickError> {
    let mut changed = false;

    // Expression stages evaluate locally first; a chunk may pass through
    // several consecutive expression stages in one tick.
    let stage_count = orch.config.stage_names().len();
    for _ in 0..stage_count {
        let mut advanced_any = false;
        for chunk in orch.chunks_in_state(manifest, |s| matches!(s, ChunkState::Pending { .. })) {
            if orch.interrupted() {
                return Ok(changed);
            }
            let Some(stage_name) = ChunkState::parse(&manifest.chunks[&chunk].state)
                .stage()
                .map(String::from)
            else {
                continue;
            };
            let stage = orch
                .config
                .stage(&stage_name)
                .with_context(|| format!("Unknown stage '{stage_name}'"))?
                .clone();
            if stage.is_expression() {
                let stage_index = orch
                    .stage_index(&stage_name)
                    .with_context(|| format!("Stage '{stage_name}' not in pipeline"))?;
                orch.run_expression_chunk(manifest, &chunk, &stage, stage_index)?;
                advanced_any = true;
                changed = true;
            }
        }
        if !advanced_any {
            break;
        }
    }

    // LLM submissions, ascending chunk order, throttled by inflight count.
    let mut inflight = orch
        .chunks_in_state(manifest, |s| matches!(s, ChunkState::Submitted { .. }))
        .len();
    let max_inflight = orch.config.api.max_inflight_batches.max(1);
    let mut throttled = 0usize;

    for chunk in orch.chunks_in_state(manifest, |s| matches!(s, ChunkState::Pending { .. })) {
        if orch.interrupted() {
            return Ok(changed);
        }
        let Some(stage_name) = ChunkState::parse(&manifest.chunks[&chunk].state)
            .stage()
            .map(String::from)
        else {
            continue;
        };
        let stage = orch
            .config
            .stage(&stage_name)
            .with_context(|| format!("Unknown stage '{stage_name}'"))?
            .clone();
        if !stage.is_llm() {
            continue;
        }
        if inflight >= max_inflight {
            throttled += 1;
            continue;
        }
        match submit_chunk(orch, manifest, &chunk, &stage_name).await {
            Ok(()) => {
                inflight += 1;
                changed = true;
            }
            Err(TickError::Fatal(m)) => return Err(TickError::Fatal(m)),
            Err(TickError::Other(e)) => {
                submit_failure(orch, manifest, &chunk, &stage_name, &e)?;
                changed = true;
            }
        }
    }

    if throttled > 0 {
        // One summary line per tick, not one per skipped chunk.
        orch.log.log(
            LogTag::Throttle,
            &format!("{throttled} chunk(s) waiting; {inflight}/{max_inflight} batches in flight"),
        );
    }
    Ok(changed)
}

async fn submit_chunk(
    orch: &mut Orchestrator,
    manifest: &mut Manifest,
    chunk: &str,
    stage_name: &str,
) -> Result<(), TickError> {
    let stage = orch
        .config
        .stage(stage_name)
        .with_context(|| format!("Unknown stage '{stage_name}'"))?
        .clone();
    let provider = orch.provider_for_stage(&stage)?;
    let stage_index = orch
        .stage_index(stage_name)
        .with_context(|| format!("Stage '{stage_name}' not in pipeline"))?;
    let inputs = orch.stage_inputs(chunk, stage_index)?;
    let schema = orch.schema_for(stage_name).map(|s| s.schema().clone());

    let mut prompt_rows = Vec::with_capacity(inputs.len());
    let mut request_lines = Vec::with_capacity(inputs.len());
    for unit in &inputs {
        let unit_id = unit
            .get("unit_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let prompt = orch.renderer.render(stage_name, unit)?;
        prompt_rows.push(serde_json::json!({"unit_id": unit_id, "prompt": prompt}));
        request_lines.push(provider.format_batch_request(&unit_id, &prompt, schema.as_ref()));
    }
    rundir::write_jsonl(&orch.run.prompts_file(chunk, stage_name), &prompt_rows)?;

    let input_path = orch
        .run
        .chunk_dir(chunk)
        .join(format!("{stage_name}_batch_input.jsonl"));
    rundir::write_jsonl(&input_path, &request_lines)?;

    let started = Instant::now();
    let result = async {
        let file_id = provider.upload_batch_file(&input_path).await?;
        provider.create_batch(&file_id).await
    }
    .await;
    let batch_id = match result {
        Ok(id) => id,
        Err(e) if e.is_fatal() => return Err(TickError::Fatal(e.to_string())),
        Err(e) => return Err(TickError::Other(e.into())),
    };
    let _ = orch
        .trace
        .record(provider.name(), chunk, &batch_id, started.elapsed(), "submitted");

    let info = manifest
        .chunks
        .get_mut(chunk)
        .with_context(|| format!("Unknown chunk '{chunk}'"))?;
    info.batch_id = Some(batch_id.clone());
    info.submitted_at = Some(chrono::Utc::now());
    info.state = ChunkState::submitted(stage_name);
    orch.store.save(manifest).map_err(anyhow::Error::from)?;
    orch.log.log(
        LogTag::Submit,
        &format!("{chunk}/{stage_name}: {} unit(s) -> {batch_id}", inputs.len()),
    );
    Ok(())
}

fn submit_failure(
    orch: &mut Orchestrator,
    manifest: &mut Manifest,
    chunk: &str,
    stage_name: &str,
    error: &anyhow::Error,
) -> Result<()> {
    let info = manifest
        .chunks
        .get_mut(chunk)
        .with_context(|| format!("Unknown chunk '{chunk}'"))?;
    info.retry_count += 1;
    let attempts = info.retry_count;
    if attempts > orch.max_attempts() {
        info.state = FAILED.to_string();
        orch.log.error(&format!(
            "{chunk}/{stage_name}: submit failed ({error:#}); attempts exhausted, chunk FAILED"
        ));
    } else {
        orch.log.log(
            LogTag::Retry,
            &format!("{chunk}/{stage_name}: submit failed ({error:#}); will retry"),
        );
    }
    orch.store.save(manifest)?;
    Ok(())
}

fn heartbeat(orch: &Orchestrator, manifest: &Manifest, idle: Duration) {
    let mut breakdown: std::collections::BTreeMap<&str, usize> = Default::default();
    for info in manifest.chunks.values() {
        *breakdown.entry(info.state.as_str()).or_default() += 1;
    }
    let states: Vec<String> = breakdown
        .iter()
        .map(|(state, count)| format!("{state}={count}"))
        .collect();
    let cost = manifest.estimated_cost(orch.store.registry());
    orch.log.info(&format!(
        "idle {}; states: {}; cost ${cost:.4}",
        crate::util::human_duration(idle.as_secs()),
        states.join(" ")
    ));
}
