//! The orchestrator: run lifecycle plus the batch and realtime loop bodies.
//!
//! Both operational modes share a common prologue (PID acquisition, status
//! repair, retry-recovery scan, prerequisite check) and epilogue (run-scope
//! steps, post-processing, final status). The bodies live in `batch` and
//! `realtime`.

pub mod batch;
pub mod lifecycle;
pub mod realtime;
pub mod recovery;

use crate::chunks::{ChunkState, StageOutcome, state_after_stage};
use crate::config::{PipelineConfig, PostProcessKind, RuleSet, StepConfig};
use crate::manifest::{Manifest, ManifestStore, RunMode, RunStatus};
use crate::providers::{self, Provider};
use crate::registry::ModelRegistry;
use crate::rundir::{self, RunDir};
use crate::telemetry::{LogTag, RunLog, TraceLog};
use crate::template::Renderer;
use crate::units::Unit;
use crate::validation::{SchemaValidator, StageValidation};
use anyhow::{Context, Result, bail};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// CLI-supplied runtime caps layered over the config snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub quiet: bool,
    pub max_cost_usd: Option<f64>,
    pub poll_interval: Option<u64>,
    pub max_retries: Option<u32>,
    /// Absolute wall-clock ceiling for this invocation.
    pub timeout: Option<Duration>,
}

/// How an orchestrator invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Complete,
    Paused,
    Failed,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Complete => 0,
            ExitStatus::Failed => 1,
            ExitStatus::Paused => 130,
        }
    }
}

pub struct Orchestrator {
    pub config: PipelineConfig,
    pub run: RunDir,
    pub store: ManifestStore,
    pub log: RunLog,
    pub trace: TraceLog,
    pub renderer: Renderer,
    pub interrupt: Arc<AtomicBool>,
    pub opts: RuntimeOptions,
    schemas: HashMap<String, SchemaValidator>,
    provider_cache: HashMap<String, Arc<dyn Provider>>,
}

impl Orchestrator {
    pub fn open(run_dir: PathBuf, opts: RuntimeOptions) -> Result<Self> {
        // Process environment takes precedence over the run's .env file.
        let _ = dotenvy::from_path(run_dir.join(".env"));

        let run = RunDir::new(&run_dir);
        let config = PipelineConfig::load_snapshot(&run_dir)
            .context("Run directory has no config snapshot; was it initialised?")?;
        let registry = ModelRegistry::load_for_run(&run_dir);
        let store = ManifestStore::new(&run_dir, registry);
        let log = RunLog::new(&run_dir, opts.quiet);
        let trace = TraceLog::new(&run_dir);

        let template_dir = run.config_dir().join(&config.prompts.template_dir);
        let renderer = Renderer::new(
            &template_dir,
            config.prompts.templates.clone(),
            config.prompts.global_context.clone(),
        );

        let mut schemas = HashMap::new();
        let schema_dir = run.config_dir().join(&config.schemas.schema_dir);
        for (stage, file) in &config.schemas.files {
            let validator = SchemaValidator::load(&schema_dir.join(file))
                .with_context(|| format!("Bad schema for stage '{stage}'"))?;
            schemas.insert(stage.clone(), validator);
        }

        Ok(Self {
            config,
            run,
            store,
            log,
            trace,
            renderer,
            interrupt: Arc::new(AtomicBool::new(false)),
            opts,
            schemas,
            provider_cache: HashMap::new(),
        })
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.opts
                .poll_interval
                .unwrap_or(self.config.api.poll_interval_seconds),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.opts
            .max_retries
            .unwrap_or(self.config.api.retry.max_attempts)
    }

    pub fn cost_cap(&self) -> Option<f64> {
        self.opts
            .max_cost_usd
            .or(self.config.api.realtime.cost_cap_usd)
    }

    pub fn validation_budget(&self) -> Duration {
        Duration::from_secs(self.config.api.subprocess_timeout_seconds)
    }

    pub fn schema_for(&self, stage: &str) -> Option<&SchemaValidator> {
        self.schemas.get(stage)
    }

    pub fn rules_for(&self, stage: &str) -> Option<&RuleSet> {
        self.config.validation.get(stage).filter(|r| !r.is_empty())
    }

    /// Provider client for a stage, constructed once per provider name.
    pub fn provider_for_stage(&mut self, stage: &StepConfig) -> Result<Arc<dyn Provider>> {
        let name = self
            .config
            .provider_for(stage)
            .with_context(|| format!("Stage '{}' has no provider configured", stage.name))?;
        if let Some(cached) = self.provider_cache.get(&name) {
            return Ok(Arc::clone(cached));
        }
        let model = self.config.model_for(stage);
        let provider = providers::create_provider(self.store.registry(), &name, model.as_deref())?;
        let provider: Arc<dyn Provider> = Arc::from(provider);
        self.provider_cache
            .insert(name.clone(), Arc::clone(&provider));
        Ok(provider)
    }

    // -----------------------------------------------------------------------
    // Common prologue
    // -----------------------------------------------------------------------

    /// Acquire the PID file, repair statuses, run the retry-recovery scan,
    /// and verify provider prerequisites.
    pub fn prologue(&mut self, mode: RunMode) -> Result<Manifest> {
        let pid = rundir::write_pid(&self.run)?;
        let mut manifest = self.store.load()?;

        // Resume a prematurely terminal-marked run.
        if manifest.status.is_terminal() && manifest.has_nonterminal_chunks() {
            self.log.info(&format!(
                "run marked {} but chunks remain; resuming",
                manifest.status
            ));
        }
        manifest.status = RunStatus::Running;
        manifest.metadata.paused_at = None;
        manifest.metadata.pid = Some(pid);
        manifest.metadata.mode = mode;
        if manifest.metadata.started_at.is_none() {
            manifest.metadata.started_at = Some(chrono::Utc::now());
        }
        self.store.save(&mut manifest)?;

        recovery::retry_recovery_scan(self, &mut manifest)?;

        // Prerequisites: every provider referenced by any LLM stage must
        // have its credential present before a single chunk is touched.
        let missing: Vec<String> = self
            .config
            .providers_in_use()
            .into_iter()
            .filter(|p| !providers::has_credentials(self.store.registry(), p))
            .collect();
        if !missing.is_empty() {
            let message = format!(
                "missing credentials for provider(s): {}",
                missing.join(", ")
            );
            self.log.error(&message);
            manifest.status = RunStatus::Failed;
            manifest.metadata.error = Some(message.clone());
            self.store.save(&mut manifest)?;
            bail!(message);
        }

        Ok(manifest)
    }

    // -----------------------------------------------------------------------
    // Common epilogue
    // -----------------------------------------------------------------------

    /// Run-scope stages and post-processing, then the final status save.
    pub fn epilogue(&mut self, manifest: &mut Manifest) -> Result<()> {
        let run_steps: Vec<StepConfig> =
            self.config.run_steps().into_iter().cloned().collect();
        for step in run_steps {
            if manifest.completed_run_steps.contains(&step.name) {
                self.log.log(
                    LogTag::Skip,
                    &format!("run step '{}' already done", step.name),
                );
                continue;
            }
            self.log
                .log(LogTag::Step, &format!("running '{}'", step.name));
            self.execute_run_step(&step)?;
            manifest.completed_run_steps.push(step.name.clone());
            self.store.save(manifest)?;
        }

        for post in self.config.post_process.clone() {
            self.log
                .log(LogTag::Step, &format!("post-process '{}'", post.name));
            if let Err(e) = self.execute_post_process(&post) {
                // Post-processing is best-effort; the pipeline data is done.
                self.log
                    .error(&format!("post-process '{}' failed: {e:#}", post.name));
            }
        }

        manifest.status = RunStatus::Complete;
        manifest.metadata.completed_at = Some(chrono::Utc::now());
        self.store.save(manifest)?;
        self.log.info("run complete");
        Ok(())
    }

    fn execute_run_step(&mut self, step: &StepConfig) -> Result<()> {
        if let Some(script) = &step.script {
            return self.run_script(script, &[], None);
        }
        // A run-scope expression step evaluates once; its seed keys off the
        // synthetic unit id so reruns of the same step reproduce.
        if !step.expressions.is_empty() {
            let mut unit = serde_json::Map::new();
            unit.insert(
                "unit_id".to_string(),
                serde_json::Value::String(format!("__run__{}", step.name)),
            );
            let result = crate::expr::run_expression_stage(step, &unit)
                .map_err(|e| anyhow::anyhow!("run step '{}' failed: {e}", step.name))?;
            let out = self.run.root().join(format!("{}_result.json", step.name));
            crate::manifest::write_atomic(
                &out,
                serde_json::to_string_pretty(&result.record)?.as_bytes(),
            )?;
        }
        Ok(())
    }

    fn execute_post_process(&mut self, post: &crate::config::PostProcessStep) -> Result<()> {
        match post.kind {
            Some(PostProcessKind::Gzip) => self.gzip_artifacts(&post.files, post.keep_originals),
            _ => {
                let script = post
                    .script
                    .as_deref()
                    .with_context(|| format!("post-process '{}' has no script", post.name))?;
                self.run_script(script, &post.args, post.output.as_deref())
            }
        }
    }

    /// Run a script in the run directory, optionally capturing stdout to a
    /// file.
    fn run_script(&self, script: &str, args: &[String], output: Option<&str>) -> Result<()> {
        let mut command = std::process::Command::new(script);
        command.args(args).current_dir(self.run.root());
        let status = match output {
            Some(out_path) => {
                let file = std::fs::File::create(self.run.root().join(out_path))
                    .with_context(|| format!("Failed to create output file '{out_path}'"))?;
                command.stdout(file).status()
            }
            None => command.status(),
        }
        .with_context(|| format!("Failed to spawn '{script}'"))?;
        if !status.success() {
            bail!("'{script}' exited with {status}");
        }
        Ok(())
    }

    fn gzip_artifacts(&self, patterns: &[String], keep_originals: bool) -> Result<()> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        for pattern in patterns {
            let full = self.run.root().join(pattern);
            let matches = glob::glob(&full.to_string_lossy())
                .with_context(|| format!("Bad glob '{pattern}'"))?;
            for path in matches.filter_map(|p| p.ok()) {
                if path.extension().and_then(|e| e.to_str()) == Some("gz") {
                    continue;
                }
                let bytes = std::fs::read(&path)?;
                let gz_path = PathBuf::from(format!("{}.gz", path.display()));
                let file = std::fs::File::create(&gz_path)?;
                let mut encoder = GzEncoder::new(file, Compression::default());
                encoder.write_all(&bytes)?;
                encoder.finish()?;
                if !keep_originals {
                    std::fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shared stage plumbing
    // -----------------------------------------------------------------------

    /// Input units for a chunk at a stage: `units.jsonl` for the first
    /// stage, the previous stage's validated records otherwise.
    pub fn stage_inputs(&self, chunk: &str, stage_index: usize) -> Result<Vec<Unit>> {
        let path = if stage_index == 0 {
            self.run.units_file(chunk)
        } else {
            let names = self.config.stage_names();
            self.run.validated_file(chunk, &names[stage_index - 1])
        };
        rundir::read_jsonl(&path)
    }

    /// Unit ids already present in a stage's validated output (for resume).
    pub fn validated_ids(&self, chunk: &str, stage: &str) -> Result<BTreeSet<String>> {
        let records: Vec<Unit> =
            rundir::read_jsonl_or_empty(&self.run.validated_file(chunk, stage))?;
        Ok(records
            .iter()
            .filter_map(|r| r.get("unit_id").and_then(|v| v.as_str()).map(String::from))
            .collect())
    }

    /// Persist a stage's validation output, advance the chunk state, and
    /// save the manifest — in that order, so a crash between steps leaves
    /// re-runnable state rather than lost state.
    pub fn finish_stage(
        &mut self,
        manifest: &mut Manifest,
        chunk: &str,
        stage: &str,
        validation: &StageValidation,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<String> {
        for (unit, trace) in &validation.coercions {
            self.log.log(
                LogTag::Coerce,
                &format!("{chunk}/{unit}: {} ({})", trace.field, trace.action),
            );
        }
        for (unit, warning) in &validation.warnings {
            self.log.log(
                LogTag::Validate,
                &format!("{chunk}/{unit} warning: {}", warning.message),
            );
        }

        rundir::write_jsonl(&self.run.validated_file(chunk, stage), &validation.validated)?;
        rundir::write_jsonl(&self.run.failures_file(chunk, stage), &validation.failures)?;

        // A completed fresh pass clears the retry-recovery signal.
        let bak = self.run.failures_backup_file(chunk, stage);
        if bak.exists() {
            std::fs::remove_file(&bak)
                .with_context(|| format!("Failed to remove {}", bak.display()))?;
        }

        let outcome = StageOutcome {
            valid: validation.validated.len(),
            failed: validation.failures.len(),
        };
        let next = state_after_stage(&self.config.stage_names(), stage, outcome);

        let info = manifest
            .chunks
            .get_mut(chunk)
            .with_context(|| format!("Unknown chunk '{chunk}'"))?;
        info.valid_count = outcome.valid;
        info.failed_count = outcome.failed;
        info.state = next.clone();
        info.batch_id = None;
        info.provider_status = None;
        info.input_tokens += input_tokens;
        info.output_tokens += output_tokens;
        let retrying = info.retry_count > 0;
        if retrying {
            manifest.metadata.retry_input_tokens += input_tokens;
            manifest.metadata.retry_output_tokens += output_tokens;
        } else {
            manifest.metadata.initial_input_tokens += input_tokens;
            manifest.metadata.initial_output_tokens += output_tokens;
        }
        self.store.save(manifest)?;

        self.log.log(
            LogTag::Validate,
            &format!(
                "{chunk}/{stage}: {} valid, {} failed -> {next}",
                outcome.valid, outcome.failed
            ),
        );
        if input_tokens + output_tokens > 0 {
            self.log.log(
                LogTag::Tokens,
                &format!("{chunk}/{stage}: in={input_tokens} out={output_tokens}"),
            );
        }
        Ok(next)
    }

    /// Evaluate an expression stage over a chunk and advance it.
    /// `PENDING -> next PENDING` directly; no `SUBMITTED` state, zero cost.
    pub fn run_expression_chunk(
        &mut self,
        manifest: &mut Manifest,
        chunk: &str,
        stage: &StepConfig,
        stage_index: usize,
    ) -> Result<()> {
        let inputs = self.stage_inputs(chunk, stage_index)?;
        let mut validation = StageValidation::default();
        for unit in &inputs {
            match crate::expr::run_expression_stage(stage, unit) {
                Ok(result) => {
                    if result.timed_out {
                        self.log.log(
                            LogTag::Expression,
                            &format!(
                                "{chunk}/{}: unit {} hit max_iterations ({})",
                                stage.name,
                                unit.get("unit_id").and_then(|v| v.as_str()).unwrap_or("?"),
                                result.iterations
                            ),
                        );
                    }
                    validation.validated.push(result.record);
                }
                Err(e) => {
                    let unit_id = unit
                        .get("unit_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?")
                        .to_string();
                    validation.failures.push(crate::validation::FailureRecord {
                        unit_id,
                        failure_stage: crate::validation::FailureStage::PipelineInternal,
                        stage_input: serde_json::Value::Object(unit.clone()),
                        raw_response: String::new(),
                        errors: vec![crate::validation::FailureError {
                            path: String::new(),
                            rule: "expression".to_string(),
                            message: e.to_string(),
                        }],
                        retry_count: 0,
                    });
                }
            }
        }
        self.log.log(
            LogTag::Expression,
            &format!("{chunk}/{}: evaluated {} unit(s)", stage.name, inputs.len()),
        );
        self.finish_stage(manifest, chunk, &stage.name, &validation, 0, 0)?;
        Ok(())
    }

    /// Save the manifest as paused; called from interrupt safe points.
    pub fn pause(&mut self, manifest: &mut Manifest, reason: &str) -> Result<ExitStatus> {
        manifest.status = RunStatus::Paused;
        manifest.metadata.paused_at = Some(chrono::Utc::now());
        self.store.save(manifest)?;
        self.log.info(&format!("paused: {reason}"));
        Ok(ExitStatus::Paused)
    }

    /// Save the manifest as failed with the error recorded.
    pub fn fail(&mut self, manifest: &mut Manifest, error: &str) -> Result<ExitStatus> {
        manifest.status = RunStatus::Failed;
        manifest.metadata.error = Some(error.to_string());
        self.store.save(manifest)?;
        self.log.error(error);
        Ok(ExitStatus::Failed)
    }

    /// Chunk names matching a state predicate, ascending — the submission
    /// tie-break order.
    pub fn chunks_in_state(
        &self,
        manifest: &Manifest,
        predicate: impl Fn(&ChunkState) -> bool,
    ) -> Vec<String> {
        manifest
            .chunks
            .iter()
            .filter(|(_, info)| predicate(&ChunkState::parse(&info.state)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.config.stage_names().iter().position(|s| s == stage)
    }
}
