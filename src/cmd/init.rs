//! `--init`: create a new run directory.
//!
//! Snapshots the pipeline config, templates, schemas, items, and the model
//! registry into `DIR/config/`, generates and chunks units, and writes the
//! initial manifest. Everything needed to reproduce the run lives under its
//! root afterwards. A second `--init` on the same directory is refused.

use crate::chunks::{ChunkState, chunk_name};
use crate::config::PipelineConfig;
use crate::manifest::{
    ChunkInfo, Manifest, ManifestStore, RunMetadata, RunMode,
};
use crate::registry::ModelRegistry;
use crate::rundir::{self, RunDir};
use crate::units;
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

pub struct InitArgs {
    pub pipeline: String,
    pub run_dir: PathBuf,
    pub max_units: Option<usize>,
    pub repeat: Option<u32>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub realtime: bool,
    pub assume_yes: bool,
    pub quiet: bool,
}

pub fn cmd_init(args: &InitArgs) -> Result<()> {
    let config_path = resolve_pipeline(&args.pipeline)?;
    let config_dir = config_path
        .parent()
        .context("Pipeline config has no parent directory")?
        .to_path_buf();
    let mut config = PipelineConfig::load(&config_path)?;

    // Offline config check first: a broken config must abort before any
    // chunk exists.
    let report = crate::config::validate::validate_config(&config, &config_dir)?;
    if !report.ok() {
        for error in &report.errors {
            eprintln!("error: {error}");
        }
        bail!("pipeline config failed validation ({} error(s))", report.errors.len());
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }

    if args.run_dir.join(crate::manifest::MANIFEST_FILE).exists() {
        bail!(
            "{} is already an initialised run; refusing to re-init",
            args.run_dir.display()
        );
    }

    // CLI overrides land in the snapshot so every later invocation sees them.
    if let Some(provider) = &args.provider {
        config.api.provider = Some(provider.clone());
    }
    if let Some(model) = &args.model {
        config.api.model = Some(model.clone());
    }
    if let Some(repeat) = args.repeat {
        config.processing.repeat = Some(repeat);
    }

    let run = RunDir::new(&args.run_dir);
    snapshot_config(&run, &config, &config_dir)?;

    // Generate, cap, chunk.
    let items = units::load_items(&config_dir, &config.processing)?;
    let mut all_units = units::generate(&config, &items)?;
    if let Some(cap) = args.max_units {
        all_units.truncate(cap);
    }
    if all_units.is_empty() {
        bail!("unit generation produced no units");
    }
    if all_units.len() > 10_000 && !args.assume_yes {
        bail!(
            "this configuration generates {} units; pass --yes to confirm",
            all_units.len()
        );
    }
    let chunks = units::chunk_units(all_units, config.processing.chunk_size);

    let stage_names = config.stage_names();
    let first_stage = stage_names
        .first()
        .context("Pipeline has no per-chunk stages")?;

    let mut metadata = RunMetadata {
        run_id: uuid::Uuid::new_v4().to_string(),
        pipeline_name: config.pipeline.name.clone(),
        mode: if args.realtime {
            RunMode::Realtime
        } else {
            RunMode::Batch
        },
        provider: config.api.provider.clone().unwrap_or_default(),
        model: config.api.model.clone().unwrap_or_default(),
        source_config_path: Some(config_path.clone()),
        ..Default::default()
    };
    // Fill provider/model defaults from the registry for cost estimates.
    let registry = ModelRegistry::builtin();
    if metadata.provider.is_empty() {
        if let Some(first_llm) = config.chunk_stages().iter().find(|s| s.is_llm()) {
            metadata.provider = config.provider_for(first_llm).unwrap_or_default();
        }
    }
    if metadata.model.is_empty() {
        if let Some(entry) = registry.provider(&metadata.provider) {
            metadata.model = entry.default_model.clone();
        }
    }

    let mut manifest = Manifest::new(stage_names.clone(), metadata);
    for (index, chunk) in chunks.iter().enumerate() {
        let name = chunk_name(index);
        let dir = run.chunk_dir(&name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        rundir::write_jsonl(&run.units_file(&name), chunk)?;
        manifest.chunks.insert(
            name,
            ChunkInfo::new(chunk.len(), ChunkState::pending(first_stage)),
        );
    }

    let store = ManifestStore::new(run.root(), ModelRegistry::load_for_run(run.root()));
    store.save(&mut manifest)?;

    if !args.quiet {
        println!(
            "initialised {}: {} unit(s) in {} chunk(s), pipeline [{}]",
            args.run_dir.display(),
            manifest.total_units(),
            manifest.chunks.len(),
            stage_names.join(", ")
        );
    }
    Ok(())
}

/// Resolve `--pipeline NAME` to a config file: a literal path, `NAME.yaml`,
/// or `pipelines/NAME.yaml`.
fn resolve_pipeline(name: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return direct
            .canonicalize()
            .context("Failed to resolve pipeline path");
    }
    for candidate in [
        PathBuf::from(format!("{name}.yaml")),
        PathBuf::from("pipelines").join(format!("{name}.yaml")),
    ] {
        if candidate.is_file() {
            return candidate
                .canonicalize()
                .context("Failed to resolve pipeline path");
        }
    }
    bail!("pipeline '{name}' not found (tried {name}, {name}.yaml, pipelines/{name}.yaml)");
}

/// Copy config, templates, schemas, items, and the registry into the run.
fn snapshot_config(run: &RunDir, config: &PipelineConfig, config_dir: &Path) -> Result<()> {
    let snapshot = run.config_dir();
    std::fs::create_dir_all(&snapshot)
        .with_context(|| format!("Failed to create {}", snapshot.display()))?;

    let config_yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    std::fs::write(snapshot.join("config.yaml"), config_yaml)?;

    let template_src = config_dir.join(&config.prompts.template_dir);
    let template_dst = snapshot.join(&config.prompts.template_dir);
    if template_src.is_dir() {
        copy_dir(&template_src, &template_dst)?;
    }
    let schema_src = config_dir.join(&config.schemas.schema_dir);
    let schema_dst = snapshot.join(&config.schemas.schema_dir);
    if schema_src.is_dir() {
        copy_dir(&schema_src, &schema_dst)?;
    }

    let items_src = config_dir.join(&config.processing.items.source);
    let items_dst = snapshot.join(&config.processing.items.source);
    if let Some(parent) = items_dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&items_src, &items_dst)
        .with_context(|| format!("Failed to snapshot items from {}", items_src.display()))?;

    // Snapshot the registry so pricing stays reproducible for this run.
    let registry_yaml = serde_yaml::to_string(&ModelRegistry::builtin())
        .context("Failed to serialize model registry")?;
    std::fs::write(snapshot.join("models.yaml"), registry_yaml)?;
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
