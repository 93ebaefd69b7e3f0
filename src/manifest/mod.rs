//! Run manifest: the atomic persistent representation of a run's state.
//!
//! `MANIFEST.json` is authoritative; `.manifest_summary.json` is a derived
//! lightweight cache regenerated on every save. Both are written with the
//! write-temp-then-rename discipline so a kill at any instant leaves the
//! previous file intact.

use crate::errors::ManifestError;
use crate::registry::ModelRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const SUMMARY_FILE: &str = ".manifest_summary.json";

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Killed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
            RunStatus::Killed => "killed",
        };
        write!(f, "{s}")
    }
}

/// Per-chunk bookkeeping. The `state` string is owned by the chunk state
/// machine (`crate::chunks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub unit_count: usize,
    #[serde(default)]
    pub valid_count: usize,
    #[serde(default)]
    pub failed_count: usize,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub state: String,
}

impl ChunkInfo {
    pub fn new(unit_count: usize, initial_state: String) -> Self {
        Self {
            unit_count,
            valid_count: 0,
            failed_count: 0,
            retry_count: 0,
            batch_id: None,
            submitted_at: None,
            provider_status: None,
            input_tokens: 0,
            output_tokens: 0,
            state: initial_state,
        }
    }
}

/// Execution mode recorded in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Batch,
    Realtime,
    Mixed,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunMode::Batch => "batch",
            RunMode::Realtime => "realtime",
            RunMode::Mixed => "mixed",
        };
        write!(f, "{s}")
    }
}

/// Metadata block; fields populate lazily over the run lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunMetadata {
    pub run_id: String,
    pub pipeline_name: String,
    pub mode: RunMode,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_cap_usd: Option<f64>,
    /// Where the pipeline config was loaded from at init time; used by
    /// `--revalidate --use-source-config`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_config_path: Option<std::path::PathBuf>,
    #[serde(default)]
    pub initial_input_tokens: u64,
    #[serde(default)]
    pub initial_output_tokens: u64,
    #[serde(default)]
    pub retry_input_tokens: u64,
    #[serde(default)]
    pub retry_output_tokens: u64,
}

/// The authoritative run state, persisted as `MANIFEST.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub status: RunStatus,
    pub pipeline_list: Vec<String>,
    pub chunks: BTreeMap<String, ChunkInfo>,
    pub metadata: RunMetadata,
    #[serde(default)]
    pub completed_run_steps: Vec<String>,
}

impl Manifest {
    pub fn new(pipeline_list: Vec<String>, metadata: RunMetadata) -> Self {
        let now = Utc::now();
        Self {
            created: now,
            updated: now,
            status: RunStatus::Pending,
            pipeline_list,
            chunks: BTreeMap::new(),
            metadata,
            completed_run_steps: Vec::new(),
        }
    }

    /// True when every chunk is in a terminal state.
    pub fn all_chunks_terminal(&self) -> bool {
        self.chunks
            .values()
            .all(|c| crate::chunks::ChunkState::parse(&c.state).is_terminal())
    }

    /// True when at least one chunk is not terminal.
    pub fn has_nonterminal_chunks(&self) -> bool {
        !self.all_chunks_terminal()
    }

    pub fn total_units(&self) -> usize {
        self.chunks.values().map(|c| c.unit_count).sum()
    }

    pub fn total_tokens(&self) -> (u64, u64) {
        let input = self.chunks.values().map(|c| c.input_tokens).sum();
        let output = self.chunks.values().map(|c| c.output_tokens).sum();
        (input, output)
    }

    /// Fraction of chunk-stage transitions completed, in [0, 100].
    pub fn progress_pct(&self) -> f64 {
        if self.chunks.is_empty() || self.pipeline_list.is_empty() {
            return 0.0;
        }
        let stages = self.pipeline_list.len();
        let total = (self.chunks.len() * stages) as f64;
        let done: usize = self
            .chunks
            .values()
            .map(|c| {
                match crate::chunks::ChunkState::parse(&c.state) {
                    crate::chunks::ChunkState::Validated | crate::chunks::ChunkState::Failed => {
                        stages
                    }
                    crate::chunks::ChunkState::Pending { stage }
                    | crate::chunks::ChunkState::Submitted { stage } => self
                        .pipeline_list
                        .iter()
                        .position(|s| s == &stage)
                        .unwrap_or(0),
                    crate::chunks::ChunkState::Unknown { .. } => 0,
                }
            })
            .sum();
        (done as f64 / total) * 100.0
    }

    /// Best-effort total cost from the registry and accumulated tokens.
    pub fn estimated_cost(&self, registry: &ModelRegistry) -> f64 {
        let (input, output) = self.total_tokens();
        registry.estimate_cost(
            &self.metadata.provider,
            &self.metadata.model,
            input,
            output,
            self.metadata.mode == RunMode::Batch,
        )
    }
}

/// Lightweight derived cache published alongside the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub status: RunStatus,
    pub progress_pct: f64,
    pub total_units: usize,
    pub valid_units: usize,
    pub failed_units: usize,
    pub cost_usd: f64,
    pub total_tokens: u64,
    pub mode: RunMode,
    pub pipeline_name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Summary {
    pub fn derive(manifest: &Manifest, registry: &ModelRegistry) -> Self {
        let (input, output) = manifest.total_tokens();
        Self {
            status: manifest.status,
            progress_pct: manifest.progress_pct(),
            total_units: manifest.total_units(),
            valid_units: manifest.chunks.values().map(|c| c.valid_count).sum(),
            failed_units: manifest.chunks.values().map(|c| c.failed_count).sum(),
            cost_usd: manifest.estimated_cost(registry),
            total_tokens: input + output,
            mode: manifest.metadata.mode,
            pipeline_name: manifest.metadata.pipeline_name.clone(),
            created: manifest.created,
            updated: manifest.updated,
            started_at: manifest.metadata.started_at,
            completed_at: manifest.metadata.completed_at,
        }
    }
}

/// Atomic load/save of a run's manifest and summary.
pub struct ManifestStore {
    run_dir: PathBuf,
    registry: ModelRegistry,
}

impl ManifestStore {
    pub fn new(run_dir: &Path, registry: ModelRegistry) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            registry,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn load(&self) -> Result<Manifest, ManifestError> {
        load(&self.run_dir)
    }

    /// Save the manifest and regenerate the summary, both atomically.
    ///
    /// Stamps `updated`. If the save fails the caller must treat the state
    /// transition that prompted it as aborted.
    pub fn save(&self, manifest: &mut Manifest) -> Result<(), ManifestError> {
        manifest.updated = Utc::now();

        let manifest_path = self.run_dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(manifest).map_err(|e| {
            ManifestError::Save {
                path: manifest_path.clone(),
                source: std::io::Error::other(e),
            }
        })?;
        write_atomic(&manifest_path, json.as_bytes())?;

        let summary = Summary::derive(manifest, &self.registry);
        let summary_path = self.run_dir.join(SUMMARY_FILE);
        let json = serde_json::to_string_pretty(&summary).map_err(|e| {
            ManifestError::Save {
                path: summary_path.clone(),
                source: std::io::Error::other(e),
            }
        })?;
        write_atomic(&summary_path, json.as_bytes())?;
        Ok(())
    }
}

/// Load the manifest, distinguishing a missing file from a corrupt one.
pub fn load(run_dir: &Path) -> Result<Manifest, ManifestError> {
    let path = run_dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Err(ManifestError::Missing { path });
    }
    let content = std::fs::read_to_string(&path).map_err(|e| ManifestError::Io {
        path: path.clone(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| ManifestError::Unparseable { path, source: e })
}

/// Read the lightweight summary. Stale data is acceptable; corrupt is not.
pub fn read_summary(run_dir: &Path) -> Result<Summary, ManifestError> {
    let path = run_dir.join(SUMMARY_FILE);
    if !path.exists() {
        return Err(ManifestError::Missing { path });
    }
    let content = std::fs::read_to_string(&path).map_err(|e| ManifestError::Io {
        path: path.clone(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| ManifestError::Unparseable { path, source: e })
}

/// Write-temp-then-rename in the destination's own directory. Same-directory
/// rename is what makes this atomic on POSIX file systems.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ManifestError> {
    let dir = path.parent().ok_or_else(|| ManifestError::Save {
        path: path.to_path_buf(),
        source: std::io::Error::other("path has no parent directory"),
    })?;
    let tmp = dir.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));

    let result = (|| -> std::io::Result<()> {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        ManifestError::Save {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_manifest() -> Manifest {
        let metadata = RunMetadata {
            run_id: "test-run".to_string(),
            pipeline_name: "demo".to_string(),
            mode: RunMode::Batch,
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            ..Default::default()
        };
        let mut m = Manifest::new(
            vec!["generate".to_string(), "score".to_string()],
            metadata,
        );
        m.chunks.insert(
            "chunk_000".to_string(),
            ChunkInfo::new(50, "generate_PENDING".to_string()),
        );
        m.chunks.insert(
            "chunk_001".to_string(),
            ChunkInfo::new(50, "generate_PENDING".to_string()),
        );
        m
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path(), ModelRegistry::builtin());
        let mut m = make_manifest();
        store.save(&mut m).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.status, m.status);
        assert_eq!(loaded.pipeline_list, m.pipeline_list);
        assert_eq!(loaded.chunks.len(), 2);
        assert_eq!(loaded.chunks["chunk_000"].unit_count, 50);
    }

    #[test]
    fn save_regenerates_summary() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path(), ModelRegistry::builtin());
        let mut m = make_manifest();
        store.save(&mut m).unwrap();

        let summary = read_summary(dir.path()).unwrap();
        assert_eq!(summary.total_units, 100);
        assert_eq!(summary.status, RunStatus::Pending);

        m.status = RunStatus::Running;
        m.chunks.get_mut("chunk_000").unwrap().valid_count = 30;
        store.save(&mut m).unwrap();

        let summary = read_summary(dir.path()).unwrap();
        assert_eq!(summary.status, RunStatus::Running);
        assert_eq!(summary.valid_units, 30);
    }

    #[test]
    fn load_missing_is_distinct_from_unparseable() {
        let dir = TempDir::new().unwrap();
        match load(dir.path()) {
            Err(ManifestError::Missing { .. }) => {}
            other => panic!("expected Missing, got {other:?}"),
        }

        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        match load(dir.path()) {
            Err(ManifestError::Unparseable { .. }) => {}
            other => panic!("expected Unparseable, got {other:?}"),
        }
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"v\": 2}").unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1, "only the target file remains: {entries:?}");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\": 2}");
    }

    #[test]
    fn progress_counts_terminal_chunks_as_full() {
        let mut m = make_manifest();
        assert_eq!(m.progress_pct(), 0.0);

        m.chunks.get_mut("chunk_000").unwrap().state = "VALIDATED".to_string();
        m.chunks.get_mut("chunk_001").unwrap().state = "score_PENDING".to_string();
        // chunk_000: 2/2 stages, chunk_001: 1/2 stages -> 75%
        assert!((m.progress_pct() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
    }
}
