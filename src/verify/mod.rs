//! Offline integrity checking and repair.
//!
//! `verify` compares, per stage, the units that should have materialised
//! against what is actually on disk, reporting missing, duplicated, and
//! orphaned unit ids. `repair` turns the missing set into retry chunks. The
//! missing list handed to repair is always complete — display truncation is
//! a rendering concern, never a data concern.

use crate::config::PipelineConfig;
use crate::manifest::Manifest;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::recovery::create_retry_chunk;
use crate::rundir::{self, RunDir};
use crate::units::Unit;
use crate::validation::FailureRecord;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub expected: usize,
    pub valid: usize,
    pub failed: usize,
    pub missing: Vec<String>,
    pub duplicated: Vec<String>,
    pub orphaned: Vec<String>,
}

impl StageReport {
    pub fn clean(&self) -> bool {
        self.missing.is_empty() && self.duplicated.is_empty() && self.orphaned.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub stages: Vec<StageReport>,
}

impl VerifyReport {
    pub fn clean(&self) -> bool {
        self.stages.iter().all(StageReport::clean)
    }

    pub fn total_missing(&self) -> usize {
        self.stages.iter().map(|s| s.missing.len()).sum()
    }
}

/// Scan every chunk and compare expected vs materialised units per stage.
pub fn verify_run(run: &RunDir, config: &PipelineConfig) -> Result<VerifyReport> {
    let stage_names = config.stage_names();
    let chunks = run.list_chunks()?;
    let mut stages = Vec::with_capacity(stage_names.len());

    for (stage_index, stage) in stage_names.iter().enumerate() {
        let mut expected: BTreeSet<String> = BTreeSet::new();
        let mut valid_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();

        for chunk in &chunks {
            for id in expected_ids(run, &stage_names, chunk, stage_index)? {
                expected.insert(id);
            }
            let validated: Vec<Unit> =
                rundir::read_jsonl_or_empty(&run.validated_file(chunk, stage))?;
            for record in validated {
                if let Some(id) = record.get("unit_id").and_then(|v| v.as_str()) {
                    *valid_counts.entry(id.to_string()).or_default() += 1;
                }
            }
            let failures: Vec<FailureRecord> =
                rundir::read_jsonl_or_empty(&run.failures_file(chunk, stage))?;
            for failure in failures {
                failed.insert(failure.unit_id);
            }
        }

        let materialised: BTreeSet<&String> =
            valid_counts.keys().chain(failed.iter()).collect();
        let missing: Vec<String> = expected
            .iter()
            .filter(|id| !materialised.contains(id))
            .cloned()
            .collect();
        let duplicated: Vec<String> = valid_counts
            .iter()
            .filter(|&(_, &count)| count > 1)
            .map(|(id, _)| id.clone())
            .collect();
        let orphaned: Vec<String> = valid_counts
            .keys()
            .chain(failed.iter())
            .filter(|id| !expected.contains(*id))
            .cloned()
            .collect();

        stages.push(StageReport {
            stage: stage.clone(),
            expected: expected.len(),
            valid: valid_counts.len(),
            failed: failed.len(),
            missing,
            duplicated,
            orphaned,
        });
    }

    Ok(VerifyReport { stages })
}

fn expected_ids(
    run: &RunDir,
    stage_names: &[String],
    chunk: &str,
    stage_index: usize,
) -> Result<Vec<String>> {
    let path = if stage_index == 0 {
        run.units_file(chunk)
    } else {
        run.validated_file(chunk, &stage_names[stage_index - 1])
    };
    let records: Vec<Unit> = rundir::read_jsonl_or_empty(&path)?;
    Ok(records
        .iter()
        .filter_map(|r| r.get("unit_id").and_then(|v| v.as_str()).map(String::from))
        .collect())
}

/// Create retry chunks covering every missing unit reported by `verify`.
/// Idempotent: a second run on an unchanged run directory finds the units
/// covered by the first repair's chunks and creates nothing.
pub fn repair_run(orch: &mut Orchestrator, report: &VerifyReport) -> Result<Vec<String>> {
    let stage_names = orch.config.stage_names();
    let chunks = orch.run.list_chunks()?;
    let mut manifest: Manifest = orch.store.load()?;
    let mut created = Vec::new();

    // Units already owned by a non-terminal chunk are in flight, not lost;
    // re-chunking them would run them twice. This is what makes a second
    // repair on an unchanged run a no-op.
    let mut in_flight: BTreeSet<String> = BTreeSet::new();
    for chunk in &chunks {
        let terminal = manifest
            .chunks
            .get(chunk)
            .map(|c| crate::chunks::ChunkState::parse(&c.state).is_terminal())
            .unwrap_or(false);
        if terminal {
            continue;
        }
        let records: Vec<Unit> = rundir::read_jsonl_or_empty(&orch.run.units_file(chunk))?;
        for record in records {
            if let Some(id) = record.get("unit_id").and_then(|v| v.as_str()) {
                in_flight.insert(id.to_string());
            }
        }
    }

    for (stage_index, stage_report) in report.stages.iter().enumerate() {
        if stage_report.missing.is_empty() {
            continue;
        }
        let wanted: BTreeSet<&String> = stage_report
            .missing
            .iter()
            .filter(|id| !in_flight.contains(*id))
            .collect();
        if wanted.is_empty() {
            continue;
        }

        // Recover each missing unit's stage input from wherever it lives.
        let mut inputs: BTreeMap<String, Unit> = BTreeMap::new();
        for chunk in &chunks {
            let path = if stage_index == 0 {
                orch.run.units_file(chunk)
            } else {
                orch.run
                    .validated_file(chunk, &stage_names[stage_index - 1])
            };
            let records: Vec<Unit> = rundir::read_jsonl_or_empty(&path)?;
            for record in records {
                if let Some(id) = record.get("unit_id").and_then(|v| v.as_str()) {
                    if wanted.contains(&id.to_string()) {
                        inputs.entry(id.to_string()).or_insert(record);
                    }
                }
            }
        }

        let units: Vec<Unit> = inputs.into_values().collect();
        let chunk_size = orch.config.processing.chunk_size.max(1);
        for batch in units.chunks(chunk_size) {
            let name = create_retry_chunk(orch, &mut manifest, stage_index, batch)?;
            created.push(name);
        }
    }

    if !created.is_empty() {
        orch.store.save(&mut manifest)?;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config() -> PipelineConfig {
        serde_yaml::from_str(
            r#"
pipeline:
  name: demo
  steps:
    - name: generate
    - name: score
processing:
  strategy: direct
  chunk_size: 50
  items: { source: items.yaml, key: people, name_field: name }
"#,
        )
        .unwrap()
    }

    fn write_units(run: &RunDir, chunk: &str, ids: &[&str]) {
        std::fs::create_dir_all(run.chunk_dir(chunk)).unwrap();
        let units: Vec<serde_json::Value> =
            ids.iter().map(|id| json!({"unit_id": id})).collect();
        rundir::write_jsonl(&run.units_file(chunk), &units).unwrap();
    }

    fn write_validated(run: &RunDir, chunk: &str, stage: &str, ids: &[&str]) {
        let records: Vec<serde_json::Value> =
            ids.iter().map(|id| json!({"unit_id": id})).collect();
        rundir::write_jsonl(&run.validated_file(chunk, stage), &records).unwrap();
    }

    fn write_failures(run: &RunDir, chunk: &str, stage: &str, ids: &[&str]) {
        let records: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "unit_id": id,
                    "failure_stage": "schema_validation",
                    "stage_input": {"unit_id": id},
                    "raw_response": "x",
                    "errors": [],
                })
            })
            .collect();
        rundir::write_jsonl(&run.failures_file(chunk, stage), &records).unwrap();
    }

    #[test]
    fn clean_run_verifies_clean() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        write_units(&run, "chunk_000", &["a", "b"]);
        write_validated(&run, "chunk_000", "generate", &["a", "b"]);
        write_validated(&run, "chunk_000", "score", &["a", "b"]);

        let report = verify_run(&run, &config()).unwrap();
        assert!(report.clean());
        assert_eq!(report.stages[0].expected, 2);
        assert_eq!(report.stages[1].valid, 2);
    }

    #[test]
    fn failed_units_are_not_expected_downstream() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        write_units(&run, "chunk_000", &["a", "b", "c"]);
        write_validated(&run, "chunk_000", "generate", &["a", "b"]);
        write_failures(&run, "chunk_000", "generate", &["c"]);
        write_validated(&run, "chunk_000", "score", &["a", "b"]);

        let report = verify_run(&run, &config()).unwrap();
        assert!(report.clean());
        assert_eq!(report.stages[0].expected, 3);
        assert_eq!(report.stages[0].failed, 1);
        assert_eq!(report.stages[1].expected, 2);
    }

    #[test]
    fn silent_attrition_is_reported_as_missing() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        write_units(&run, "chunk_000", &["a", "b", "c"]);
        // "b" started processing but landed nowhere.
        write_validated(&run, "chunk_000", "generate", &["a"]);
        write_failures(&run, "chunk_000", "generate", &["c"]);

        let report = verify_run(&run, &config()).unwrap();
        assert!(!report.clean());
        assert_eq!(report.stages[0].missing, vec!["b"]);
        assert_eq!(report.total_missing(), 1);
    }

    #[test]
    fn duplicates_and_orphans_detected() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        write_units(&run, "chunk_000", &["a"]);
        write_validated(&run, "chunk_000", "generate", &["a", "a", "ghost"]);

        let report = verify_run(&run, &config()).unwrap();
        assert_eq!(report.stages[0].duplicated, vec!["a"]);
        assert_eq!(report.stages[0].orphaned, vec!["ghost"]);
    }

    #[test]
    fn missing_list_is_never_truncated() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        let ids: Vec<String> = (0..500).map(|i| format!("u{i:04}")).collect();
        let refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        write_units(&run, "chunk_000", &refs);

        let report = verify_run(&run, &config()).unwrap();
        // All 500 missing ids are present in the data handed to repair.
        assert_eq!(report.stages[0].missing.len(), 500);
    }
}
