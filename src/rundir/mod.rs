//! Run directory layout and file primitives.
//!
//! A run is a self-contained directory: config snapshot, items, chunks, logs,
//! and manifest all live under its root. This module owns the path scheme,
//! JSONL readers/writers (transparently handling `.jsonl.gz` at rest), and
//! the PID file.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const PID_FILE: &str = "orchestrator.pid";

/// Path scheme for one run directory.
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn chunk_dir(&self, chunk: &str) -> PathBuf {
        self.chunks_dir().join(chunk)
    }

    pub fn units_file(&self, chunk: &str) -> PathBuf {
        self.chunk_dir(chunk).join("units.jsonl")
    }

    pub fn prompts_file(&self, chunk: &str, stage: &str) -> PathBuf {
        self.chunk_dir(chunk).join(format!("{stage}_prompts.jsonl"))
    }

    pub fn results_file(&self, chunk: &str, stage: &str) -> PathBuf {
        self.chunk_dir(chunk).join(format!("{stage}_results.jsonl"))
    }

    pub fn validated_file(&self, chunk: &str, stage: &str) -> PathBuf {
        self.chunk_dir(chunk)
            .join(format!("{stage}_validated.jsonl"))
    }

    pub fn failures_file(&self, chunk: &str, stage: &str) -> PathBuf {
        self.chunk_dir(chunk)
            .join(format!("{stage}_failures.jsonl"))
    }

    /// Retry-recovery archive. Its presence signals that the stage must not
    /// be short-circuited by the resume optimisation.
    pub fn failures_backup_file(&self, chunk: &str, stage: &str) -> PathBuf {
        self.chunk_dir(chunk)
            .join(format!("{stage}_failures.jsonl.bak"))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    /// Chunk directory names in ascending order — the submission tie-break.
    pub fn list_chunks(&self) -> Result<Vec<String>> {
        let dir = self.chunks_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Read every record from a JSONL file, transparently falling back to a
/// sibling `.gz` when the plain file is absent. Blank lines are skipped;
/// an unparseable line is an error, not a silent drop.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = open_maybe_gz(path)?;
    let Some(reader) = reader else {
        anyhow::bail!("File not found: {}", path.display());
    };
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("Bad record at {}:{}", path.display(), idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Like [`read_jsonl`] but an absent file (and absent `.gz` sibling) reads as
/// empty.
pub fn read_jsonl_or_empty<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() && !gz_sibling(path).exists() {
        return Ok(Vec::new());
    }
    read_jsonl(path)
}

/// Does this logical JSONL file exist in either plain or compressed form?
pub fn jsonl_exists(path: &Path) -> bool {
    path.exists() || gz_sibling(path).exists()
}

fn gz_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".gz");
    PathBuf::from(os)
}

fn open_maybe_gz(path: &Path) -> Result<Option<Box<dyn BufRead>>> {
    if path.exists() {
        let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        return Ok(Some(Box::new(BufReader::new(f))));
    }
    let gz = gz_sibling(path);
    if gz.exists() {
        let f = File::open(&gz).with_context(|| format!("Failed to open {}", gz.display()))?;
        return Ok(Some(Box::new(BufReader::new(GzDecoder::new(f)))));
    }
    Ok(None)
}

/// Append one record per line. Creates the file if needed.
pub fn append_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    for record in records {
        let line = serde_json::to_string(record).context("Failed to serialize record")?;
        writeln!(f, "{line}").with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

/// Replace the file's contents with the given records, atomically.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record).context("Failed to serialize record")?;
        buf.push(b'\n');
    }
    crate::manifest::write_atomic(path, &buf)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write the current process id to `orchestrator.pid` atomically.
///
/// The file persists after exit by design — observers establish liveness
/// with a signal-0 probe, never by file presence.
pub fn write_pid(run: &RunDir) -> Result<u32> {
    let pid = std::process::id();
    crate::manifest::write_atomic(&run.pid_file(), format!("{pid}\n").as_bytes())
        .context("Failed to write PID file")?;
    Ok(pid)
}

pub fn read_pid(run: &RunDir) -> Option<u32> {
    let content = std::fs::read_to_string(run.pid_file()).ok()?;
    content.trim().parse().ok()
}

/// POSIX signal-0 probe: is the process with this pid alive?
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) succeeds (or fails with EPERM) iff the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No portable cheap probe; report dead so observers err toward "resumable".
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    #[test]
    fn append_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("units.jsonl");
        append_jsonl(&path, &[json!({"unit_id": "a"}), json!({"unit_id": "b"})]).unwrap();
        append_jsonl(&path, &[json!({"unit_id": "c"})]).unwrap();

        let records: Vec<Value> = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["unit_id"], "c");
    }

    #[test]
    fn read_falls_back_to_gz() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("stage_validated.jsonl");
        let gz_path = dir.path().join("stage_validated.jsonl.gz");

        let mut enc = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        enc.write_all(b"{\"unit_id\": \"z\"}\n").unwrap();
        enc.finish().unwrap();

        let records: Vec<Value> = read_jsonl(&plain).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["unit_id"], "z");
        assert!(jsonl_exists(&plain));
    }

    #[test]
    fn missing_file_reads_empty_with_or_empty_variant() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.jsonl");
        let records: Vec<Value> = read_jsonl_or_empty(&path).unwrap();
        assert!(records.is_empty());
        assert!(read_jsonl::<Value>(&path).is_err());
    }

    #[test]
    fn bad_line_is_an_error_not_a_silent_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"ok\": 1}\nnot json\n").unwrap();
        assert!(read_jsonl::<Value>(&path).is_err());
    }

    #[test]
    fn pid_file_round_trips_and_probe_sees_self() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        let pid = write_pid(&run).unwrap();
        assert_eq!(read_pid(&run), Some(pid));
        #[cfg(unix)]
        assert!(pid_alive(pid), "our own pid must probe alive");
    }

    #[test]
    fn list_chunks_sorted_ascending() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        for name in ["chunk_010", "chunk_002", "chunk_000"] {
            std::fs::create_dir_all(run.chunk_dir(name)).unwrap();
        }
        assert_eq!(
            run.list_chunks().unwrap(),
            vec!["chunk_000", "chunk_002", "chunk_010"]
        );
    }
}
