//! Operational and per-request telemetry for a run.
//!
//! Two append-only files live in the run root:
//! - `RUN_LOG.txt` — timestamped tagged lines describing orchestrator
//!   decisions (`[SUBMIT]`, `[POLL]`, `[RETRY]`, ...), echoed to the console
//!   unless quiet mode is on
//! - `TRACE_LOG.txt` — one line per completed outgoing API call, kept
//!   separate so the operational log stays readable

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Tags for operational log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Batch,
    Realtime,
    Submit,
    Poll,
    Collect,
    Validate,
    Expression,
    Skip,
    Retry,
    Error,
    Throttle,
    Step,
    Tick,
    Info,
    Tokens,
    Coerce,
}

impl LogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTag::Batch => "[BATCH]",
            LogTag::Realtime => "[REALTIME]",
            LogTag::Submit => "[SUBMIT]",
            LogTag::Poll => "[POLL]",
            LogTag::Collect => "[COLLECT]",
            LogTag::Validate => "[VALIDATE]",
            LogTag::Expression => "[EXPRESSION]",
            LogTag::Skip => "[SKIP]",
            LogTag::Retry => "[RETRY]",
            LogTag::Error => "[ERROR]",
            LogTag::Throttle => "[THROTTLE]",
            LogTag::Step => "[STEP]",
            LogTag::Tick => "[TICK]",
            LogTag::Info => "[INFO]",
            LogTag::Tokens => "[TOKENS]",
            LogTag::Coerce => "[COERCE]",
        }
    }
}

/// Append-only writer for `RUN_LOG.txt`.
///
/// Write failures are reported on the first occurrence and then swallowed:
/// a full disk must not take down the orchestrator mid-tick, and the manifest
/// remains the authoritative record.
pub struct RunLog {
    path: PathBuf,
    quiet: bool,
    write_error_reported: Mutex<bool>,
}

impl RunLog {
    pub fn new(run_dir: &Path, quiet: bool) -> Self {
        Self {
            path: run_dir.join("RUN_LOG.txt"),
            quiet,
            write_error_reported: Mutex::new(false),
        }
    }

    pub fn log(&self, tag: LogTag, message: &str) {
        let line = format!(
            "{} {} {}",
            crate::util::rfc3339(Utc::now()),
            tag.as_str(),
            message
        );
        if !self.quiet {
            println!("{line}");
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            let mut reported = match self.write_error_reported.lock() {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !*reported {
                eprintln!("warning: cannot write {}: {e}", self.path.display());
                *reported = true;
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogTag::Error, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogTag::Info, message);
    }
}

/// Append-only writer for `TRACE_LOG.txt`. Always written, even in quiet mode.
pub struct TraceLog {
    path: PathBuf,
}

impl TraceLog {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join("TRACE_LOG.txt"),
        }
    }

    /// Record one completed outgoing API call.
    pub fn record(
        &self,
        provider: &str,
        chunk: &str,
        unit: &str,
        duration: Duration,
        status: &str,
    ) -> Result<()> {
        let line = format!(
            "{}|{}|{}|{}|{}ms|{}\n",
            crate::util::rfc3339(Utc::now()),
            provider,
            chunk,
            unit,
            duration.as_millis(),
            status
        );
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open trace log")?
            .write_all(line.as_bytes())
            .context("Failed to write trace entry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_log_appends_tagged_lines() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(dir.path(), true);
        log.log(LogTag::Submit, "chunk_000 -> batch abc123");
        log.log(LogTag::Poll, "chunk_000 still running");

        let content = std::fs::read_to_string(dir.path().join("RUN_LOG.txt")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[SUBMIT] chunk_000 -> batch abc123"));
        assert!(lines[1].contains("[POLL] chunk_000 still running"));
    }

    #[test]
    fn trace_log_records_call_fields() {
        let dir = TempDir::new().unwrap();
        let trace = TraceLog::new(dir.path());
        trace
            .record(
                "openai",
                "chunk_001",
                "unit_42",
                Duration::from_millis(250),
                "ok",
            )
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("TRACE_LOG.txt")).unwrap();
        assert!(content.contains("|openai|chunk_001|unit_42|250ms|ok"));
    }

    #[test]
    fn run_log_survives_unwritable_path() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new(&dir.path().join("no/such/subdir"), true);
        // Must not panic; orchestration continues without the log file.
        log.info("still alive");
    }
}
