//! Chunk state machine.
//!
//! A chunk's state is persisted as a string in the manifest:
//! `"{stage}_PENDING"`, `"{stage}_SUBMITTED"` (batch LLM stages only),
//! `"VALIDATED"` (terminal success), or `"FAILED"` (terminal failure).
//!
//! Invariants enforced here:
//! - a chunk never re-enters a stage it has advanced past, except via
//!   explicit retry recovery which rewrites the state in place
//! - a stage that completes with zero valid units and at least one failure
//!   sends the chunk to `FAILED` instead of advancing it with an empty input

use serde::{Deserialize, Serialize};

pub const VALIDATED: &str = "VALIDATED";
pub const FAILED: &str = "FAILED";

/// Parsed form of the manifest's chunk state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    Pending { stage: String },
    Submitted { stage: String },
    Validated,
    Failed,
    /// A state string this build does not recognise. Treated as
    /// non-terminal and never acted on.
    Unknown { raw: String },
}

impl ChunkState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            VALIDATED => ChunkState::Validated,
            FAILED => ChunkState::Failed,
            _ => {
                if let Some(stage) = raw.strip_suffix("_PENDING") {
                    ChunkState::Pending {
                        stage: stage.to_string(),
                    }
                } else if let Some(stage) = raw.strip_suffix("_SUBMITTED") {
                    ChunkState::Submitted {
                        stage: stage.to_string(),
                    }
                } else {
                    ChunkState::Unknown {
                        raw: raw.to_string(),
                    }
                }
            }
        }
    }

    pub fn pending(stage: &str) -> String {
        format!("{stage}_PENDING")
    }

    pub fn submitted(stage: &str) -> String {
        format!("{stage}_SUBMITTED")
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkState::Validated | ChunkState::Failed)
    }

    /// The stage this state refers to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            ChunkState::Pending { stage } | ChunkState::Submitted { stage } => Some(stage),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkState::Pending { stage } => write!(f, "{stage}_PENDING"),
            ChunkState::Submitted { stage } => write!(f, "{stage}_SUBMITTED"),
            ChunkState::Validated => write!(f, "{VALIDATED}"),
            ChunkState::Failed => write!(f, "{FAILED}"),
            ChunkState::Unknown { raw } => write!(f, "{raw}"),
        }
    }
}

/// Outcome of completing a stage on a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub valid: usize,
    pub failed: usize,
}

/// The state a chunk moves to after finishing `stage` with `outcome`.
///
/// Zero-valid guard: with no valid units and at least one failure the chunk
/// goes to `FAILED` — advancing would hand the next stage an empty input,
/// which providers reject, producing infinite transient-retry loops.
pub fn state_after_stage(pipeline: &[String], stage: &str, outcome: StageOutcome) -> String {
    if outcome.valid == 0 && outcome.failed > 0 {
        return FAILED.to_string();
    }
    next_state(pipeline, stage)
}

/// The `{next}_PENDING` state after `stage`, or `VALIDATED` after the last.
pub fn next_state(pipeline: &[String], stage: &str) -> String {
    match pipeline.iter().position(|s| s == stage) {
        Some(i) if i + 1 < pipeline.len() => ChunkState::pending(&pipeline[i + 1]),
        _ => VALIDATED.to_string(),
    }
}

/// Standard chunk directory name: `chunk_000`, `chunk_001`, ...
pub fn chunk_name(index: usize) -> String {
    format!("chunk_{index:03}")
}

/// Retry chunks created by `--retry-failures` / `--repair`.
pub fn retry_chunk_name(index: usize) -> String {
    format!("retry_{index:03}")
}
