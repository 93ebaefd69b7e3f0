//! Signal handling and process-liveness classification.
//!
//! Interrupts are cooperative: the handler sets a flag, and the loops check
//! it at every safe point (iteration boundaries, before provider calls,
//! inside the tick sleep). A synchronous provider call in flight cannot be
//! preempted; the handler waits for it to return.

use crate::chunks::ChunkState;
use crate::manifest::{Manifest, RunStatus};
use crate::rundir::{self, RunDir};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install the SIGINT/SIGTERM handler. Returns the flag the loops observe.
pub fn install_interrupt_handler() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));

    let sigint_flag = Arc::clone(&flag);
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if sigint_flag.swap(true, Ordering::SeqCst) {
                // Second interrupt: the operator really means it.
                eprintln!("second interrupt, exiting immediately");
                std::process::exit(130);
            }
            eprintln!("interrupt received, pausing at next safe point...");
        }
    });

    #[cfg(unix)]
    install_unix_signals(&flag);

    flag
}

#[cfg(unix)]
fn install_unix_signals(flag: &Arc<AtomicBool>) {
    use tokio::signal::unix::{SignalKind, signal};

    // A downstream `head`-style consumer of stdout must not take the
    // orchestrator down: restore the default SIGPIPE disposition.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let term_flag = Arc::clone(flag);
    tokio::spawn(async move {
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            return;
        };
        term.recv().await;
        term_flag.store(true, Ordering::SeqCst);
        eprintln!("terminate received, pausing at next safe point...");
    });

    // SIGUSR1: best-effort diagnostic dump for hung-process triage.
    tokio::spawn(async move {
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            return;
        };
        loop {
            usr1.recv().await;
            let backtrace = std::backtrace::Backtrace::force_capture();
            eprintln!("diagnostic dump (SIGUSR1):\n{backtrace}");
        }
    });
}

/// Observer's view of a run's process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// PID present and alive.
    Alive,
    /// Manifest says running but the PID is dead.
    Zombie,
    /// Non-terminal chunk states with no live process.
    Detached,
    /// Terminal or paused with no live process — the normal at-rest state.
    AtRest,
}

/// Classify a run from its manifest and PID file. The PID file persists
/// after exit by design; only the signal-0 probe establishes liveness.
pub fn classify(run: &RunDir, manifest: &Manifest) -> Liveness {
    let alive = rundir::read_pid(run).is_some_and(rundir::pid_alive);
    if alive {
        return Liveness::Alive;
    }
    if manifest.status == RunStatus::Running {
        return Liveness::Zombie;
    }
    let has_nonterminal = manifest
        .chunks
        .values()
        .any(|c| !ChunkState::parse(&c.state).is_terminal());
    if has_nonterminal && manifest.status != RunStatus::Paused {
        return Liveness::Detached;
    }
    Liveness::AtRest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ChunkInfo, Manifest, RunMetadata};
    use tempfile::TempDir;

    fn manifest_with(status: RunStatus, chunk_state: &str) -> Manifest {
        let mut m = Manifest::new(vec!["s1".to_string()], RunMetadata::default());
        m.status = status;
        m.chunks.insert(
            "chunk_000".to_string(),
            ChunkInfo::new(5, chunk_state.to_string()),
        );
        m
    }

    #[test]
    fn running_with_dead_pid_is_zombie() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        // A pid far beyond pid_max on any sane system.
        std::fs::write(run.pid_file(), "999999999\n").unwrap();
        let m = manifest_with(RunStatus::Running, "s1_PENDING");
        assert_eq!(classify(&run, &m), Liveness::Zombie);
    }

    #[test]
    fn failed_with_nonterminal_chunks_is_detached() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        let m = manifest_with(RunStatus::Failed, "s1_SUBMITTED");
        assert_eq!(classify(&run, &m), Liveness::Detached);
    }

    #[test]
    fn paused_run_is_at_rest() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        let m = manifest_with(RunStatus::Paused, "s1_PENDING");
        assert_eq!(classify(&run, &m), Liveness::AtRest);
    }

    #[test]
    fn complete_run_is_at_rest_even_with_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        std::fs::write(run.pid_file(), "999999999\n").unwrap();
        let m = manifest_with(RunStatus::Complete, "VALIDATED");
        assert_eq!(classify(&run, &m), Liveness::AtRest);
    }

    #[cfg(unix)]
    #[test]
    fn live_pid_classifies_alive() {
        let dir = TempDir::new().unwrap();
        let run = RunDir::new(dir.path());
        std::fs::write(run.pid_file(), format!("{}\n", std::process::id())).unwrap();
        let m = manifest_with(RunStatus::Running, "s1_PENDING");
        assert_eq!(classify(&run, &m), Liveness::Alive);
    }
}
