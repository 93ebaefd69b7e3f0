//! CLI command handlers, one module per operational mode.

mod info;
mod init;
mod ps;
mod revalidate;
mod status;
mod validate_config;
mod verify;

pub use info::cmd_info;
pub use init::{InitArgs, cmd_init};
pub use ps::cmd_ps;
pub use revalidate::cmd_revalidate;
pub use status::cmd_status;
pub use validate_config::cmd_validate_config;
pub use verify::{cmd_repair, cmd_verify};

use crate::orchestrator::{Orchestrator, RuntimeOptions};
use crate::orchestrator::recovery::build_retry_chunks;
use anyhow::Result;
use std::path::Path;

/// `--retry-failures`: explicit retry-chunk construction, distinct from the
/// automatic startup scan.
pub fn cmd_retry_failures(run_dir: &Path, opts: RuntimeOptions) -> Result<()> {
    let mut orch = Orchestrator::open(run_dir.to_path_buf(), opts)?;
    let created = build_retry_chunks(&mut orch)?;
    if created == 0 {
        println!("no retryable failures found in terminal chunks");
    } else {
        println!("created {created} retry chunk(s)");
    }
    Ok(())
}
