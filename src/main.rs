use anyhow::{Context, Result, bail};
use batchpilot::cmd;
use batchpilot::orchestrator::{self, Orchestrator, RuntimeOptions, lifecycle};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Local batch-orchestration engine for multi-stage LLM workflows.
///
/// Modes are flags, mutually exclusive except `--init --realtime` (create a
/// run and immediately drive it synchronously).
#[derive(Parser)]
#[command(name = "batchpilot")]
#[command(version, about = "Local batch-orchestration engine for multi-stage LLM workflows")]
pub struct Cli {
    /// Create a new run from a pipeline config.
    #[arg(long)]
    pub init: bool,

    /// Enter the batch-mode poll/submit loop.
    #[arg(long)]
    pub watch: bool,

    /// Enter the realtime loop (may combine with --init).
    #[arg(long)]
    pub realtime: bool,

    /// Execute exactly one tick of the batch loop.
    #[arg(long)]
    pub tick: bool,

    /// Emit JSON status for a run.
    #[arg(long)]
    pub status: bool,

    /// Construct retry chunks from failures in terminal chunks.
    #[arg(long)]
    pub retry_failures: bool,

    /// Re-run validation against persisted raw responses.
    #[arg(long)]
    pub revalidate: bool,

    /// Offline pipeline config check.
    #[arg(long)]
    pub validate_config: bool,

    /// Integrity check across stages.
    #[arg(long)]
    pub verify: bool,

    /// Create retry chunks for units reported missing by --verify.
    #[arg(long)]
    pub repair: bool,

    /// List all runs with status, progress, and cost.
    #[arg(long)]
    pub ps: bool,

    /// Detailed run info.
    #[arg(long)]
    pub info: bool,

    /// Pipeline name or config path (with --init).
    #[arg(long)]
    pub pipeline: Option<String>,

    /// Pipeline config path (with --validate-config).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run directory.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Stage name (with --revalidate).
    #[arg(long)]
    pub step: Option<String>,

    /// Reload schema/rules from the original config instead of the snapshot.
    #[arg(long)]
    pub use_source_config: bool,

    /// Cap on generated units (with --init).
    #[arg(long)]
    pub max_units: Option<usize>,

    /// Monte-Carlo repetitions per unit (with --init).
    #[arg(long)]
    pub repeat: Option<u32>,

    /// Provider override (with --init).
    #[arg(long)]
    pub provider: Option<String>,

    /// Model override (with --init).
    #[arg(long)]
    pub model: Option<String>,

    /// Assume yes for confirmation prompts.
    #[arg(long)]
    pub yes: bool,

    /// Suppress console echo; log files are still written.
    #[arg(long)]
    pub quiet: bool,

    /// Machine-readable output where supported.
    #[arg(long)]
    pub json: bool,

    /// Abort (pause) the run once estimated cost exceeds this many USD.
    #[arg(long)]
    pub max_cost: Option<f64>,

    /// Absolute wall-clock ceiling for this invocation, e.g. "90m" or "2h".
    #[arg(long)]
    pub timeout: Option<String>,

    /// Override the configured poll interval, in seconds.
    #[arg(long)]
    pub interval: Option<u64>,

    /// Override the configured retry attempt limit.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl Cli {
    fn runtime_options(&self) -> Result<RuntimeOptions> {
        Ok(RuntimeOptions {
            quiet: self.quiet,
            max_cost_usd: self.max_cost,
            poll_interval: self.interval,
            max_retries: self.max_retries,
            timeout: self.timeout.as_deref().map(parse_duration).transpose()?,
        })
    }

    fn require_run_dir(&self) -> Result<PathBuf> {
        self.run_dir
            .clone()
            .context("--run-dir is required for this mode")
    }
}

/// "45s", "90m", "2h", or plain seconds.
fn parse_duration(raw: &str) -> Result<Duration> {
    let pattern = regex::Regex::new(r"^(\d+)\s*([smh]?)$").expect("duration pattern is valid");
    let captures = pattern
        .captures(raw.trim())
        .with_context(|| format!("bad duration '{raw}' (expected e.g. 45s, 90m, 2h)"))?;
    let value: u64 = captures[1]
        .parse()
        .with_context(|| format!("bad duration '{raw}'"))?;
    let secs = match &captures[2] {
        "m" => value * 60,
        "h" => value * 3600,
        _ => value,
    };
    Ok(Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = dispatch(&cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    let modes = [
        cli.init,
        cli.watch,
        cli.realtime,
        cli.tick,
        cli.status,
        cli.retry_failures,
        cli.revalidate,
        cli.validate_config,
        cli.verify,
        cli.repair,
        cli.ps,
        cli.info,
    ];
    let selected = modes.iter().filter(|&&m| m).count();
    if selected == 0 {
        bail!("no mode selected; see --help");
    }
    // --init --realtime is the one permitted combination.
    if selected > 1 && !(selected == 2 && cli.init && cli.realtime) {
        bail!("mode flags are mutually exclusive (except --init --realtime)");
    }

    if cli.validate_config {
        let config = cli
            .config
            .clone()
            .context("--validate-config requires --config PATH")?;
        return cmd::cmd_validate_config(&config);
    }
    if cli.ps {
        cmd::cmd_ps(cli.json)?;
        return Ok(0);
    }

    if cli.init {
        let args = cmd::InitArgs {
            pipeline: cli
                .pipeline
                .clone()
                .context("--init requires --pipeline NAME")?,
            run_dir: cli.require_run_dir()?,
            max_units: cli.max_units,
            repeat: cli.repeat,
            provider: cli.provider.clone(),
            model: cli.model.clone(),
            realtime: cli.realtime,
            assume_yes: cli.yes,
            quiet: cli.quiet,
        };
        cmd::cmd_init(&args)?;
        if !cli.realtime {
            return Ok(0);
        }
    }

    let run_dir = cli.require_run_dir()?;
    let opts = cli.runtime_options()?;

    if cli.status {
        cmd::cmd_status(&run_dir)?;
        return Ok(0);
    }
    if cli.info {
        cmd::cmd_info(&run_dir, cli.json)?;
        return Ok(0);
    }
    if cli.verify {
        return cmd::cmd_verify(&run_dir, cli.json);
    }
    if cli.repair {
        return cmd::cmd_repair(&run_dir, cli.yes, opts);
    }
    if cli.retry_failures {
        cmd::cmd_retry_failures(&run_dir, opts)?;
        return Ok(0);
    }
    if cli.revalidate {
        let step = cli
            .step
            .clone()
            .context("--revalidate requires --step STAGE")?;
        cmd::cmd_revalidate(&run_dir, &step, cli.use_source_config, opts).await?;
        return Ok(0);
    }

    // The remaining modes drive the orchestrator loops.
    let mut orch = Orchestrator::open(run_dir, opts)?;
    orch.interrupt = lifecycle::install_interrupt_handler();

    let exit = if cli.realtime {
        orchestrator::realtime::run_realtime(&mut orch).await?
    } else if cli.watch || cli.tick {
        orchestrator::batch::run_batch(&mut orch, cli.tick).await?
    } else {
        bail!("no mode selected; see --help");
    };
    Ok(exit.code())
}
