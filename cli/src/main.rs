//! testfleet command-line runner.
//!
//! `testfleet run <PATTERNS>... -- <COMMAND>...` expands the glob patterns
//! into test units and runs `<COMMAND> <unit path>` for each, with the
//! configured parallelism, retry and bail behaviour.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::{debug, info};

use testfleet::worker::ProcessWorker;
use testfleet::{logging, FleetConfig, RunOutcome, TestRunController, TestUnit};

#[derive(Parser, Debug)]
#[command(name = "testfleet", version, about = "Run test files across a pool of workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to a TOML configuration file.
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short = 'v', global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every file matched by the patterns.
    ///
    /// Only the scheduling keys of the configuration apply here. The write
    /// queue keys (max_write_thread_count, save_path_base, message_prefix)
    /// configure a QueueServer embedded through the library; child processes
    /// started by this command have no message channel to one.
    Run(RunArgs),
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Glob patterns selecting test files.
    #[arg(required = true, value_name = "PATTERN")]
    patterns: Vec<String>,

    /// Maximum number of concurrent workers.
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Stop at the first failure.
    #[arg(long)]
    bail: bool,

    /// Extra attempts for a failing unit.
    #[arg(long)]
    retry_count: Option<u32>,

    /// Delay before a failed unit is retried, in milliseconds.
    #[arg(long, value_name = "MS")]
    retry_delay_ms: Option<u64>,

    /// Per-attempt timeout, in milliseconds.
    #[arg(long, value_name = "MS")]
    test_timeout_ms: Option<u64>,

    /// Command run for each unit; the unit path is appended.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut FleetConfig) {
        if let Some(workers) = self.workers {
            config.worker_limit = workers;
        }
        if self.bail {
            config.bail = true;
        }
        if let Some(retry_count) = self.retry_count {
            config.retry_count = retry_count;
        }
        if let Some(delay) = self.retry_delay_ms {
            config.retry_delay_ms = delay;
        }
        if let Some(timeout) = self.test_timeout_ms {
            config.test_timeout_ms = Some(timeout);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            ExitCode::from(2)
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = FleetConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            args.apply(&mut config);
            config.validate()?;
            run(&args, &config).await
        }
    }
}

async fn run(args: &RunArgs, config: &FleetConfig) -> Result<ExitCode> {
    let units = collect_units(&args.patterns)?;
    if units.is_empty() {
        bail!("No test files matched {}", args.patterns.join(", "));
    }

    let (program, program_args) = args
        .command
        .split_first()
        .context("A command to run each unit with is required")?;
    let worker = ProcessWorker::new(program.clone(), program_args.iter().cloned());
    let controller = TestRunController::new(config.run_config(), worker);

    info!(
        units = units.len(),
        worker_limit = config.worker_limit,
        retry_count = config.retry_count,
        bail = config.bail,
        "Starting run"
    );
    let total = units.len();
    let started = Instant::now();
    let outcome = controller.run_queue(units).await;

    report(&outcome, total, started.elapsed());
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Expand patterns into units, deduplicated and in path order.
fn collect_units(patterns: &[String]) -> Result<Vec<TestUnit>> {
    let mut paths = BTreeSet::new();
    for pattern in patterns {
        let entries = glob::glob(pattern).with_context(|| format!("Invalid pattern `{}`", pattern))?;
        for entry in entries {
            let path = entry?;
            if path.is_file() {
                paths.insert(path);
            }
        }
    }

    paths.iter().map(|path| load_unit(path)).collect()
}

fn load_unit(path: &Path) -> Result<TestUnit> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    debug!(path = %path.display(), "Collected unit");
    Ok(TestUnit::new(path.display().to_string(), content))
}

fn report(outcome: &RunOutcome, total: usize, elapsed: Duration) {
    for failure in outcome.failures() {
        println!("{} {}", "FAIL".red().bold(), failure.unit.path);
        println!("     {}", failure.error.message.dimmed());
    }

    let failed = outcome.failures().len();
    let summary = format!(
        "{} units, {} failed, {} attempts in {:.2}s",
        total,
        failed,
        outcome.attempts(),
        elapsed.as_secs_f64()
    );
    if outcome.bailed() {
        println!("{} {}", "BAILED".yellow().bold(), summary);
    } else if failed == 0 {
        println!("{} {}", "PASS".green().bold(), summary);
    } else {
        println!("{} {}", "FAIL".red().bold(), summary);
    }
}
