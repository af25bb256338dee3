//! execpool CLI
//!
//! Runs records through a pool of pre-spawned worker processes, or
//! benchmarks the pool against spawning a process per call.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use execpool::config::{self, Config};
use execpool::tracing_init::init_tracing;
use execpool::Pool;
use execpool_cli::{bench_cmd, run_cmd};

#[derive(Parser, Debug)]
#[command(name = "execpool")]
#[command(version, about = "Pipe input through a pool of pre-spawned worker processes")]
struct Cli {
    /// Config file (TOML), layered over the global config
    #[arg(long, global = true, env = "EXECPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Number of pre-spawned workers
    #[arg(long, global = true)]
    size: Option<usize>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed each line of stdin to its own worker and print the outputs in order
    Run(RunArgs),
    /// Compare pooled checkouts with spawning a process per call
    Bench(BenchArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Kill a worker that runs longer than this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Maximum records in flight (defaults to the pool size)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Worker program and arguments, overriding the config
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Number of calls per mode
    #[arg(short = 'n', long, default_value_t = 100)]
    iterations: u32,

    /// Input fed to every call
    #[arg(long, default_value = "this is nonesense")]
    input: String,

    /// Worker program and arguments, overriding the config
    #[arg(last = true)]
    command: Vec<String>,
}

impl Cli {
    /// Apply CLI flags on top of the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if self.size.is_some() {
            config.pool.size = self.size;
        }
        if self.log_level.is_some() {
            config.log.level.clone_from(&self.log_level);
        }
        if self.log_json {
            config.log.json = Some(true);
        }

        let command = match &self.command {
            Commands::Run(args) => {
                if args.timeout_ms.is_some() {
                    config.pool.timeout_ms = args.timeout_ms;
                }
                &args.command
            }
            Commands::Bench(args) => &args.command,
        };
        if let Some((program, args)) = command.split_first() {
            config.worker.program = Some(program.clone());
            config.worker.args = args.to_vec();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    let level = config.log_level();
    init_tracing(
        &format!("execpool={level},execpool_cli={level}"),
        config.log_json(),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        size = config.pool_size(),
        program = ?config.worker.program,
        "Starting execpool"
    );

    let spec = config.spec()?;
    let pool = Pool::new(spec.clone(), config.pool_size()).context("Failed to start worker pool")?;

    match cli.command {
        Commands::Run(args) => {
            let opts = run_cmd::RunOptions {
                jobs: args.jobs.unwrap_or_else(|| config.pool_size()),
                timeout: config.timeout(),
            };
            run_cmd::run(&pool, opts).await
        }
        Commands::Bench(args) => {
            let report =
                bench_cmd::bench(&pool, &spec, args.input.as_bytes(), args.iterations).await?;
            bench_cmd::print_report(&report);
            Ok(())
        }
    }
}
