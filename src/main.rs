//! Newt - benchmark evaluation harness for AI agents
//!
//! Main entry point for the CLI.

use anyhow::Result;
use clap::Parser;
use newt::agent_runner::{AgentRunner, RunOptions};
use newt::benchmarks::get_benchmark;
use newt::cli::{Cli, Commands, RunArgs};
use newt::config::HarnessConfig;
use newt::runner::{AgentSpec, ProgressEvent};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up .env before anything reads the environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging()?;

    let result = match &cli.command {
        Commands::Run(args) => run(&cli, args).await,
    };

    if let Err(ref e) = result {
        tracing::error!("Run failed: {e:#}");
    }

    result
}

/// Execute one evaluation run.
async fn run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    if let Some(max_concurrent) = args.max_concurrent {
        config.dispatch.max_concurrent = max_concurrent;
    }
    if let Some(timeout) = args.timeout {
        config.dispatch.task_timeout = std::time::Duration::from_secs(timeout);
    }

    let benchmark = get_benchmark(&args.benchmark, &config.results_dir, &args.benchmark_args_map())?;

    let agent = AgentSpec {
        name: args.agent_name.clone(),
        entry: args.entry.clone(),
        directory: args.agent_dir.clone(),
        args: args.agent_args_map(),
        execution_mode: args.execution_mode(),
        environment_name: args.env_name.clone(),
    };

    let options = RunOptions {
        run_id: args.run_id.clone(),
        continue_run: args.continue_run,
        ignore_errors: args.ignore_errors,
        max_tasks: args.max_tasks,
        run_command: Some(std::env::args().collect::<Vec<_>>().join(" ")),
    };

    // Ctrl-C stops admitting new tasks; in-flight tasks drain
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Shutdown requested; letting in-flight tasks finish");
            signal_cancel.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            if let ProgressEvent::TaskCompleted {
                task_id,
                outcome,
                completed,
                total_tasks,
                ..
            } = event
            {
                println!("[{completed}/{total_tasks}] {task_id}: {outcome}");
            }
        }
    });

    let runner = AgentRunner::new(benchmark, agent, config, options, cancel)?
        .with_progress(progress_tx);
    tracing::info!("Starting run {}", runner.run_id());

    let bundle = runner.run().await?;

    println!("{}", serde_json::to_string_pretty(&bundle["results"])?);
    Ok(())
}

/// Initialize logging to stderr and a file
///
/// The file (`newt.log`) gets debug-level detail; stderr stays at the
/// level selected through `RUST_LOG` (default info).
fn init_logging() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let log_file = std::fs::File::create("newt.log")?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true),
        )
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newt=debug,info")),
        )
        .init();

    Ok(())
}
