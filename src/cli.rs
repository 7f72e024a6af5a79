//! Command-line interface
//!
//! Exit-code contract: 0 on a completed run even when individual tasks
//! failed (their failures live in the submissions log and the bundle);
//! non-zero only for harness-level failures such as invalid configuration
//! or a scoring error.

use crate::runner::ExecutionMode;
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "newt", version, about = "Benchmark evaluation harness for AI agents")]
pub struct Cli {
    /// Path to a harness config file (defaults to newt.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Evaluate an agent against a benchmark
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Benchmark name
    #[arg(long, short = 'b')]
    pub benchmark: String,

    /// Display name for the agent, recorded in the results bundle
    #[arg(long)]
    pub agent_name: String,

    /// Directory containing the agent's code
    #[arg(long)]
    pub agent_dir: PathBuf,

    /// Agent entry point as module.function
    #[arg(long, default_value = "main.run")]
    pub entry: String,

    /// Agent argument as key=value (repeatable); values parse as JSON when
    /// possible, otherwise as strings
    #[arg(short = 'A', value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub agent_args: Vec<(String, String)>,

    /// Benchmark argument as key=value (repeatable)
    #[arg(short = 'B', value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub benchmark_args: Vec<(String, String)>,

    /// Stable run identifier; generated when absent
    #[arg(long)]
    pub run_id: Option<String>,

    /// Maximum number of concurrent workers
    #[arg(long, env = "NEWT_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Dispatch at most this many tasks this invocation
    #[arg(long)]
    pub max_tasks: Option<usize>,

    /// Per-task wall-clock timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Resume the run identified by --run-id
    #[arg(long)]
    pub continue_run: bool,

    /// When continuing, also skip tasks whose last attempt errored
    #[arg(long, requires = "continue_run")]
    pub ignore_errors: bool,

    /// Run each task in a Docker container
    #[arg(long, conflicts_with_all = ["vm", "env_name"])]
    pub docker: bool,

    /// Run each task on a freshly provisioned cloud VM
    #[arg(long, conflicts_with = "env_name")]
    pub vm: bool,

    /// Named environment to activate around the runner (local mode)
    #[arg(long = "env", value_name = "NAME")]
    pub env_name: Option<String>,
}

impl RunArgs {
    pub fn execution_mode(&self) -> ExecutionMode {
        if self.vm {
            ExecutionMode::Vm
        } else if self.docker {
            ExecutionMode::Docker
        } else {
            ExecutionMode::Local
        }
    }

    pub fn agent_args_map(&self) -> Map<String, Value> {
        to_value_map(&self.agent_args)
    }

    pub fn benchmark_args_map(&self) -> Map<String, Value> {
        to_value_map(&self.benchmark_args)
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

/// Coerce raw argument strings into JSON values where they parse as such.
fn to_value_map(pairs: &[(String, String)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("CLI should parse")
    }

    #[test]
    fn test_minimal_run_invocation() {
        let cli = parse(&[
            "newt", "run", "--benchmark", "usaco", "--agent-name", "my-agent",
            "--agent-dir", "agents/my-agent",
        ]);

        let Commands::Run(run) = cli.command;
        assert_eq!(run.benchmark, "usaco");
        assert_eq!(run.entry, "main.run");
        assert_eq!(run.execution_mode(), ExecutionMode::Local);
        assert!(!run.continue_run);
    }

    #[test]
    fn test_agent_args_json_coercion() {
        let cli = parse(&[
            "newt", "run", "--benchmark", "b", "--agent-name", "a", "--agent-dir", "d",
            "-A", "model=gpt-4o", "-A", "temperature=0.7", "-A", "verbose=true",
            "-A", "tags=[\"fast\"]",
        ]);

        let Commands::Run(run) = cli.command;
        let args = run.agent_args_map();
        assert_eq!(args["model"], json!("gpt-4o"));
        assert_eq!(args["temperature"], json!(0.7));
        assert_eq!(args["verbose"], json!(true));
        assert_eq!(args["tags"], json!(["fast"]));
    }

    #[test]
    fn test_execution_mode_flags() {
        let cli = parse(&[
            "newt", "run", "--benchmark", "b", "--agent-name", "a", "--agent-dir", "d", "--vm",
        ]);
        let Commands::Run(run) = cli.command;
        assert_eq!(run.execution_mode(), ExecutionMode::Vm);

        let cli = parse(&[
            "newt", "run", "--benchmark", "b", "--agent-name", "a", "--agent-dir", "d", "--docker",
        ]);
        let Commands::Run(run) = cli.command;
        assert_eq!(run.execution_mode(), ExecutionMode::Docker);
    }

    #[test]
    fn test_conflicting_modes_rejected() {
        assert!(
            Cli::try_parse_from([
                "newt", "run", "--benchmark", "b", "--agent-name", "a", "--agent-dir", "d",
                "--docker", "--vm",
            ])
            .is_err()
        );
        assert!(
            Cli::try_parse_from([
                "newt", "run", "--benchmark", "b", "--agent-name", "a", "--agent-dir", "d",
                "--env", "agent_env", "--docker",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_ignore_errors_requires_continue() {
        assert!(
            Cli::try_parse_from([
                "newt", "run", "--benchmark", "b", "--agent-name", "a", "--agent-dir", "d",
                "--ignore-errors",
            ])
            .is_err()
        );
        assert!(
            Cli::try_parse_from([
                "newt", "run", "--benchmark", "b", "--agent-name", "a", "--agent-dir", "d",
                "--continue-run", "--ignore-errors",
            ])
            .is_ok()
        );
    }

    #[test]
    fn test_bad_key_val_rejected() {
        assert!(parse_key_val("no-equals-sign").is_err());
        assert!(parse_key_val("=value").is_err());
        assert_eq!(
            parse_key_val("k=v=w").unwrap(),
            ("k".to_string(), "v=w".to_string())
        );
    }
}
