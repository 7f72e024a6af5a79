//! End-to-end run pipeline
//!
//! Wires the pieces together for one (agent, benchmark) evaluation:
//! validate configuration, filter the dataset for continuation, dispatch
//! the remaining tasks over the selected transport, and finalize into a
//! results bundle. Per-task failures never abort the pipeline; only
//! configuration and scoring errors do.

use crate::benchmarks::Benchmark;
use crate::config::HarnessConfig;
use crate::continuation;
use crate::errors::HarnessError;
use crate::finalize::{self, RunInfo};
use crate::runner::vm::VmSettings;
use crate::runner::{
    AgentSpec, Dispatcher, DockerTransport, ExecutionMode, LocalTransport, ProgressEvent,
    VmTransport, WorkerTransport,
};
use crate::store::SubmissionStore;
use crate::telemetry;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-invocation options, distinct from the durable [`HarnessConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stable run identifier; generated from the benchmark name and the
    /// current time when absent.
    pub run_id: Option<String>,
    /// Resume a previous run with the same ID.
    pub continue_run: bool,
    /// When continuing, skip even the tasks whose last attempt errored.
    pub ignore_errors: bool,
    /// Cap on how many tasks this invocation dispatches.
    pub max_tasks: Option<usize>,
    /// Invoking command line, recorded in the bundle.
    pub run_command: Option<String>,
}

/// Drives one full evaluation run.
pub struct AgentRunner {
    benchmark: Box<dyn Benchmark>,
    agent: Arc<AgentSpec>,
    config: HarnessConfig,
    options: RunOptions,
    run_id: String,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    transport_override: Option<Arc<dyn WorkerTransport>>,
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("run_id", &self.run_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AgentRunner {
    /// Validate the configuration and construct the runner.
    ///
    /// All configuration errors surface here, before any task dispatch.
    pub fn new(
        benchmark: Box<dyn Benchmark>,
        agent: AgentSpec,
        config: HarnessConfig,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<Self, HarnessError> {
        agent.validate()?;

        if benchmark.requires_sandbox() && !agent.execution_mode.is_sandbox() {
            return Err(HarnessError::SandboxRequired(benchmark.name().to_string()));
        }

        let run_id = safe_filename(&options.run_id.clone().unwrap_or_else(|| {
            format!("{}_{}", benchmark.name(), chrono::Utc::now().timestamp())
        }));

        Ok(Self {
            benchmark,
            agent: Arc::new(agent),
            config,
            options,
            run_id,
            cancel,
            progress: None,
            transport_override: None,
        })
    }

    /// The resolved run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Attach a progress event sink.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Replace the transport selected by the execution mode (tests).
    pub fn with_transport(mut self, transport: Arc<dyn WorkerTransport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    fn build_transport(&self) -> Result<Arc<dyn WorkerTransport>> {
        if let Some(transport) = &self.transport_override {
            return Ok(Arc::clone(transport));
        }

        let setup_script = self.benchmark.setup_script().map(Into::into);
        Ok(match self.agent.execution_mode {
            ExecutionMode::Local => Arc::new(LocalTransport::new(
                self.agent.environment_name.clone(),
            )),
            ExecutionMode::Docker => Arc::new(DockerTransport::new(
                self.config.docker.clone(),
                setup_script,
            )),
            ExecutionMode::Vm => Arc::new(VmTransport::new(
                VmSettings::from_env()?,
                setup_script,
                self.config.retry.clone(),
            )),
        })
    }

    /// Run the pipeline to a written bundle.
    pub async fn run(&self) -> Result<Value> {
        let telemetry = telemetry::from_env(&self.run_id);

        let run_dir = self.benchmark.get_run_dir(&self.run_id)?;
        let store = Arc::new(SubmissionStore::new(run_dir, &self.run_id));

        let mut dataset = self.benchmark.get_dataset()?;
        tracing::info!(
            "Loaded {} tasks from benchmark '{}'",
            dataset.len(),
            self.benchmark.name()
        );

        if dataset.values().any(|task| task.requires_gpu())
            && self.agent.execution_mode != ExecutionMode::Vm
        {
            tracing::warn!(
                "This benchmark contains tasks that require GPU but is not running on a VM; \
                 GPU tasks may not work correctly. Use --vm to run on a VM."
            );
        }

        if self.options.continue_run {
            dataset =
                continuation::filter_remaining(dataset, &store, self.options.ignore_errors).await?;
        }
        let dataset = continuation::apply_max_tasks(dataset, self.options.max_tasks);

        let agent_output: BTreeMap<String, Value> = if dataset.is_empty() {
            tracing::warn!("No remaining tasks to run");
            if let Some(bundle) = finalize::load_previous_bundle(&store).await? {
                tracing::info!("Loading previous results...");
                return Ok(bundle);
            }
            tracing::info!(
                "No previous results found; evaluating previous raw submissions..."
            );
            store.latest_results().await?
        } else {
            tracing::info!("Running agent on {} tasks...", dataset.len());
            let transport = self.build_transport()?;
            let mut dispatcher = Dispatcher::new(
                transport,
                Arc::clone(&store),
                self.config.dispatch.clone(),
                self.config.retry.clone(),
                self.cancel.clone(),
            );
            if let Some(progress) = &self.progress {
                dispatcher = dispatcher.with_progress(progress.clone());
            }

            let dispatched = dispatcher
                .dispatch(dataset.clone(), Arc::clone(&self.agent), &self.run_id)
                .await
                .context("dispatch failed")?;

            if self.options.continue_run {
                // Fold in terminal outcomes from previous attempts; the log
                // already holds this run's lines, so latest-wins covers both.
                store.latest_results().await?
            } else {
                dispatched
            }
        };

        let unfinished = continuation::unfinished_tasks(&dataset, &store).await?;

        let info = RunInfo {
            agent_name: self.agent.name.clone(),
            run_id: self.run_id.clone(),
            agent_args: self.agent.args.clone(),
            run_command: self.options.run_command.clone(),
        };

        finalize::finalize(
            &info,
            &agent_output,
            &unfinished,
            self.benchmark.as_ref(),
            telemetry.as_ref(),
            &store,
        )
        .await
    }
}

/// Make a string safe to use as a file or directory name.
fn safe_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("run-1_a.b"), "run-1_a.b");
        assert_eq!(safe_filename("usaco 2024/03"), "usaco_2024_03");
        assert_eq!(safe_filename("sneaky/../../etc"), "sneaky_.._.._etc");
    }
}
