//! Worker transports and the task dispatcher
//!
//! Execution of one task always follows the same lifecycle, whatever the
//! backend:
//!
//! ```text
//! prepare -> start -> (poll | fetch_trace)* -> poll(terminal) -> teardown
//! ```
//!
//! The [`WorkerTransport`] trait captures that lifecycle; the three
//! implementations differ only in where the worker lives:
//!
//! - [`local`]: a scratch directory on this host, agent as a child process
//! - [`docker`]: a container kept alive with an idle command, driven
//!   through the docker CLI
//! - [`vm`]: a cloud VM reached over SSH, with traces streamed back while
//!   the task runs
//!
//! The [`dispatcher`] drives many lifecycles concurrently under a
//! semaphore; [`script`] generates the bootstrap program every worker runs;
//! [`retry`] wraps the transient infrastructure calls.

use crate::benchmarks::types::Task;
use crate::errors::HarnessError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

pub mod dispatcher;
pub mod docker;
pub mod local;
pub mod retry;
pub mod script;
pub mod vm;
pub mod workspace;

pub use dispatcher::{DispatchConfig, Dispatcher, ProgressEvent};
pub use docker::DockerTransport;
pub use local::LocalTransport;
pub use retry::RetryPolicy;
pub use vm::VmTransport;

/// Where the agent process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Child process in a scratch directory on this host.
    #[default]
    Local,
    /// Docker container on this host.
    Docker,
    /// Remote cloud VM, one per task.
    Vm,
}

impl ExecutionMode {
    /// Whether this mode isolates the agent from the host filesystem.
    pub fn is_sandbox(&self) -> bool {
        matches!(self, ExecutionMode::Docker | ExecutionMode::Vm)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Local => write!(f, "local"),
            ExecutionMode::Docker => write!(f, "docker"),
            ExecutionMode::Vm => write!(f, "vm"),
        }
    }
}

/// Everything the harness knows about the agent under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Display name, recorded in the results bundle.
    pub name: String,
    /// Entry point as `module.function`, resolved inside the worker.
    pub entry: String,
    /// Host directory containing the agent's code.
    pub directory: PathBuf,
    /// Keyword arguments passed to the agent on every task.
    pub args: serde_json::Map<String, Value>,
    /// Execution backend.
    pub execution_mode: ExecutionMode,
    /// Named environment to activate around the runner (local mode).
    pub environment_name: Option<String>,
}

impl AgentSpec {
    /// Split the entry spec into module and function names.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidEntrySpec`] unless the spec is
    /// `module.function` with both parts non-empty.
    pub fn entry_parts(&self) -> Result<(&str, &str), HarnessError> {
        match self.entry.rsplit_once('.') {
            Some((module, function)) if !module.is_empty() && !function.is_empty() => {
                Ok((module, function))
            }
            _ => Err(HarnessError::InvalidEntrySpec(self.entry.clone())),
        }
    }

    /// Validate the spec before any task is dispatched.
    ///
    /// Checks the entry format, that the agent directory exists, that a
    /// bare local run has a `requirements.txt` to build its environment
    /// from, and that at most one of environment name / docker / vm is
    /// selected.
    pub fn validate(&self) -> Result<(), HarnessError> {
        self.entry_parts()?;

        if !self.directory.is_dir() {
            return Err(HarnessError::AgentDirNotFound(self.directory.clone()));
        }

        if self.environment_name.is_some() && self.execution_mode != ExecutionMode::Local {
            return Err(HarnessError::ConflictingExecutionModes);
        }

        let bare_local =
            self.execution_mode == ExecutionMode::Local && self.environment_name.is_none();
        if bare_local && !self.directory.join("requirements.txt").is_file() {
            return Err(HarnessError::MissingRequirements(self.directory.clone()));
        }

        Ok(())
    }
}

/// State of one provisioned worker, threaded through the transport calls.
///
/// Which fields are populated depends on the backend: local mode owns a
/// child process, docker and vm modes carry the worker's name, vm mode
/// additionally records the public address.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Task this worker hosts.
    pub task_id: String,
    /// Host-side scratch directory (staging area in vm mode).
    pub workspace: PathBuf,
    /// Container or VM identity; empty for local workers.
    pub worker_name: String,
    /// Public address of a remote worker.
    pub host: Option<String>,
    /// Local mode's runner process.
    pub child: Option<tokio::process::Child>,
}

impl WorkerHandle {
    pub fn new(task_id: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            task_id: task_id.into(),
            workspace: workspace.into(),
            worker_name: String::new(),
            host: None,
            child: None,
        }
    }
}

/// Common contract of the three execution backends.
///
/// The dispatcher holds the only reference to each [`WorkerHandle`] and
/// calls these methods strictly in lifecycle order. `teardown` is always
/// called, even after an error, and must leave the worker's artifacts under
/// `task_dir` before releasing backend resources.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Provision a worker and stage the task's inputs into it.
    ///
    /// May take seconds to minutes (VM creation). Transient infrastructure
    /// failures inside `prepare` are the retryable kind.
    async fn prepare(&self, task_id: &str, task: &Task, agent: &AgentSpec)
    -> Result<WorkerHandle>;

    /// Launch the runner script inside the worker. Fire and forget; actual
    /// completion is observed through `poll`.
    async fn start(&self, handle: &mut WorkerHandle, runner_script: &str) -> Result<()>;

    /// Check for completion.
    ///
    /// Returns `Ok(Some(output))` once the worker has written its
    /// `output.json`, `Ok(None)` while still running, and `Err` when the
    /// worker terminated without producing output.
    async fn poll(&self, handle: &mut WorkerHandle) -> Result<Option<Value>>;

    /// Snapshot the worker's trace stream, if this backend exposes one.
    async fn fetch_trace(&self, _handle: &mut WorkerHandle) -> Result<Option<String>> {
        Ok(None)
    }

    /// Preserve artifacts under `task_dir`, then release the worker.
    ///
    /// Called exactly once per prepared worker. Failures are logged by the
    /// dispatcher and never override the task's recorded result.
    async fn teardown(&self, handle: &mut WorkerHandle, task_dir: &Path) -> Result<()>;
}
