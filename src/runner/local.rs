//! Local sandbox transport
//!
//! Runs the agent as a child process inside a fresh scratch directory.
//! Isolation is per-task at the filesystem level only: each worker gets
//! its own copy of the agent tree and never sees another task's files.
//! An optional named environment wraps the runner invocation in an
//! activator (`conda run -n <env> ...`), in which case the pinned tracing
//! package is installed into that environment first.

use crate::benchmarks::types::Task;
use crate::runner::workspace::{self, ERROR_FILE, OUTPUT_FILE};
use crate::runner::{AgentSpec, WorkerHandle, WorkerTransport, script};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;

/// Tracing package installed into named environments before launch.
const TRACING_PACKAGE: &str = "weave==0.51.41";

/// Child-process transport with per-task scratch directories.
pub struct LocalTransport {
    interpreter: String,
    environment_name: Option<String>,
}

impl LocalTransport {
    pub fn new(environment_name: Option<String>) -> Self {
        Self {
            interpreter: "python".to_string(),
            environment_name,
        }
    }

    /// Override the interpreter binary (tests use shell builtins).
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Command line that launches the runner, with the environment
    /// activator prepended when one is configured.
    fn runner_command(&self) -> Vec<String> {
        let mut cmd = Vec::new();
        if let Some(env) = &self.environment_name {
            cmd.extend(["conda".into(), "run".into(), "-n".into(), env.clone()]);
        }
        cmd.push(self.interpreter.clone());
        cmd.push(script::SCRIPT_NAME.into());
        cmd
    }
}

#[async_trait]
impl WorkerTransport for LocalTransport {
    async fn prepare(
        &self,
        task_id: &str,
        task: &Task,
        agent: &AgentSpec,
    ) -> Result<WorkerHandle> {
        let scratch = workspace::create_scratch_dir("agent-run").await?;
        workspace::stage(&scratch, task_id, task, agent).await?;
        Ok(WorkerHandle::new(task_id, scratch))
    }

    async fn start(&self, handle: &mut WorkerHandle, runner_script: &str) -> Result<()> {
        fs::write(handle.workspace.join(script::SCRIPT_NAME), runner_script)
            .await
            .context("failed to write runner script")?;

        if let Some(env) = &self.environment_name {
            let install = Command::new("conda")
                .args(["run", "-n", env, "pip", "install", TRACING_PACKAGE])
                .current_dir(&handle.workspace)
                .output()
                .await
                .context("failed to install tracing package into environment")?;
            if !install.status.success() {
                tracing::warn!(
                    "Installing {TRACING_PACKAGE} into environment '{env}' failed: {}",
                    String::from_utf8_lossy(&install.stderr)
                );
            }
        }

        let stdout = std::fs::File::create(handle.workspace.join("stdout.log"))
            .context("failed to create stdout capture file")?;
        let stderr = std::fs::File::create(handle.workspace.join("stderr.log"))
            .context("failed to create stderr capture file")?;

        let cmd = self.runner_command();
        tracing::debug!("Launching runner for task {}: {cmd:?}", handle.task_id);

        let child = Command::new(&cmd[0])
            .args(&cmd[1..])
            .current_dir(&handle.workspace)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| format!("failed to spawn runner '{}'", cmd[0]))?;

        handle.child = Some(child);
        Ok(())
    }

    async fn poll(&self, handle: &mut WorkerHandle) -> Result<Option<Value>> {
        let output_path = handle.workspace.join(OUTPUT_FILE);
        if output_path.is_file() {
            let raw = fs::read_to_string(&output_path)
                .await
                .context("failed to read output.json")?;
            let output: Value =
                serde_json::from_str(&raw).context("worker wrote malformed output.json")?;
            return Ok(Some(output));
        }

        let Some(child) = handle.child.as_mut() else {
            bail!("worker for task {} was never started", handle.task_id);
        };

        let Some(status) = child.try_wait().context("failed to query runner process")? else {
            return Ok(None);
        };

        // The process is gone without an output file. Prefer the runner's
        // own error report, then captured stderr, then the exit status.
        let error_path = handle.workspace.join(ERROR_FILE);
        if error_path.is_file() {
            let report = fs::read_to_string(&error_path).await.unwrap_or_default();
            let first_line = report.lines().next().unwrap_or("agent failed").trim();
            let message = first_line.strip_prefix("ERROR: ").unwrap_or(first_line);
            return Err(anyhow!("{message}"));
        }

        if !status.success() {
            let captured = fs::read_to_string(handle.workspace.join("stderr.log"))
                .await
                .unwrap_or_default();
            let tail = captured.lines().next_back().unwrap_or("").trim();
            if tail.is_empty() {
                bail!("runner exited with {status}");
            }
            bail!("runner exited with {status}: {tail}");
        }

        bail!("no output file generated")
    }

    async fn teardown(&self, handle: &mut WorkerHandle, task_dir: &Path) -> Result<()> {
        if let Some(child) = handle.child.as_mut() {
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        workspace::copy_dir_recursive(&handle.workspace, task_dir)
            .await
            .context("failed to preserve worker artifacts")?;

        fs::remove_dir_all(&handle.workspace)
            .await
            .context("failed to remove scratch directory")?;
        Ok(())
    }
}
