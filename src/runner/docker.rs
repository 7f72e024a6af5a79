//! Docker container transport
//!
//! One container per task, created from a fixed image and kept alive with
//! an idle command while the harness copies the workspace in, runs setup,
//! and launches the runner. All container interaction goes through the
//! docker CLI; the daemon socket stays an implementation detail of that
//! binary.
//!
//! Host environment variables from `.env` are injected into the runner's
//! exec so agents see the same credentials they would locally.

use crate::benchmarks::types::Task;
use crate::errors::HarnessError;
use crate::runner::workspace::{self, ERROR_FILE, OUTPUT_FILE};
use crate::runner::{AgentSpec, WorkerHandle, WorkerTransport, script};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use uuid::Uuid;

/// Tracing package installed into the container's environment.
const TRACING_PACKAGE: &str = "weave==0.51.41";

/// Name of the Python environment created inside each container.
const CONTAINER_ENV: &str = "agent_env";

/// Container workspace the runner executes in.
const CONTAINER_WORKSPACE: &str = "/workspace";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image every task container is created from.
    pub image: String,
    /// Python version for the in-container environment.
    pub python_version: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "newt-agent-runner:latest".to_string(),
            python_version: "3.12".to_string(),
        }
    }
}

/// Container-per-task transport driven through the docker CLI.
pub struct DockerTransport {
    config: DockerConfig,
    setup_script: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
}

impl DockerTransport {
    /// Create the transport, snapshotting `.env` for exec injection.
    pub fn new(config: DockerConfig, setup_script: Option<PathBuf>) -> Self {
        let mut env_vars = Vec::new();
        if let Ok(iter) = dotenvy::from_filename_iter(".env") {
            env_vars.extend(iter.flatten());
        }
        Self {
            config,
            setup_script,
            env_vars,
        }
    }

    fn container_name() -> String {
        let name = format!("agent-run-{}", Uuid::new_v4());
        name[..name.len().min(32)].to_lowercase().replace('_', "-")
    }

    async fn docker(args: &[&str]) -> Result<std::process::Output> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .context("failed to invoke docker CLI")
    }

    /// Run a docker command and fail on a non-zero exit.
    async fn docker_checked(args: &[&str]) -> Result<std::process::Output> {
        let output = Self::docker(args).await?;
        if !output.status.success() {
            return Err(HarnessError::Transport(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(output)
    }

    /// Run a shell command inside the container, logging failure output.
    async fn exec_logged(&self, container: &str, command: &str) -> Result<()> {
        let output = Self::docker(&["exec", container, "bash", "-c", command]).await?;
        if !output.status.success() {
            tracing::warn!(
                "Container {container}: `{command}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Copy the container workspace back into the scratch directory.
    async fn copy_back(&self, handle: &WorkerHandle) -> Result<()> {
        Self::docker_checked(&[
            "cp",
            &format!("{}:{CONTAINER_WORKSPACE}/.", handle.worker_name),
            handle.workspace.to_str().context("scratch path is not UTF-8")?,
        ])
        .await?;
        Ok(())
    }

    /// Whether `path` exists inside the container.
    async fn remote_file_exists(&self, container: &str, path: &str) -> Result<bool> {
        let output = Self::docker(&["exec", container, "test", "-f", path]).await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl WorkerTransport for DockerTransport {
    async fn prepare(
        &self,
        task_id: &str,
        task: &Task,
        agent: &AgentSpec,
    ) -> Result<WorkerHandle> {
        let scratch = workspace::create_scratch_dir("agent-run").await?;
        workspace::stage(&scratch, task_id, task, agent).await?;

        let container = Self::container_name();
        Self::docker_checked(&[
            "run",
            "-d",
            "--name",
            &container,
            &self.config.image,
            "tail",
            "-f",
            "/dev/null",
        ])
        .await
        .context("failed to start task container")?;

        let mut handle = WorkerHandle::new(task_id, scratch);
        handle.worker_name = container.clone();

        Self::docker_checked(&[
            "cp",
            &format!("{}/.", handle.workspace.display()),
            &format!("{container}:{CONTAINER_WORKSPACE}"),
        ])
        .await
        .context("failed to copy workspace into container")?;

        self.exec_logged(
            &container,
            &format!(
                "conda create -y -n {CONTAINER_ENV} python={}",
                self.config.python_version
            ),
        )
        .await?;

        if handle.workspace.join("requirements.txt").is_file() {
            self.exec_logged(
                &container,
                &format!(
                    "conda run -n {CONTAINER_ENV} pip install -r {CONTAINER_WORKSPACE}/requirements.txt"
                ),
            )
            .await?;
        }

        self.exec_logged(
            &container,
            &format!("conda run -n {CONTAINER_ENV} pip install {TRACING_PACKAGE}"),
        )
        .await?;

        if let Some(setup) = &self.setup_script {
            if setup.is_file() {
                Self::docker_checked(&[
                    "cp",
                    setup.to_str().context("setup script path is not UTF-8")?,
                    &format!("{container}:{CONTAINER_WORKSPACE}/setup_script.sh"),
                ])
                .await?;
                self.exec_logged(&container, &format!("bash {CONTAINER_WORKSPACE}/setup_script.sh"))
                    .await?;
            }
        }

        Ok(handle)
    }

    async fn start(&self, handle: &mut WorkerHandle, runner_script: &str) -> Result<()> {
        let script_path = handle.workspace.join(script::SCRIPT_NAME);
        fs::write(&script_path, runner_script)
            .await
            .context("failed to write runner script")?;

        Self::docker_checked(&[
            "cp",
            script_path.to_str().context("script path is not UTF-8")?,
            &format!("{}:{CONTAINER_WORKSPACE}/{}", handle.worker_name, script::SCRIPT_NAME),
        ])
        .await?;

        let mut args: Vec<String> = vec!["exec".into(), "-d".into(), "-w".into(), CONTAINER_WORKSPACE.into()];
        for (key, value) in &self.env_vars {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(handle.worker_name.clone());
        args.extend(["bash".into(), "-c".into()]);
        args.push(format!(
            "conda run -n {CONTAINER_ENV} python {} > runner.log 2>&1",
            script::SCRIPT_NAME
        ));

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        Self::docker_checked(&arg_refs)
            .await
            .context("failed to launch runner inside container")?;
        Ok(())
    }

    async fn poll(&self, handle: &mut WorkerHandle) -> Result<Option<Value>> {
        let output_file = format!("{CONTAINER_WORKSPACE}/{OUTPUT_FILE}");
        if self.remote_file_exists(&handle.worker_name, &output_file).await? {
            self.copy_back(handle).await?;
            let raw = fs::read_to_string(handle.workspace.join(OUTPUT_FILE))
                .await
                .context("failed to read output.json from workspace")?;
            let output: Value =
                serde_json::from_str(&raw).context("worker wrote malformed output.json")?;
            return Ok(Some(output));
        }

        let error_file = format!("{CONTAINER_WORKSPACE}/{ERROR_FILE}");
        if self.remote_file_exists(&handle.worker_name, &error_file).await? {
            let output =
                Self::docker(&["exec", &handle.worker_name, "cat", &error_file]).await?;
            let report = String::from_utf8_lossy(&output.stdout);
            let first_line = report.lines().next().unwrap_or("agent failed").trim();
            let message = first_line.strip_prefix("ERROR: ").unwrap_or(first_line);
            return Err(anyhow!("{message}"));
        }

        Ok(None)
    }

    async fn teardown(&self, handle: &mut WorkerHandle, task_dir: &Path) -> Result<()> {
        // Best-effort snapshot of whatever the container produced; a timed
        // out task still leaves its partial state for post-mortems.
        if let Err(err) = self.copy_back(handle).await {
            tracing::warn!("Failed to copy container workspace back: {err:#}");
        }

        let preserve = workspace::copy_dir_recursive(&handle.workspace, task_dir)
            .await
            .context("failed to preserve worker artifacts");

        if let Err(err) = fs::remove_dir_all(&handle.workspace).await {
            tracing::warn!("Failed to remove scratch directory: {err}");
        }

        if let Err(err) = Self::docker(&["rm", "-f", &handle.worker_name]).await {
            tracing::warn!("Failed to remove container {}: {err:#}", handle.worker_name);
        }

        preserve
    }
}
