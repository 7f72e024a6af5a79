//! Remote VM transport
//!
//! Provisions one cloud VM per task through the `az` CLI, ships the agent
//! directory and a staging directory (inputs, args, setup script) over SSH
//! as compressed archives, launches the runner detached from the control
//! channel, and streams the trace log back on every poll cycle. Teardown
//! fetches the VM's home directory for post-mortems and then deletes the
//! VM and its network resources, each step guarded so one failure does not
//! prevent the others.
//!
//! Cloud credentials and key paths are read from the environment once, at
//! transport construction, and never re-read.

use crate::benchmarks::types::Task;
use crate::errors::HarnessError;
use crate::runner::retry::RetryPolicy;
use crate::runner::workspace::{self, ERROR_FILE, OUTPUT_FILE};
use crate::runner::{AgentSpec, WorkerHandle, WorkerTransport, script};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use uuid::Uuid;

/// Sentinel written by cloud-init when first-boot configuration finishes.
const BOOT_SENTINEL: &str = "/var/lib/cloud/instance/boot-finished";

/// Trace file the runner's stdout/stderr redirect to on the VM.
const TRACE_FILE: &str = "agent_trace.log";

/// Settings for the VM transport, resolved from the environment at
/// construction.
#[derive(Debug, Clone)]
pub struct VmSettings {
    pub resource_group: String,
    pub subscription_id: Option<String>,
    pub location: Option<String>,
    pub ssh_public_key_path: PathBuf,
    pub ssh_private_key_path: PathBuf,
    pub network_security_group: String,
    pub username: String,
    pub vm_size: String,
    pub image: String,
    /// Hard cap on waiting for the first-boot sentinel.
    pub provision_timeout: Duration,
    /// Skip VM deletion in teardown, for debugging.
    pub keep_on_failure: bool,
}

impl VmSettings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self, HarnessError> {
        Self::from_map(&std::env::vars().collect())
    }

    /// Read settings from an explicit variable map.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, HarnessError> {
        let required = |name: &str| -> Result<String, HarnessError> {
            vars.get(name)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| HarnessError::MissingEnvironment {
                    name: name.to_string(),
                    mode: "vm".to_string(),
                })
        };

        Ok(Self {
            resource_group: required("AZURE_RESOURCE_GROUP")?,
            subscription_id: vars.get("AZURE_SUBSCRIPTION_ID").cloned(),
            location: vars.get("AZURE_LOCATION").cloned(),
            ssh_public_key_path: PathBuf::from(required("SSH_PUBLIC_KEY_PATH")?),
            ssh_private_key_path: PathBuf::from(required("SSH_PRIVATE_KEY_PATH")?),
            network_security_group: required("NETWORK_SECURITY_GROUP_NAME")?,
            username: vars
                .get("VM_USERNAME")
                .cloned()
                .unwrap_or_else(|| "agent".to_string()),
            vm_size: vars
                .get("VM_SIZE")
                .cloned()
                .unwrap_or_else(|| "Standard_D4s_v3".to_string()),
            image: vars
                .get("VM_IMAGE")
                .cloned()
                .unwrap_or_else(|| "Ubuntu2204".to_string()),
            provision_timeout: Duration::from_secs(
                vars.get("VM_PROVISION_TIMEOUT_SECS")
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(600),
            ),
            keep_on_failure: vars.get("VM_KEEP_ON_FAILURE").map(String::as_str) == Some("1"),
        })
    }
}

/// One-VM-per-task transport over the `az` CLI and SSH.
pub struct VmTransport {
    settings: VmSettings,
    setup_script: Option<PathBuf>,
    retry: RetryPolicy,
}

impl VmTransport {
    pub fn new(settings: VmSettings, setup_script: Option<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            settings,
            setup_script,
            retry,
        }
    }

    fn vm_name() -> String {
        let name = format!("agent-run-{}", Uuid::new_v4());
        name[..name.len().min(32)].to_lowercase().replace('_', "-")
    }

    fn remote_home(&self) -> String {
        format!("/home/{}", self.settings.username)
    }

    async fn az(&self, args: &[String]) -> Result<std::process::Output> {
        let mut full = args.to_vec();
        if let Some(subscription) = &self.settings.subscription_id {
            full.push("--subscription".into());
            full.push(subscription.clone());
        }
        Command::new("az")
            .args(&full)
            .output()
            .await
            .context("failed to invoke az CLI")
    }

    async fn az_checked(&self, args: &[String]) -> Result<std::process::Output> {
        let output = self.az(args).await?;
        if !output.status.success() {
            return Err(HarnessError::Transport(format!(
                "az {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(output)
    }

    fn ssh_base_args(&self) -> Vec<String> {
        vec![
            "-i".into(),
            self.settings.ssh_private_key_path.display().to_string(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "ConnectTimeout=10".into(),
        ]
    }

    async fn ssh(&self, host: &str, command: &str) -> Result<std::process::Output> {
        let mut args = self.ssh_base_args();
        args.push(format!("{}@{host}", self.settings.username));
        args.push(command.to_string());
        Command::new("ssh")
            .args(&args)
            .output()
            .await
            .context("failed to invoke ssh")
    }

    async fn scp(&self, source: &str, dest: &str) -> Result<()> {
        let mut args = self.ssh_base_args();
        args.push(source.to_string());
        args.push(dest.to_string());
        let output = Command::new("scp")
            .args(&args)
            .output()
            .await
            .context("failed to invoke scp")?;
        if !output.status.success() {
            bail!(
                "scp {source} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Create the VM and return its public address.
    async fn create_vm(&self, vm_name: &str) -> Result<String> {
        let mut args: Vec<String> = [
            "vm",
            "create",
            "--name",
            vm_name,
            "--resource-group",
            &self.settings.resource_group,
            "--image",
            &self.settings.image,
            "--size",
            &self.settings.vm_size,
            "--admin-username",
            &self.settings.username,
            "--nsg",
            &self.settings.network_security_group,
        ]
        .into_iter()
        .map(String::from)
        .collect();

        args.push("--ssh-key-values".into());
        args.push(self.settings.ssh_public_key_path.display().to_string());
        if let Some(location) = &self.settings.location {
            args.push("--location".into());
            args.push(location.clone());
        }

        let output = self.az_checked(&args).await.context("vm create failed")?;
        let created: Value = serde_json::from_slice(&output.stdout)
            .context("vm create returned malformed JSON")?;
        created
            .get("publicIpAddress")
            .and_then(Value::as_str)
            .filter(|ip| !ip.is_empty())
            .map(String::from)
            .ok_or_else(|| anyhow!("vm create returned no public address"))
    }

    /// Wait for cloud-init to finish first-boot configuration.
    async fn wait_for_provisioning(&self, host: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settings.provision_timeout;
        loop {
            if let Ok(output) = self.ssh(host, &format!("test -f {BOOT_SENTINEL}")).await {
                if output.status.success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "VM at {host} did not finish provisioning within {}s",
                    self.settings.provision_timeout.as_secs()
                );
            }
            tokio::time::sleep(Duration::from_secs(15)).await;
        }
    }

    /// Compress, transfer, and extract a directory onto the VM.
    async fn upload_dir(&self, host: &str, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let archive_name = format!("newt-upload-{}.tgz", Uuid::new_v4());
        let archive = std::env::temp_dir().join(&archive_name);
        let tar = Command::new("tar")
            .arg("czf")
            .arg(&archive)
            .arg("-C")
            .arg(local_dir)
            .arg(".")
            .output()
            .await
            .context("failed to invoke tar")?;
        if !tar.status.success() {
            bail!(
                "archiving {} failed: {}",
                local_dir.display(),
                String::from_utf8_lossy(&tar.stderr).trim()
            );
        }

        let remote_archive = format!("/tmp/{archive_name}");
        let upload = self
            .scp(
                &archive.display().to_string(),
                &format!("{}@{host}:{remote_archive}", self.settings.username),
            )
            .await;
        let _ = fs::remove_file(&archive).await;
        upload?;

        let extract = self
            .ssh(
                host,
                &format!("mkdir -p {remote_dir} && tar xzf {remote_archive} -C {remote_dir} && rm -f {remote_archive}"),
            )
            .await?;
        if !extract.status.success() {
            bail!(
                "extracting archive on {host} failed: {}",
                String::from_utf8_lossy(&extract.stderr).trim()
            );
        }
        Ok(())
    }

    /// Compress, transfer, and extract a remote directory back to the host.
    async fn download_dir(&self, host: &str, remote_dir: &str, local_dir: &Path) -> Result<()> {
        let remote_archive = format!("/tmp/newt-download-{}.tgz", Uuid::new_v4());
        let pack = self
            .ssh(host, &format!("tar czf {remote_archive} -C {remote_dir} ."))
            .await?;
        if !pack.status.success() {
            bail!(
                "archiving {remote_dir} on {host} failed: {}",
                String::from_utf8_lossy(&pack.stderr).trim()
            );
        }

        fs::create_dir_all(local_dir).await?;
        let archive = std::env::temp_dir().join(format!("newt-download-{}.tgz", Uuid::new_v4()));
        self.scp(
            &format!("{}@{host}:{remote_archive}", self.settings.username),
            &archive.display().to_string(),
        )
        .await?;
        let _ = self.ssh(host, &format!("rm -f {remote_archive}")).await;

        let untar = Command::new("tar")
            .arg("xzf")
            .arg(&archive)
            .arg("-C")
            .arg(local_dir)
            .output()
            .await
            .context("failed to invoke tar")?;
        let _ = fs::remove_file(&archive).await;
        if !untar.status.success() {
            bail!(
                "extracting downloaded archive failed: {}",
                String::from_utf8_lossy(&untar.stderr).trim()
            );
        }
        Ok(())
    }

    /// Read a remote file, fail-silent: absent files read as `None`.
    async fn remote_file_text(&self, host: &str, path: &str) -> Option<String> {
        let output = self.ssh(host, &format!("cat {path}")).await.ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            None
        }
    }

    /// Delete the VM and its network resources, each step guarded.
    async fn delete_vm(&self, vm_name: &str) {
        let rg = self.settings.resource_group.clone();
        let deletions: [Vec<String>; 4] = [
            vec!["vm".into(), "delete".into(), "--yes".into(), "-g".into(), rg.clone(), "-n".into(), vm_name.into()],
            vec!["network".into(), "nic".into(), "delete".into(), "-g".into(), rg.clone(), "-n".into(), format!("{vm_name}VMNic")],
            vec!["network".into(), "public-ip".into(), "delete".into(), "-g".into(), rg.clone(), "-n".into(), format!("{vm_name}PublicIP")],
            vec!["network".into(), "vnet".into(), "delete".into(), "-g".into(), rg, "-n".into(), format!("{vm_name}VNET")],
        ];

        for args in deletions {
            match self.az(&args).await {
                Ok(output) if !output.status.success() => {
                    tracing::warn!(
                        "Cleanup step az {} {} for {vm_name} failed: {}",
                        args[0],
                        args.get(1).map(String::as_str).unwrap_or(""),
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Err(err) => {
                    tracing::warn!("Cleanup step for {vm_name} failed: {err:#}");
                }
                Ok(_) => {}
            }
        }
    }
}

#[async_trait]
impl WorkerTransport for VmTransport {
    async fn prepare(
        &self,
        task_id: &str,
        task: &Task,
        agent: &AgentSpec,
    ) -> Result<WorkerHandle> {
        let staging = workspace::create_scratch_dir("agent-staging").await?;
        workspace::stage_inputs(&staging, task_id, task, agent).await?;
        if let Some(setup) = &self.setup_script {
            if setup.is_file() {
                fs::copy(setup, staging.join("setup_script.sh"))
                    .await
                    .context("failed to stage setup script")?;
            }
        }

        let vm_name = Self::vm_name();
        tracing::info!("Creating VM {vm_name} for task {task_id}");
        let host = match self.retry.run("vm create", || self.create_vm(&vm_name)).await {
            Ok(host) => host,
            Err(err) => {
                // A failed create can still leave network resources behind
                self.delete_vm(&vm_name).await;
                return Err(err);
            }
        };

        let home = self.remote_home();
        let provisioned: Result<()> = async {
            self.wait_for_provisioning(&host).await?;
            self.retry
                .run("agent directory transfer", || {
                    self.upload_dir(&host, &agent.directory, &home)
                })
                .await?;
            self.retry
                .run("staging directory transfer", || {
                    self.upload_dir(&host, &staging, &home)
                })
                .await
        }
        .await;

        if let Err(err) = provisioned {
            if self.settings.keep_on_failure {
                tracing::info!("Keeping failed VM {vm_name} for debugging (VM_KEEP_ON_FAILURE=1)");
            } else {
                self.delete_vm(&vm_name).await;
            }
            return Err(err);
        }

        // Environment setup runs synchronously; failures here are logged,
        // the runner may still succeed with the base image.
        let setup_cmd = format!(
            "cd {home} && if [ -f requirements.txt ]; then pip install -r requirements.txt >> setup.log 2>&1; fi && if [ -f setup_script.sh ]; then bash setup_script.sh >> setup.log 2>&1; fi"
        );
        if let Ok(output) = self.ssh(&host, &setup_cmd).await {
            if !output.status.success() {
                tracing::warn!(
                    "Environment setup on {vm_name} exited with {}",
                    output.status
                );
            }
        }

        let mut handle = WorkerHandle::new(task_id, staging);
        handle.worker_name = vm_name;
        handle.host = Some(host);
        Ok(handle)
    }

    async fn start(&self, handle: &mut WorkerHandle, runner_script: &str) -> Result<()> {
        let host = handle.host.clone().context("worker has no address")?;
        let home = self.remote_home();

        let script_path = handle.workspace.join(script::SCRIPT_NAME);
        fs::write(&script_path, runner_script)
            .await
            .context("failed to write runner script")?;
        self.scp(
            &script_path.display().to_string(),
            &format!("{}@{host}:{home}/{}", self.settings.username, script::SCRIPT_NAME),
        )
        .await?;

        // Detached from the control channel so the runner survives the SSH
        // session closing; all output goes to the remote trace file.
        let launch = format!(
            "cd {home} && nohup python {} > {TRACE_FILE} 2>&1 < /dev/null &",
            script::SCRIPT_NAME
        );
        let output = self.ssh(&host, &launch).await?;
        if !output.status.success() {
            bail!(
                "launching runner on {} failed: {}",
                handle.worker_name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn poll(&self, handle: &mut WorkerHandle) -> Result<Option<Value>> {
        let host = handle.host.clone().context("worker has no address")?;
        let home = self.remote_home();

        if let Some(raw) = self.remote_file_text(&host, &format!("{home}/{OUTPUT_FILE}")).await {
            let output: Value =
                serde_json::from_str(&raw).context("worker wrote malformed output.json")?;
            return Ok(Some(output));
        }

        if let Some(report) = self.remote_file_text(&host, &format!("{home}/{ERROR_FILE}")).await {
            let first_line = report.lines().next().unwrap_or("agent failed").trim();
            let message = first_line.strip_prefix("ERROR: ").unwrap_or(first_line);
            return Err(anyhow!("{message}"));
        }

        Ok(None)
    }

    async fn fetch_trace(&self, handle: &mut WorkerHandle) -> Result<Option<String>> {
        let host = handle.host.clone().context("worker has no address")?;
        let trace = self
            .remote_file_text(&host, &format!("{}/{TRACE_FILE}", self.remote_home()))
            .await
            .filter(|text| !text.is_empty());
        Ok(trace)
    }

    async fn teardown(&self, handle: &mut WorkerHandle, task_dir: &Path) -> Result<()> {
        if let Some(host) = handle.host.clone() {
            if let Err(err) = self.download_dir(&host, &self.remote_home(), task_dir).await {
                tracing::warn!(
                    "Failed to fetch artifacts from {}: {err:#}",
                    handle.worker_name
                );
            }
        }

        if let Err(err) = fs::remove_dir_all(&handle.workspace).await {
            tracing::warn!("Failed to remove staging directory: {err}");
        }

        if self.settings.keep_on_failure {
            tracing::info!(
                "Keeping VM {} for debugging (VM_KEEP_ON_FAILURE=1)",
                handle.worker_name
            );
        } else {
            tracing::info!("Deleting VM {}", handle.worker_name);
            self.delete_vm(&handle.worker_name).await;
        }
        Ok(())
    }
}
