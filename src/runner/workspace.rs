//! Worker workspace staging
//!
//! All three transports assemble the same working directory for a task:
//! the agent's code, `input.json` holding the single-task mapping,
//! `args.json` holding the agent's keyword arguments, and any task-level
//! files materialized at their logical paths. Local and docker stage
//! directly into the scratch directory that becomes the worker's CWD; vm
//! mode stages into a directory that is then shipped over SSH.

use crate::benchmarks::types::Task;
use crate::runner::AgentSpec;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// File the runner script reads the single-task mapping from.
pub const INPUT_FILE: &str = "input.json";

/// File the runner script reads agent keyword arguments from.
pub const ARGS_FILE: &str = "args.json";

/// File the runner script writes the agent's return value to.
pub const OUTPUT_FILE: &str = "output.json";

/// File the runner script writes failure details to.
pub const ERROR_FILE: &str = "error.log";

/// Create a fresh scratch directory under the system temp dir.
///
/// Each worker gets its own; nothing is ever shared across tasks.
pub async fn create_scratch_dir(prefix: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", Uuid::new_v4()));
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create scratch directory {}", dir.display()))?;
    Ok(dir)
}

/// Stage a complete workspace for one task into `dir`.
///
/// Copies the agent directory tree, then stages the task's inputs on top.
pub async fn stage(dir: &Path, task_id: &str, task: &Task, agent: &AgentSpec) -> Result<()> {
    copy_dir_recursive(&agent.directory, dir).await.with_context(|| {
        format!("failed to copy agent directory {}", agent.directory.display())
    })?;

    stage_inputs(dir, task_id, task, agent).await
}

/// Stage only the task's inputs into `dir`: `input.json` as
/// `{task_id: payload}`, `args.json` as the agent's args, and any task
/// files at their logical paths. Failures copying an individual task file
/// are logged and skipped, matching how a worker would behave with a
/// missing optional resource.
///
/// The VM transport ships the agent directory and this staging directory
/// separately; the other transports use [`stage`].
pub async fn stage_inputs(dir: &Path, task_id: &str, task: &Task, agent: &AgentSpec) -> Result<()> {
    let mut input = serde_json::Map::new();
    input.insert(task_id.to_string(), task.payload.clone());
    fs::write(dir.join(INPUT_FILE), serde_json::to_string(&input)?)
        .await
        .context("failed to write input.json")?;

    fs::write(
        dir.join(ARGS_FILE),
        serde_json::to_string(&serde_json::Value::Object(agent.args.clone()))?,
    )
    .await
    .context("failed to write args.json")?;

    materialize_files(dir, &task.files()).await;

    Ok(())
}

/// Copy task files to their logical destinations inside the workspace.
pub async fn materialize_files(dir: &Path, files: &BTreeMap<String, PathBuf>) {
    for (dest, src) in files {
        let dest_full = dir.join(sanitize_dest_path(dest));
        if let Some(parent) = dest_full.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                tracing::warn!("Failed to create directory for task file {dest}: {err}");
                continue;
            }
        }

        let result = if src.is_dir() {
            copy_dir_recursive(src, &dest_full).await
        } else {
            fs::copy(src, &dest_full).await.map(|_| ()).map_err(Into::into)
        };

        if let Err(err) = result {
            tracing::warn!(
                "Failed to copy task file {} to {}: {err}",
                src.display(),
                dest_full.display()
            );
        }
    }
}

/// Make a logical task-file path relative to the workspace.
///
/// Strips a leading `/root/` (datasets commonly record container-absolute
/// paths), any remaining leading slash, and parent-directory components, so
/// the destination always stays inside the worker's working directory.
pub fn sanitize_dest_path(dest: &str) -> PathBuf {
    let trimmed = dest.strip_prefix("/root/").unwrap_or(dest);
    let trimmed = trimmed.trim_start_matches('/');

    Path::new(trimmed)
        .components()
        .filter(|component| matches!(component, Component::Normal(_)))
        .collect()
}

/// Recursively copy a directory tree.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((src, dst)) = stack.pop() {
        fs::create_dir_all(&dst)
            .await
            .with_context(|| format!("failed to create {}", dst.display()))?;

        let mut entries = fs::read_dir(&src)
            .await
            .with_context(|| format!("failed to read {}", src.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let to = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((entry.path(), to));
            } else {
                fs::copy(entry.path(), &to).await.with_context(|| {
                    format!("failed to copy {} to {}", entry.path().display(), to.display())
                })?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ExecutionMode;
    use serde_json::{Map, json};
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_dest_path() {
        assert_eq!(sanitize_dest_path("/root/data/a.csv"), PathBuf::from("data/a.csv"));
        assert_eq!(sanitize_dest_path("/etc/passwd"), PathBuf::from("etc/passwd"));
        assert_eq!(sanitize_dest_path("plain/rel.txt"), PathBuf::from("plain/rel.txt"));
        assert_eq!(sanitize_dest_path("../../escape.txt"), PathBuf::from("escape.txt"));
    }

    #[tokio::test]
    async fn test_copy_dir_recursive() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("nested/deep")).unwrap();
        std::fs::write(src.path().join("top.txt"), "top").unwrap();
        std::fs::write(src.path().join("nested/deep/leaf.txt"), "leaf").unwrap();

        let dst = TempDir::new().unwrap();
        copy_dir_recursive(src.path(), dst.path()).await.unwrap();

        assert_eq!(std::fs::read_to_string(dst.path().join("top.txt")).unwrap(), "top");
        assert_eq!(
            std::fs::read_to_string(dst.path().join("nested/deep/leaf.txt")).unwrap(),
            "leaf"
        );
    }

    #[tokio::test]
    async fn test_stage_workspace() {
        let agent_dir = TempDir::new().unwrap();
        std::fs::write(agent_dir.path().join("main.py"), "def run(): pass").unwrap();

        let resource = TempDir::new().unwrap();
        let resource_path = resource.path().join("data.csv");
        std::fs::write(&resource_path, "1,2,3").unwrap();

        let mut args = Map::new();
        args.insert("model".into(), json!("gpt-4o"));
        let agent = AgentSpec {
            name: "tester".into(),
            entry: "main.run".into(),
            directory: agent_dir.path().to_path_buf(),
            args,
            execution_mode: ExecutionMode::Local,
            environment_name: None,
        };

        let task = Task::from_payload(json!({
            "question": "sum the numbers",
            "files": {"/root/inputs/data.csv": resource_path.to_str().unwrap()},
        }));

        let workspace = TempDir::new().unwrap();
        stage(workspace.path(), "t1", &task, &agent).await.unwrap();

        // agent code copied
        assert!(workspace.path().join("main.py").is_file());

        // input.json wraps the payload under the task id
        let input: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(workspace.path().join(INPUT_FILE)).unwrap())
                .unwrap();
        assert_eq!(input["t1"]["question"], json!("sum the numbers"));

        // args.json carries the agent args
        let args: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(workspace.path().join(ARGS_FILE)).unwrap())
                .unwrap();
        assert_eq!(args["model"], json!("gpt-4o"));

        // task file landed at its sanitized logical path
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("inputs/data.csv")).unwrap(),
            "1,2,3"
        );
    }

    #[tokio::test]
    async fn test_stage_skips_missing_task_files() {
        let agent_dir = TempDir::new().unwrap();
        let agent = AgentSpec {
            name: "tester".into(),
            entry: "main.run".into(),
            directory: agent_dir.path().to_path_buf(),
            args: Map::new(),
            execution_mode: ExecutionMode::Local,
            environment_name: None,
        };

        let task = Task::from_payload(json!({
            "files": {"missing.txt": "/no/such/source/file"},
        }));

        let workspace = TempDir::new().unwrap();
        // missing sources are warnings, not failures
        stage(workspace.path(), "t1", &task, &agent).await.unwrap();
        assert!(!workspace.path().join("missing.txt").exists());
    }

    #[tokio::test]
    async fn test_create_scratch_dirs_are_unique() {
        let a = create_scratch_dir("newt-test").await.unwrap();
        let b = create_scratch_dir("newt-test").await.unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        let _ = std::fs::remove_dir_all(&a);
        let _ = std::fs::remove_dir_all(&b);
    }
}
