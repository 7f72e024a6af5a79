//! Per-run artifact store
//!
//! Owns the on-disk layout of one run: the append-only submissions log,
//! per-task artifact directories, streamed trace files, and the final
//! upload bundle.
//!
//! # Directory Structure
//!
//! ```text
//! results/<benchmark>/<run_id>/
//! ├── <run_id>_RAW_SUBMISSIONS.jsonl   # append-only terminal outcomes
//! ├── <task_id>/                       # worker artifacts, post-terminal
//! ├── agent_logs/
//! │   ├── <task_id>_log.log            # latest streamed trace (VM mode)
//! │   └── combined_logs.log            # all traces, appended with headers
//! └── <run_id>_UPLOAD.json             # finalized results bundle
//! ```
//!
//! # Crash Safety
//!
//! The submissions log is the source of truth for what has been tried.
//! Appends are serialized through an in-process mutex and issued as a
//! single write to a file opened in append mode, so a line either lands
//! whole (with its trailing newline) or not at all. Readers skip malformed
//! lines — a truncated tail from a crash costs one task, not the run.
//! Newline-delimited JSON was chosen over a database: runs span hours, the
//! process may die at any time, and the log doubles as a human-readable
//! record.
//!
//! # Examples
//!
//! ```rust,ignore
//! use newt::store::SubmissionStore;
//! use serde_json::json;
//!
//! let store = SubmissionStore::new("results/demo/run-1", "run-1");
//! store.append("task-1", &json!({"answer": 42})).await?;
//!
//! let done = store.completed_task_ids().await?;
//! assert!(done.contains("task-1"));
//! ```

use crate::benchmarks::types::is_error_value;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Suffix of the submissions log file name.
const RAW_SUBMISSIONS_SUFFIX: &str = "_RAW_SUBMISSIONS.jsonl";

/// Suffix of the upload bundle file name.
const UPLOAD_SUFFIX: &str = "_UPLOAD.json";

/// Append-only artifact store for one run.
pub struct SubmissionStore {
    run_dir: PathBuf,
    run_id: String,
    append_lock: Mutex<()>,
}

impl SubmissionStore {
    /// Create a store rooted at `run_dir`.
    ///
    /// Nothing is written until the first append; the run directory is
    /// created lazily so an aborted configuration phase leaves no trace.
    pub fn new(run_dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            run_id: run_id.into(),
            append_lock: Mutex::new(()),
        }
    }

    /// The run directory this store writes under.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Path of the submissions log.
    pub fn submissions_path(&self) -> PathBuf {
        self.run_dir
            .join(format!("{}{}", self.run_id, RAW_SUBMISSIONS_SUFFIX))
    }

    /// Path of the finalized upload bundle.
    pub fn upload_path(&self) -> PathBuf {
        self.run_dir.join(format!("{}{}", self.run_id, UPLOAD_SUFFIX))
    }

    /// Per-task artifact directory (not created here; the transport's
    /// teardown copies the worker's scratch space into it).
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.run_dir.join(task_id)
    }

    /// Record a terminal outcome for one task.
    ///
    /// Atomic at line granularity: the serialized `{task_id: result}` line
    /// lands in the log whole or not at all. Safe against concurrent
    /// appenders in this process (mutex) and against a continuation run's
    /// separate process (append-mode file handle).
    pub async fn append(&self, task_id: &str, result: &Value) -> Result<()> {
        let mut entry = serde_json::Map::new();
        entry.insert(task_id.to_string(), result.clone());
        let mut line = serde_json::to_string(&Value::Object(entry))
            .context("failed to serialize submission entry")?;
        line.push('\n');

        let _guard = self.append_lock.lock().await;
        fs::create_dir_all(&self.run_dir).await.with_context(|| {
            format!("failed to create run directory {}", self.run_dir.display())
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.submissions_path())
            .await
            .context("failed to open submissions log for append")?;

        file.write_all(line.as_bytes())
            .await
            .context("failed to append to submissions log")?;
        file.flush().await.context("failed to flush submissions log")?;

        Ok(())
    }

    /// All well-formed log entries in file order.
    ///
    /// Malformed lines (a crash can truncate the tail) are skipped with a
    /// warning. A missing log reads as empty.
    pub async fn read_entries(&self) -> Result<Vec<(String, Value)>> {
        let path = self.submissions_path();
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read submissions log {}", path.display()));
            }
        };

        let mut entries = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Map<String, Value>>(line) {
                Ok(map) => {
                    for (task_id, value) in map {
                        entries.push((task_id, value));
                    }
                }
                Err(err) => {
                    tracing::warn!("Skipping malformed line in submissions log: {err}");
                }
            }
        }
        Ok(entries)
    }

    /// Latest recorded result per task ID.
    ///
    /// A task may appear multiple times across continuation runs; the last
    /// occurrence is authoritative.
    pub async fn latest_results(&self) -> Result<BTreeMap<String, Value>> {
        let mut latest = BTreeMap::new();
        for (task_id, value) in self.read_entries().await? {
            latest.insert(task_id, value);
        }
        Ok(latest)
    }

    /// Task IDs whose latest entry is not an error.
    ///
    /// These are the tasks a continuation run skips.
    pub async fn completed_task_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .latest_results()
            .await?
            .into_iter()
            .filter(|(_, value)| !is_error_value(value))
            .map(|(task_id, _)| task_id)
            .collect())
    }

    /// Store the latest streamed trace for a task.
    ///
    /// Overwrites `agent_logs/<task_id>_log.log` with the current snapshot
    /// and appends a timestamped copy to `combined_logs.log`.
    pub async fn write_trace(&self, task_id: &str, trace: &str) -> Result<()> {
        let trace_dir = self.run_dir.join("agent_logs");
        fs::create_dir_all(&trace_dir)
            .await
            .context("failed to create agent_logs directory")?;

        fs::write(trace_dir.join(format!("{task_id}_log.log")), trace)
            .await
            .context("failed to write task trace file")?;

        let header = format!(
            "\n=== {task_id} @ {} ===\n",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let mut combined = OpenOptions::new()
            .create(true)
            .append(true)
            .open(trace_dir.join("combined_logs.log"))
            .await
            .context("failed to open combined trace log")?;
        combined.write_all(header.as_bytes()).await?;
        combined.write_all(trace.as_bytes()).await?;
        combined.write_all(b"\n").await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SubmissionStore {
        SubmissionStore::new(dir.path().join("run-1"), "run-1")
    }

    #[tokio::test]
    async fn test_append_and_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.append("a", &json!({"answer": 1})).await.unwrap();
        store.append("b", &json!("ERROR: boom")).await.unwrap();

        let entries = store.read_entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("a".to_string(), json!({"answer": 1})));
        assert_eq!(entries[1], ("b".to_string(), json!("ERROR: boom")));
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.read_entries().await.unwrap().is_empty());
        assert!(store.completed_task_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_dir_created_lazily() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(!store.run_dir().exists());
        store.append("a", &json!("ok")).await.unwrap();
        assert!(store.run_dir().exists());
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.append("a", &json!("fine")).await.unwrap();
        // Simulate a crash mid-append
        let mut raw = std::fs::read_to_string(store.submissions_path()).unwrap();
        raw.push_str("{\"b\": \"trunc");
        std::fs::write(store.submissions_path(), raw).unwrap();

        let entries = store.read_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a");
    }

    #[tokio::test]
    async fn test_latest_occurrence_wins() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.append("a", &json!("ERROR: first try")).await.unwrap();
        store.append("b", &json!("fine")).await.unwrap();
        store.append("a", &json!("recovered")).await.unwrap();

        let latest = store.latest_results().await.unwrap();
        assert_eq!(latest["a"], json!("recovered"));

        let completed = store.completed_task_ids().await.unwrap();
        assert!(completed.contains("a"));
        assert!(completed.contains("b"));
    }

    #[tokio::test]
    async fn test_completed_excludes_errors_but_not_timeouts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.append("ok", &json!("done")).await.unwrap();
        store.append("err", &json!("ERROR: agent raised")).await.unwrap();
        store
            .append("slow", &json!("TIMEOUT after 7200 seconds"))
            .await
            .unwrap();

        let completed = store.completed_task_ids().await.unwrap();
        assert!(completed.contains("ok"));
        assert!(completed.contains("slow"));
        assert!(!completed.contains("err"));
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_line_atomic() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&dir));

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append(&format!("task-{i}"), &json!({"i": i}))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = store.read_entries().await.unwrap();
        assert_eq!(entries.len(), 32);
    }

    #[tokio::test]
    async fn test_trace_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.write_trace("t1", "step 1").await.unwrap();
        store.write_trace("t1", "step 1\nstep 2").await.unwrap();

        let per_task = std::fs::read_to_string(
            store.run_dir().join("agent_logs").join("t1_log.log"),
        )
        .unwrap();
        assert_eq!(per_task, "step 1\nstep 2");

        let combined = std::fs::read_to_string(
            store.run_dir().join("agent_logs").join("combined_logs.log"),
        )
        .unwrap();
        assert_eq!(combined.matches("=== t1 @").count(), 2);
    }
}
