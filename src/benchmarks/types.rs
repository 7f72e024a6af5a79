//! Core types shared by the benchmark abstraction and the task runners
//!
//! A benchmark dataset is a mapping from task ID to [`Task`]. The harness
//! never interprets task payloads: a payload travels opaquely from the
//! dataset through `input.json` into the agent process, and whatever the
//! agent returns travels back the same way. The only payload keys the
//! harness itself looks at are `files` (extra resources to materialize in
//! the worker's working directory) and `gpu` (used to warn when a GPU task
//! runs outside a VM).
//!
//! # Examples
//!
//! ```
//! use newt::benchmarks::types::Task;
//! use serde_json::json;
//!
//! let task = Task::from_payload(json!({
//!     "statement": "Sort the list",
//!     "files": {"data/input.txt": "/datasets/sort/input.txt"},
//! }));
//!
//! assert_eq!(task.files().len(), 1);
//! assert!(!task.requires_gpu());
//! ```

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A benchmark dataset: task ID to task, iteration in task-ID order.
///
/// Iteration order carries no meaning for correctness; the dispatcher may
/// complete tasks in any order. A `BTreeMap` keeps runs reproducible when
/// `max_tasks` truncates the dataset.
pub type Dataset = BTreeMap<String, Task>;

/// One entry of a benchmark dataset.
///
/// The payload is handed to the agent verbatim (wrapped as
/// `{task_id: payload}` in the worker's `input.json`). Task-level resources
/// declared under a `files` key stay inside the payload *and* are
/// materialized into the worker's working directory before launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Raw task payload, exactly as the benchmark provided it.
    pub payload: Value,
}

impl Task {
    /// Wrap a raw payload value as a task.
    pub fn from_payload(payload: Value) -> Self {
        Self { payload }
    }

    /// Extra files the worker must see, as `logical path -> host path`.
    ///
    /// Read from the payload's `files` key when present. Logical paths are
    /// later stripped of any absolute prefix so they always land inside the
    /// worker's working directory.
    pub fn files(&self) -> BTreeMap<String, PathBuf> {
        let mut files = BTreeMap::new();
        if let Some(map) = self.payload.get("files").and_then(Value::as_object) {
            for (dest, src) in map {
                if let Some(src) = src.as_str() {
                    files.insert(dest.clone(), PathBuf::from(src));
                }
            }
        }
        files
    }

    /// Whether the payload flags this task as needing a GPU.
    pub fn requires_gpu(&self) -> bool {
        self.payload
            .get("gpu")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

impl Serialize for Task {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.payload.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Task {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Task::from_payload(Value::deserialize(deserializer)?))
    }
}

/// Terminal result classification for one task.
///
/// The submissions log stores plain JSON values; errors and timeouts are
/// encoded as strings with well-known prefixes so continuation runs can
/// classify past outcomes without a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The agent returned a value.
    Success,
    /// The worker or agent failed; the value is `"ERROR: <message>"`.
    Error,
    /// The wall-clock deadline expired; the value is
    /// `"TIMEOUT after <N> seconds"`.
    Timeout,
}

impl OutcomeKind {
    /// Classify a submissions-log value.
    ///
    /// # Examples
    ///
    /// ```
    /// use newt::benchmarks::types::OutcomeKind;
    /// use serde_json::json;
    ///
    /// assert_eq!(OutcomeKind::of(&json!("ERROR: boom")), OutcomeKind::Error);
    /// assert_eq!(OutcomeKind::of(&json!("TIMEOUT after 5 seconds")), OutcomeKind::Timeout);
    /// assert_eq!(OutcomeKind::of(&json!({"answer": 42})), OutcomeKind::Success);
    /// ```
    pub fn of(value: &Value) -> Self {
        match value.as_str() {
            Some(s) if s.starts_with("ERROR") => OutcomeKind::Error,
            Some(s) if s.starts_with("TIMEOUT") => OutcomeKind::Timeout,
            _ => OutcomeKind::Success,
        }
    }
}

/// Whether a submissions-log value records a failed attempt.
///
/// Timeouts are terminal, not errors: a continuation run retries errored
/// tasks but does not re-run timed-out ones.
pub fn is_error_value(value: &Value) -> bool {
    OutcomeKind::of(value) == OutcomeKind::Error
}

/// Build the error value recorded for a failed task.
pub fn error_value(message: impl std::fmt::Display) -> Value {
    Value::String(format!("ERROR: {message}"))
}

/// Build the timeout value recorded for an expired task.
pub fn timeout_value(timeout_secs: u64) -> Value {
    Value::String(format!("TIMEOUT after {timeout_secs} seconds"))
}
