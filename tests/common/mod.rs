//! Shared test doubles for integration tests.
#![allow(dead_code)] // each test binary uses a different slice of this

use async_trait::async_trait;
use newt::benchmarks::Task;
use newt::runner::{AgentSpec, WorkerHandle, WorkerTransport};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// What the mock worker does for one task.
#[derive(Debug, Clone)]
pub enum TaskBehavior {
    /// Worker writes `{task_id: value}` after `delay`.
    Succeed(Value),
    /// Provisioning fails with this message.
    FailPrepare(String),
    /// Worker dies without output; poll reports this message.
    FailPoll(String),
    /// Worker never completes (forces a timeout).
    Hang,
}

/// In-memory transport recording concurrency and lifecycle calls.
pub struct MockTransport {
    behaviors: HashMap<String, TaskBehavior>,
    /// Simulated task duration for `Succeed`.
    pub delay: Duration,
    /// Trace text returned on every `fetch_trace`, when set.
    pub trace: Option<String>,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<HashMap<String, Instant>>,
    torn_down: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(behaviors: impl IntoIterator<Item = (String, TaskBehavior)>) -> Self {
        Self {
            behaviors: behaviors.into_iter().collect(),
            delay: Duration::from_millis(0),
            trace: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(HashMap::new()),
            torn_down: Mutex::new(Vec::new()),
        }
    }

    /// Every task succeeds with the given value after `delay`.
    pub fn all_succeed(task_ids: &[&str], delay: Duration) -> Self {
        let mut transport = Self::new(task_ids.iter().map(|id| {
            (
                id.to_string(),
                TaskBehavior::Succeed(json!(format!("result_{id}"))),
            )
        }));
        transport.delay = delay;
        transport
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> Vec<String> {
        self.torn_down.lock().unwrap().clone()
    }

    fn behavior(&self, task_id: &str) -> TaskBehavior {
        self.behaviors
            .get(task_id)
            .cloned()
            .unwrap_or(TaskBehavior::Hang)
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn prepare(
        &self,
        task_id: &str,
        _task: &Task,
        _agent: &AgentSpec,
    ) -> anyhow::Result<WorkerHandle> {
        if let TaskBehavior::FailPrepare(message) = self.behavior(task_id) {
            anyhow::bail!("{message}");
        }

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        Ok(WorkerHandle::new(task_id, std::env::temp_dir()))
    }

    async fn start(&self, handle: &mut WorkerHandle, _runner_script: &str) -> anyhow::Result<()> {
        self.started
            .lock()
            .unwrap()
            .insert(handle.task_id.clone(), Instant::now());
        Ok(())
    }

    async fn poll(&self, handle: &mut WorkerHandle) -> anyhow::Result<Option<Value>> {
        match self.behavior(&handle.task_id) {
            TaskBehavior::Succeed(value) => {
                let started = self.started.lock().unwrap()[&handle.task_id];
                if started.elapsed() >= self.delay {
                    Ok(Some(json!({handle.task_id.clone(): value})))
                } else {
                    Ok(None)
                }
            }
            TaskBehavior::FailPoll(message) => anyhow::bail!("{message}"),
            TaskBehavior::Hang => Ok(None),
            TaskBehavior::FailPrepare(_) => unreachable!("prepare already failed"),
        }
    }

    async fn fetch_trace(&self, _handle: &mut WorkerHandle) -> anyhow::Result<Option<String>> {
        Ok(self.trace.clone())
    }

    async fn teardown(&self, handle: &mut WorkerHandle, _task_dir: &Path) -> anyhow::Result<()> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.torn_down.lock().unwrap().push(handle.task_id.clone());
        Ok(())
    }
}
