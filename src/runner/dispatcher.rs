//! Bounded-parallel task dispatcher
//!
//! Drives every task of a dataset through the worker lifecycle under a
//! counting semaphore, records exactly one terminal outcome per task in
//! the submissions log, and emits progress events as tasks finish.
//!
//! # Scheduling Model
//!
//! One cooperative control plane: each task is a spawned future that holds
//! a semaphore permit from before `prepare` until after `teardown`, so at
//! most `max_concurrent` workers exist at any instant. Within one task the
//! lifecycle is strictly ordered; across tasks there is no ordering at all
//! — the submissions log reflects completion order.
//!
//! # Failure Isolation
//!
//! Nothing a task does can abort its siblings. Provisioning failures are
//! retried and then recorded as that task's `ERROR` result; agent failures
//! and timeouts likewise become terminal results rather than harness
//! errors. Teardown always runs, and teardown failures are logged, never
//! surfaced.
//!
//! # Cancellation
//!
//! A cancelled token stops admission: tasks still waiting on the semaphore
//! return without running and without a log line, while in-flight tasks
//! run to their natural completion or timeout.

use crate::benchmarks::types::{Dataset, OutcomeKind, Task, error_value, timeout_value};
use crate::runner::retry::RetryPolicy;
use crate::runner::{AgentSpec, WorkerTransport, script};
use crate::store::SubmissionStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Dispatcher tuning knobs.
///
/// # Examples
///
/// ```
/// use newt::runner::DispatchConfig;
/// use std::time::Duration;
///
/// let config = DispatchConfig {
///     max_concurrent: 10,
///     task_timeout: Duration::from_secs(3600),
///     ..Default::default()
/// };
/// assert_eq!(config.poll_interval, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of in-flight workers.
    pub max_concurrent: usize,

    /// Per-task wall-clock deadline, measured from runner launch.
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Delay between completion polls.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            task_timeout: Duration::from_secs(7200),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Progress events emitted while a dispatch runs.
///
/// Sent through an unbounded channel so the dispatcher never blocks on a
/// slow consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ProgressEvent {
    /// Dispatch began.
    RunStarted { run_id: String, total_tasks: usize },

    /// A task acquired a worker slot.
    TaskStarted { task_id: String },

    /// A task reached a terminal state.
    TaskCompleted {
        task_id: String,
        /// `"success"`, `"error"`, or `"timeout"`.
        outcome: String,
        duration_ms: u64,
        completed: usize,
        total_tasks: usize,
    },

    /// All admitted tasks reached terminal states.
    RunCompleted {
        run_id: String,
        completed: usize,
        errored: usize,
        timed_out: usize,
        duration_ms: u64,
    },
}

/// Semaphore-bounded scheduler over one worker transport.
pub struct Dispatcher {
    transport: Arc<dyn WorkerTransport>,
    store: Arc<SubmissionStore>,
    config: DispatchConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn WorkerTransport>,
        store: Arc<SubmissionStore>,
        config: DispatchConfig,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            retry,
            cancel,
            progress: None,
        }
    }

    /// Attach a progress event sink.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }

    /// Run every task of `dataset` to a terminal state.
    ///
    /// Returns the mapping of task ID to terminal result for every task
    /// that was admitted (cancellation can leave tasks unadmitted; those
    /// appear in neither the map nor the log). The submissions log gains
    /// exactly one line per admitted task, in completion order.
    pub async fn dispatch(
        &self,
        dataset: Dataset,
        agent: Arc<AgentSpec>,
        run_id: &str,
    ) -> Result<BTreeMap<String, Value>> {
        let total_tasks = dataset.len();
        let dispatch_start = Instant::now();
        self.emit(ProgressEvent::RunStarted {
            run_id: run_id.to_string(),
            total_tasks,
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(total_tasks);
        for (task_id, task) in dataset {
            let transport = Arc::clone(&self.transport);
            let store = Arc::clone(&self.store);
            let agent = Arc::clone(&agent);
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let cancel = self.cancel.clone();
            let progress = self.progress.clone();
            let config = self.config.clone();
            let retry = self.retry.clone();
            let run_id = run_id.to_string();

            let handle = tokio::spawn(async move {
                // Admission: racing the permit against cancellation is what
                // lets shutdown drain in-flight work without starting more.
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return None,
                    },
                };
                if cancel.is_cancelled() {
                    return None;
                }

                if let Some(progress) = &progress {
                    let _ = progress.send(ProgressEvent::TaskStarted {
                        task_id: task_id.clone(),
                    });
                }
                tracing::info!("Starting task {task_id}");
                let task_start = Instant::now();

                let result = run_task(
                    transport.as_ref(),
                    &store,
                    &config,
                    &retry,
                    &agent,
                    &run_id,
                    &task_id,
                    &task,
                )
                .await;

                if let Err(err) = store.append(&task_id, &result).await {
                    tracing::error!("Failed to record result for task {task_id}: {err:#}");
                }

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                let outcome = match OutcomeKind::of(&result) {
                    OutcomeKind::Success => "success",
                    OutcomeKind::Error => "error",
                    OutcomeKind::Timeout => "timeout",
                };
                tracing::info!("Completed task {task_id} ({outcome}, {done}/{total_tasks})");
                if let Some(progress) = &progress {
                    let _ = progress.send(ProgressEvent::TaskCompleted {
                        task_id: task_id.clone(),
                        outcome: outcome.to_string(),
                        duration_ms: task_start.elapsed().as_millis() as u64,
                        completed: done,
                        total_tasks,
                    });
                }

                drop(permit);
                Some((task_id, result))
            });
            handles.push(handle);
        }

        let mut results = BTreeMap::new();
        for outcome in futures::future::join_all(handles).await {
            match outcome {
                Ok(Some((task_id, result))) => {
                    results.insert(task_id, result);
                }
                Ok(None) => {} // not admitted before cancellation
                Err(err) => {
                    tracing::error!("Task routine panicked: {err:#}");
                }
            }
        }

        let mut errored = 0usize;
        let mut timed_out = 0usize;
        for result in results.values() {
            match OutcomeKind::of(result) {
                OutcomeKind::Error => errored += 1,
                OutcomeKind::Timeout => timed_out += 1,
                OutcomeKind::Success => {}
            }
        }
        self.emit(ProgressEvent::RunCompleted {
            run_id: run_id.to_string(),
            completed: results.len(),
            errored,
            timed_out,
            duration_ms: dispatch_start.elapsed().as_millis() as u64,
        });

        Ok(results)
    }
}

/// Drive one task through its worker lifecycle to a terminal result.
///
/// Never fails: every failure mode collapses into an `ERROR` or `TIMEOUT`
/// result value. Teardown always runs once a worker was provisioned.
#[allow(clippy::too_many_arguments)]
async fn run_task(
    transport: &dyn WorkerTransport,
    store: &SubmissionStore,
    config: &DispatchConfig,
    retry: &RetryPolicy,
    agent: &AgentSpec,
    run_id: &str,
    task_id: &str,
    task: &Task,
) -> Value {
    let mut handle = match retry
        .run("worker provisioning", || {
            transport.prepare(task_id, task, agent)
        })
        .await
    {
        Ok(handle) => handle,
        Err(err) => return error_value(format!("{err:#}")),
    };

    let outcome = match script::generate(run_id, task_id, agent) {
        Ok(runner_script) => match transport.start(&mut handle, &runner_script).await {
            Ok(()) => {
                let deadline = Instant::now() + config.task_timeout;
                loop {
                    match transport.fetch_trace(&mut handle).await {
                        Ok(Some(trace)) => {
                            if let Err(err) = store.write_trace(task_id, &trace).await {
                                tracing::warn!("Failed to store trace for {task_id}: {err:#}");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::debug!("Trace fetch failed for {task_id}: {err:#}");
                        }
                    }

                    match transport.poll(&mut handle).await {
                        Ok(Some(output)) => break extract_result(task_id, output),
                        Ok(None) => {}
                        Err(err) => break error_value(format!("{err:#}")),
                    }

                    if Instant::now() >= deadline {
                        break timeout_value(config.task_timeout.as_secs());
                    }
                    tokio::time::sleep(config.poll_interval).await;
                }
            }
            Err(err) => error_value(format!("{err:#}")),
        },
        Err(err) => error_value(err),
    };

    if let Err(err) = transport.teardown(&mut handle, &store.task_dir(task_id)).await {
        tracing::warn!("Teardown failed for task {task_id}: {err:#}");
    }

    outcome
}

/// Pull this task's value out of the worker's output mapping.
///
/// Agents return `{task_id: result}`; a worker that wrote anything else
/// has its whole output taken verbatim rather than dropped.
fn extract_result(task_id: &str, output: Value) -> Value {
    match output {
        Value::Object(ref map) if map.contains_key(task_id) => map[task_id].clone(),
        other => other,
    }
}
