//! Continuation filtering
//!
//! Before a continuation run dispatches anything, the submissions log of
//! the previous attempt decides what is left to do. The log is the only
//! source of truth: no other state survives a crash.

use crate::benchmarks::types::Dataset;
use crate::store::SubmissionStore;
use anyhow::Result;
use std::collections::BTreeSet;

/// Drop tasks the previous run already settled.
///
/// With `ignore_errors` false, a task stays in the dataset only if it has
/// never reached a terminal state or its most recent log entry is an
/// error (errored tasks are retried). With `ignore_errors` true, every
/// task that appears in the log at all is dropped — the run commits to
/// never re-running anything seen before.
///
/// A missing log leaves the dataset unchanged.
pub async fn filter_remaining(
    dataset: Dataset,
    store: &SubmissionStore,
    ignore_errors: bool,
) -> Result<Dataset> {
    let entries = store.read_entries().await?;
    if entries.is_empty() {
        tracing::info!("No previous submissions found, running all tasks");
        return Ok(dataset);
    }

    let settled: BTreeSet<String> = if ignore_errors {
        entries.into_iter().map(|(task_id, _)| task_id).collect()
    } else {
        store.completed_task_ids().await?
    };

    let before = dataset.len();
    let remaining: Dataset = dataset
        .into_iter()
        .filter(|(task_id, _)| !settled.contains(task_id))
        .collect();
    tracing::info!(
        "Continuation: {} of {before} tasks remaining",
        remaining.len()
    );

    Ok(remaining)
}

/// Cap the dataset at its first `max_tasks` entries (task-ID order).
///
/// Applied after continuation filtering. `None` leaves the dataset alone;
/// `Some(0)` dispatches nothing.
pub fn apply_max_tasks(dataset: Dataset, max_tasks: Option<usize>) -> Dataset {
    match max_tasks {
        Some(limit) if limit < dataset.len() => {
            tracing::info!("Limiting to the first {limit} tasks as requested");
            dataset.into_iter().take(limit).collect()
        }
        _ => dataset,
    }
}

/// Task IDs still lacking a non-error terminal entry, for the end-of-run
/// incompleteness warning.
pub async fn unfinished_tasks(dataset: &Dataset, store: &SubmissionStore) -> Result<Vec<String>> {
    let completed = store.completed_task_ids().await?;
    Ok(dataset
        .keys()
        .filter(|task_id| !completed.contains(*task_id))
        .cloned()
        .collect())
}
