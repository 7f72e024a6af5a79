//! Benchmark abstraction
//!
//! A benchmark is an opaque provider of three things: a task dataset, an
//! output scorer, and a metrics aggregator. The harness drives agents over
//! the dataset and hands the collected outputs back for scoring; it never
//! inspects task semantics itself.
//!
//! # Module Structure
//!
//! - [`types`]: Dataset and task types plus result-value helpers
//! - [`file`]: JSON-file-backed benchmark adapter
//!
//! # Examples
//!
//! ```rust,ignore
//! use newt::benchmarks::get_benchmark;
//! use serde_json::Map;
//!
//! let mut args = Map::new();
//! args.insert("dataset_path".into(), "tasks/algebra.json".into());
//! let benchmark = get_benchmark("algebra", "results", &args)?;
//!
//! let dataset = benchmark.get_dataset()?;
//! println!("{} tasks", dataset.len());
//! ```

use crate::errors::HarnessError;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub mod file;
pub mod types;

pub use file::FileBenchmark;
pub use types::{Dataset, OutcomeKind, Task};

/// An evaluation report returned by a benchmark's scorer.
///
/// Benchmarks may embed arbitrary structures in their reports; the finalizer
/// serializes whatever it gets. When serialization fails the report is
/// written in a lossy form carrying a `_type` tag and the debug rendering,
/// so a run's bundle always lands on disk.
///
/// Implemented automatically for every `Serialize + Debug` type.
pub trait EvalReport: Send + std::fmt::Debug {
    fn to_json(&self) -> Result<Value, serde_json::Error>;
    fn type_label(&self) -> &'static str;
}

impl<T> EvalReport for T
where
    T: Serialize + Send + std::fmt::Debug,
{
    fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn type_label(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Interface between the harness core and a benchmark.
///
/// The harness calls these in a fixed order: `get_dataset` before dispatch,
/// `evaluate_output` once every task has reached a terminal state, and
/// `get_metrics` on the scorer's report. `get_run_dir` may be called at any
/// point and creates the directory on first use.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: the dispatcher shares the
/// benchmark across concurrently running task routines.
#[async_trait]
pub trait Benchmark: Send + Sync {
    /// Benchmark name, used as the results directory component.
    fn name(&self) -> &str;

    /// Whether this benchmark refuses to run outside a container or VM.
    fn requires_sandbox(&self) -> bool {
        false
    }

    /// Optional setup script executed inside each worker before the agent.
    fn setup_script(&self) -> Option<&Path> {
        None
    }

    /// Load the full task dataset.
    fn get_dataset(&self) -> Result<Dataset>;

    /// Score the collected agent outputs.
    ///
    /// May spawn external scorer processes; the harness only awaits
    /// completion. Scoring failures propagate to the invoker — the
    /// submissions log stays intact so the run can be continued.
    async fn evaluate_output(
        &self,
        agent_output: &BTreeMap<String, Value>,
        run_id: &str,
    ) -> Result<Box<dyn EvalReport>>;

    /// Derive summary metrics from the serialized evaluation report.
    fn get_metrics(&self, eval_results: &Value) -> Result<Map<String, Value>>;

    /// Results directory for one run: `<results>/<benchmark>/<run_id>`,
    /// created if absent.
    fn get_run_dir(&self, run_id: &str) -> Result<PathBuf>;
}

impl std::fmt::Debug for dyn Benchmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Benchmark").field("name", &self.name()).finish()
    }
}

/// Resolve a benchmark by name.
///
/// Any name resolves to a [`FileBenchmark`] as long as the benchmark args
/// carry a `dataset_path`; a name without one is a configuration error.
///
/// # Errors
///
/// Returns [`HarnessError::BenchmarkNotFound`] when no dataset path is
/// given.
pub fn get_benchmark(
    name: &str,
    results_dir: impl AsRef<Path>,
    benchmark_args: &Map<String, Value>,
) -> Result<Box<dyn Benchmark>, HarnessError> {
    let Some(dataset_path) = benchmark_args.get("dataset_path").and_then(Value::as_str) else {
        return Err(HarnessError::BenchmarkNotFound(name.to_string()));
    };

    Ok(Box::new(FileBenchmark::new(
        name,
        dataset_path,
        results_dir.as_ref(),
        benchmark_args,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_benchmark_requires_dataset_path() {
        let err = get_benchmark("mystery", "results", &Map::new()).unwrap_err();
        assert!(matches!(err, HarnessError::BenchmarkNotFound(name) if name == "mystery"));
    }

    #[test]
    fn test_get_benchmark_resolves_file_benchmark() {
        let mut args = Map::new();
        args.insert("dataset_path".into(), json!("tasks.json"));

        let benchmark = get_benchmark("algebra", "results", &args).unwrap();
        assert_eq!(benchmark.name(), "algebra");
        assert!(!benchmark.requires_sandbox());
    }

    #[test]
    fn test_eval_report_blanket_impl() {
        #[derive(Debug, Serialize)]
        struct Report {
            accuracy: f64,
        }

        let report: Box<dyn EvalReport> = Box::new(Report { accuracy: 0.5 });
        assert_eq!(report.to_json().unwrap(), json!({"accuracy": 0.5}));
        assert!(report.type_label().contains("Report"));
    }
}
