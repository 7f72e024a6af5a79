//! JSON-file-backed benchmark
//!
//! The simplest useful benchmark: the dataset is a JSON object mapping task
//! IDs to payloads, and scoring is an exact match of the agent's output
//! against each payload's optional `expected` value. Benchmarks with their
//! own scoring harnesses implement [`Benchmark`](super::Benchmark) directly;
//! this adapter covers datasets that need none.

use crate::benchmarks::types::{Dataset, OutcomeKind};
use crate::benchmarks::{Benchmark, EvalReport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Benchmark whose dataset lives in a single JSON file.
///
/// Recognized benchmark args:
///
/// - `dataset_path` (required): path to the dataset JSON
/// - `requires_sandbox` (bool): refuse bare local execution
/// - `setup_script`: path to a script run inside each worker before the
///   agent
pub struct FileBenchmark {
    name: String,
    dataset_path: PathBuf,
    results_dir: PathBuf,
    requires_sandbox: bool,
    setup_script: Option<PathBuf>,
}

/// Per-task scoring entry in the evaluation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvaluation {
    /// What the dataset expected, if it declared anything.
    pub expected: Option<Value>,
    /// What the agent produced (or the ERROR/TIMEOUT marker).
    pub actual: Value,
    /// Match verdict; `None` when the dataset declared no expectation.
    pub correct: Option<bool>,
}

/// Evaluation report produced by [`FileBenchmark::evaluate_output`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvalReport {
    pub run_id: String,
    pub tasks: BTreeMap<String, TaskEvaluation>,
}

impl FileBenchmark {
    pub fn new(
        name: &str,
        dataset_path: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
        benchmark_args: &Map<String, Value>,
    ) -> Self {
        Self {
            name: name.to_string(),
            dataset_path: dataset_path.into(),
            results_dir: results_dir.into(),
            requires_sandbox: benchmark_args
                .get("requires_sandbox")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            setup_script: benchmark_args
                .get("setup_script")
                .and_then(Value::as_str)
                .map(PathBuf::from),
        }
    }
}

#[async_trait]
impl Benchmark for FileBenchmark {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_sandbox(&self) -> bool {
        self.requires_sandbox
    }

    fn setup_script(&self) -> Option<&Path> {
        self.setup_script.as_deref()
    }

    fn get_dataset(&self) -> Result<Dataset> {
        let raw = std::fs::read_to_string(&self.dataset_path).with_context(|| {
            format!("failed to read dataset from {}", self.dataset_path.display())
        })?;

        let dataset: Dataset = serde_json::from_str(&raw).with_context(|| {
            format!("dataset {} is not a JSON object of tasks", self.dataset_path.display())
        })?;

        Ok(dataset)
    }

    async fn evaluate_output(
        &self,
        agent_output: &BTreeMap<String, Value>,
        run_id: &str,
    ) -> Result<Box<dyn EvalReport>> {
        let dataset = self.get_dataset()?;

        let mut tasks = BTreeMap::new();
        for (task_id, actual) in agent_output {
            let expected = dataset
                .get(task_id)
                .and_then(|task| task.payload.get("expected"))
                .cloned();

            let correct = expected.as_ref().map(|expected| {
                OutcomeKind::of(actual) == OutcomeKind::Success && actual == expected
            });

            tasks.insert(
                task_id.clone(),
                TaskEvaluation {
                    expected,
                    actual: actual.clone(),
                    correct,
                },
            );
        }

        Ok(Box::new(FileEvalReport {
            run_id: run_id.to_string(),
            tasks,
        }))
    }

    fn get_metrics(&self, eval_results: &Value) -> Result<Map<String, Value>> {
        let report: FileEvalReport = serde_json::from_value(eval_results.clone())
            .context("evaluation results are not a file-benchmark report")?;

        let total = report.tasks.len();
        let mut successful = 0usize;
        let mut errored = 0usize;
        let mut timed_out = 0usize;
        let mut scored = 0usize;
        let mut correct = 0usize;

        for eval in report.tasks.values() {
            match OutcomeKind::of(&eval.actual) {
                OutcomeKind::Success => successful += 1,
                OutcomeKind::Error => errored += 1,
                OutcomeKind::Timeout => timed_out += 1,
            }
            if let Some(verdict) = eval.correct {
                scored += 1;
                if verdict {
                    correct += 1;
                }
            }
        }

        let accuracy = if scored == 0 {
            Value::Null
        } else {
            Value::from(correct as f64 / scored as f64)
        };

        let mut metrics = Map::new();
        metrics.insert("total_tasks".into(), Value::from(total));
        metrics.insert("successful_tasks".into(), Value::from(successful));
        metrics.insert("errored_tasks".into(), Value::from(errored));
        metrics.insert("timed_out_tasks".into(), Value::from(timed_out));
        metrics.insert("accuracy".into(), accuracy);
        Ok(metrics)
    }

    fn get_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let run_dir = self.results_dir.join(&self.name).join(run_id);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create run directory {}", run_dir.display()))?;
        Ok(run_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_dataset(dir: &TempDir, dataset: Value) -> PathBuf {
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, serde_json::to_string(&dataset).unwrap()).unwrap();
        path
    }

    fn benchmark(dir: &TempDir, dataset: Value) -> FileBenchmark {
        let path = write_dataset(dir, dataset);
        FileBenchmark::new("demo", path, dir.path().join("results"), &Map::new())
    }

    #[test]
    fn test_dataset_loading() {
        let dir = TempDir::new().unwrap();
        let bench = benchmark(
            &dir,
            json!({
                "t1": {"question": "1+1", "expected": "2"},
                "t2": {"question": "2+2", "expected": "4"},
            }),
        );

        let dataset = bench.get_dataset().unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset["t1"].payload["expected"], json!("2"));
    }

    #[test]
    fn test_dataset_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let bench = FileBenchmark::new("demo", dir.path().join("nope.json"), dir.path(), &Map::new());
        assert!(bench.get_dataset().is_err());
    }

    #[tokio::test]
    async fn test_evaluate_and_metrics() {
        let dir = TempDir::new().unwrap();
        let bench = benchmark(
            &dir,
            json!({
                "t1": {"expected": "2"},
                "t2": {"expected": "4"},
                "t3": {"question": "unscored"},
            }),
        );

        let mut output = BTreeMap::new();
        output.insert("t1".to_string(), json!("2"));
        output.insert("t2".to_string(), json!("ERROR: agent raised"));
        output.insert("t3".to_string(), json!("free-form answer"));

        let report = bench.evaluate_output(&output, "run-1").await.unwrap();
        let eval = report.to_json().unwrap();

        let metrics = bench.get_metrics(&eval).unwrap();
        assert_eq!(metrics["total_tasks"], json!(3));
        assert_eq!(metrics["successful_tasks"], json!(2));
        assert_eq!(metrics["errored_tasks"], json!(1));
        assert_eq!(metrics["timed_out_tasks"], json!(0));
        // t1 correct, t2 wrong, t3 unscored
        assert_eq!(metrics["accuracy"], json!(0.5));
    }

    #[test]
    fn test_run_dir_created_under_benchmark_name() {
        let dir = TempDir::new().unwrap();
        let bench = benchmark(&dir, json!({}));

        let run_dir = bench.get_run_dir("run-42").unwrap();
        assert!(run_dir.ends_with("demo/run-42"));
        assert!(run_dir.is_dir());
    }

    #[test]
    fn test_sandbox_and_setup_args() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir, json!({}));

        let mut args = Map::new();
        args.insert("requires_sandbox".into(), json!(true));
        args.insert("setup_script".into(), json!("setup.sh"));

        let bench = FileBenchmark::new("demo", path, dir.path(), &args);
        assert!(bench.requires_sandbox());
        assert_eq!(bench.setup_script(), Some(Path::new("setup.sh")));
    }
}
