//! Run finalization
//!
//! After every task has reached a terminal state the run is scored,
//! telemetry is queried, and everything is merged into a single bundle
//! written next to the submissions log. The telemetry session is closed
//! before scoring so that model calls made by the scorer are not billed to
//! the agent.

use crate::benchmarks::Benchmark;
use crate::store::SubmissionStore;
use crate::telemetry::{CostSummary, TelemetrySink, task_latencies};
use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Identity of the run being finalized, recorded in the bundle's config
/// section.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub agent_name: String,
    pub run_id: String,
    pub agent_args: Map<String, Value>,
    pub run_command: Option<String>,
}

/// Score the run, query telemetry, and write the upload bundle.
///
/// Returns the full bundle. Scoring failures propagate (the submissions
/// log stays intact, so the run can be continued); telemetry failures
/// degrade to warnings and zeroed cost figures.
pub async fn finalize(
    info: &RunInfo,
    results: &BTreeMap<String, Value>,
    unfinished: &[String],
    benchmark: &dyn Benchmark,
    telemetry: &dyn TelemetrySink,
    store: &SubmissionStore,
) -> Result<Value> {
    if !unfinished.is_empty() {
        tracing::warn!("{} tasks are incomplete", unfinished.len());
        for task_id in unfinished {
            tracing::info!("  - {task_id}");
        }
        tracing::info!("Use --continue-run to retry the remaining tasks");
    }

    if let Err(err) = telemetry.finish().await {
        tracing::warn!("Failed to close telemetry session: {err:#}");
    }

    tracing::info!("Evaluating results...");
    let report = benchmark
        .evaluate_output(results, &info.run_id)
        .await
        .context("benchmark evaluation failed")?;

    let eval_value = match report.to_json() {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                "Evaluation report is not serializable ({err}); storing lossy form"
            );
            json!({
                "_type": short_type_label(report.type_label()),
                "_repr": format!("{report:?}"),
            })
        }
    };

    let cost = match telemetry.cost_summary().await {
        Ok(summary) => summary,
        Err(err) => {
            tracing::warn!("Failed to query telemetry cost: {err:#}");
            CostSummary::default()
        }
    };
    let records = match telemetry.call_records().await {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!("Failed to query telemetry calls: {err:#}");
            Vec::new()
        }
    };
    let latencies = task_latencies(&records);

    tracing::info!("Processing results...");
    let mut results_section = benchmark
        .get_metrics(&eval_value)
        .context("benchmark metrics extraction failed")?;
    results_section.insert("total_cost".into(), json!(cost.total_cost));
    results_section.insert("latencies".into(), serde_json::to_value(&latencies)?);

    let bundle = json!({
        "config": {
            "agent_name": info.agent_name,
            "benchmark_name": benchmark.name(),
            "date": chrono::Utc::now().format("%Y-%m-%d").to_string(),
            "run_id": info.run_id,
            "agent_args": info.agent_args,
            "run_command": info.run_command,
        },
        "results": results_section,
        "raw_eval_results": eval_value,
        "raw_logging_results": serde_json::to_value(&records)?,
        "total_usage": serde_json::to_value(&cost.usage_by_model)?,
        "total_cost": cost.total_cost,
    });

    let upload_path = store.upload_path();
    tokio::fs::create_dir_all(store.run_dir())
        .await
        .context("failed to create run directory")?;
    tokio::fs::write(&upload_path, serde_json::to_string_pretty(&bundle)?)
        .await
        .with_context(|| format!("failed to write bundle to {}", upload_path.display()))?;
    tracing::info!("Wrote results bundle to {}", upload_path.display());

    Ok(bundle)
}

/// Load the previous run's bundle if one was written.
pub async fn load_previous_bundle(store: &SubmissionStore) -> Result<Option<Value>> {
    let path = store.upload_path();
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw).with_context(|| {
            format!("previous bundle {} is malformed", path.display())
        })?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read bundle {}", path.display()))
        }
    }
}

fn short_type_label(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::EvalReport;
    use crate::telemetry::{CallRecord, MockTelemetrySink, TokenUsage};
    use async_trait::async_trait;
    use serde::Serialize;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct TestBenchmark {
        report: fn() -> Box<dyn EvalReport>,
    }

    #[async_trait]
    impl Benchmark for TestBenchmark {
        fn name(&self) -> &str {
            "test-bench"
        }

        fn get_dataset(&self) -> Result<crate::benchmarks::Dataset> {
            Ok(Default::default())
        }

        async fn evaluate_output(
            &self,
            _agent_output: &BTreeMap<String, Value>,
            _run_id: &str,
        ) -> Result<Box<dyn EvalReport>> {
            Ok((self.report)())
        }

        fn get_metrics(&self, _eval_results: &Value) -> Result<Map<String, Value>> {
            let mut metrics = Map::new();
            metrics.insert("accuracy".into(), json!(0.75));
            Ok(metrics)
        }

        fn get_run_dir(&self, _run_id: &str) -> Result<PathBuf> {
            unreachable!("finalizer does not create run dirs")
        }
    }

    fn mock_telemetry() -> MockTelemetrySink {
        let mut mock = MockTelemetrySink::new();
        mock.expect_finish().returning(|| Ok(()));
        mock.expect_cost_summary().returning(|| {
            let mut usage = BTreeMap::new();
            usage.insert(
                "gpt-4o".to_string(),
                TokenUsage {
                    prompt_tokens: 1000,
                    completion_tokens: 100,
                },
            );
            Ok(CostSummary {
                total_cost: 1.25,
                usage_by_model: usage,
            })
        });
        mock.expect_call_records().returning(|| {
            Ok(vec![
                CallRecord {
                    task_id: "a".into(),
                    model: "gpt-4o".into(),
                    started_at: 10.0,
                    ended_at: 11.0,
                    cost: 1.25,
                    usage: TokenUsage::default(),
                },
                CallRecord {
                    task_id: "a".into(),
                    model: "gpt-4o".into(),
                    started_at: 12.0,
                    ended_at: 14.0,
                    cost: 0.0,
                    usage: TokenUsage::default(),
                },
            ])
        });
        mock
    }

    fn info() -> RunInfo {
        RunInfo {
            agent_name: "my-agent".into(),
            run_id: "run-9".into(),
            agent_args: Map::new(),
            run_command: Some("newt run ...".into()),
        }
    }

    #[derive(Debug, Serialize)]
    struct GoodReport {
        score: f64,
    }

    #[derive(Debug)]
    struct PoisonReport;

    impl Serialize for PoisonReport {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("deliberately unserializable"))
        }
    }

    #[tokio::test]
    async fn test_bundle_assembly() {
        let dir = TempDir::new().unwrap();
        let store = SubmissionStore::new(dir.path().join("run-9"), "run-9");
        let benchmark = TestBenchmark {
            report: || Box::new(GoodReport { score: 0.75 }),
        };

        let mut results = BTreeMap::new();
        results.insert("a".to_string(), json!("answer"));

        let bundle = finalize(&info(), &results, &[], &benchmark, &mock_telemetry(), &store)
            .await
            .unwrap();

        assert_eq!(bundle["config"]["agent_name"], json!("my-agent"));
        assert_eq!(bundle["config"]["benchmark_name"], json!("test-bench"));
        assert_eq!(bundle["config"]["run_id"], json!("run-9"));
        assert_eq!(bundle["results"]["accuracy"], json!(0.75));
        assert_eq!(bundle["results"]["total_cost"], json!(1.25));
        assert_eq!(bundle["results"]["latencies"]["a"], json!(4.0));
        assert_eq!(bundle["raw_eval_results"], json!({"score": 0.75}));
        assert_eq!(bundle["total_usage"]["gpt-4o"]["prompt_tokens"], json!(1000));
        assert_eq!(bundle["total_cost"], json!(1.25));

        // bundle landed on disk and is valid JSON
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(store.upload_path()).unwrap()).unwrap();
        assert_eq!(written["config"]["run_id"], json!("run-9"));
    }

    #[tokio::test]
    async fn test_unserializable_report_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = SubmissionStore::new(dir.path().join("run-9"), "run-9");
        let benchmark = TestBenchmark {
            report: || Box::new(PoisonReport),
        };

        let bundle = finalize(
            &info(),
            &BTreeMap::new(),
            &[],
            &benchmark,
            &mock_telemetry(),
            &store,
        )
        .await
        .unwrap();

        assert_eq!(bundle["raw_eval_results"]["_type"], json!("PoisonReport"));
        assert!(bundle["raw_eval_results"]["_repr"].is_string());

        // the on-disk file is still valid JSON
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(store.upload_path()).unwrap()).unwrap();
        assert_eq!(written["raw_eval_results"]["_type"], json!("PoisonReport"));
    }

    #[tokio::test]
    async fn test_telemetry_failure_degrades_to_zero_cost() {
        let dir = TempDir::new().unwrap();
        let store = SubmissionStore::new(dir.path().join("run-9"), "run-9");
        let benchmark = TestBenchmark {
            report: || Box::new(GoodReport { score: 1.0 }),
        };

        let mut mock = MockTelemetrySink::new();
        mock.expect_finish().returning(|| Err(anyhow::anyhow!("sink gone")));
        mock.expect_cost_summary()
            .returning(|| Err(anyhow::anyhow!("sink gone")));
        mock.expect_call_records()
            .returning(|| Err(anyhow::anyhow!("sink gone")));

        let bundle = finalize(&info(), &BTreeMap::new(), &[], &benchmark, &mock, &store)
            .await
            .unwrap();

        assert_eq!(bundle["total_cost"], json!(0.0));
        assert_eq!(bundle["results"]["latencies"], json!({}));
    }

    #[tokio::test]
    async fn test_load_previous_bundle() {
        let dir = TempDir::new().unwrap();
        let store = SubmissionStore::new(dir.path().join("run-9"), "run-9");

        assert!(load_previous_bundle(&store).await.unwrap().is_none());

        std::fs::create_dir_all(store.run_dir()).unwrap();
        std::fs::write(store.upload_path(), r#"{"results": {"accuracy": 1.0}}"#).unwrap();
        let bundle = load_previous_bundle(&store).await.unwrap().unwrap();
        assert_eq!(bundle["results"]["accuracy"], json!(1.0));
    }

    #[test]
    fn test_short_type_label() {
        assert_eq!(short_type_label("newt::finalize::tests::PoisonReport"), "PoisonReport");
        assert_eq!(short_type_label("Bare"), "Bare");
    }
}
