//! Telemetry sink interface
//!
//! Agents record their model calls against an external tracing sink,
//! tagged with the task ID; the harness holds an opaque client handle and
//! queries it exactly once, at finalization, for cumulative cost, token
//! usage by model, and per-task latency. Telemetry failures degrade to
//! warnings — a bundle with zeroed cost figures still gets written.
//!
//! The sink is closed (`finish`) before scoring runs so that model calls
//! made by an LLM-as-judge scorer are not counted as agent cost.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Token counts for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// One recorded model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Task the call was made under.
    pub task_id: String,
    /// Model identifier.
    pub model: String,
    /// Call start, seconds since the epoch.
    pub started_at: f64,
    /// Call end, seconds since the epoch.
    pub ended_at: f64,
    /// Cost of this call in USD.
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Cumulative cost figures for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub usage_by_model: BTreeMap<String, TokenUsage>,
}

/// Client handle onto the external tracing sink.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Close the session so no further calls are attributed to the agent.
    async fn finish(&self) -> Result<()>;

    /// Cumulative cost and per-model token usage.
    async fn cost_summary(&self) -> Result<CostSummary>;

    /// Raw call records for the run.
    async fn call_records(&self) -> Result<Vec<CallRecord>>;
}

/// Per-task latency: spread from first call start to last call end.
pub fn task_latencies(records: &[CallRecord]) -> BTreeMap<String, f64> {
    let mut spans: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for record in records {
        spans
            .entry(record.task_id.clone())
            .and_modify(|(start, end)| {
                *start = start.min(record.started_at);
                *end = end.max(record.ended_at);
            })
            .or_insert((record.started_at, record.ended_at));
    }
    spans
        .into_iter()
        .map(|(task_id, (start, end))| (task_id, (end - start).max(0.0)))
        .collect()
}

/// Sink used when no telemetry endpoint is configured: everything reads
/// as zero.
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    async fn cost_summary(&self) -> Result<CostSummary> {
        Ok(CostSummary::default())
    }

    async fn call_records(&self) -> Result<Vec<CallRecord>> {
        Ok(Vec::new())
    }
}

/// File-backed sink reading newline-delimited call records.
///
/// Workers append one JSON record per model call; malformed lines are
/// skipped the same way the submissions log tolerates them.
pub struct FileTelemetry {
    path: PathBuf,
}

impl FileTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_records(&self) -> Result<Vec<CallRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read telemetry log {}", self.path.display())
                });
            }
        };

        let mut records = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<CallRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => tracing::warn!("Skipping malformed telemetry record: {err}"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl TelemetrySink for FileTelemetry {
    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    async fn cost_summary(&self) -> Result<CostSummary> {
        let mut summary = CostSummary::default();
        for record in self.read_records().await? {
            summary.total_cost += record.cost;
            summary
                .usage_by_model
                .entry(record.model)
                .or_default()
                .add(&record.usage);
        }
        Ok(summary)
    }

    async fn call_records(&self) -> Result<Vec<CallRecord>> {
        self.read_records().await
    }
}

/// Build the sink for a run from `TELEMETRY_ENDPOINT`.
///
/// The endpoint names a directory; the run's records live in
/// `<endpoint>/<run_id>.jsonl`. Unset means no telemetry.
pub fn from_env(run_id: &str) -> Box<dyn TelemetrySink> {
    match std::env::var("TELEMETRY_ENDPOINT") {
        Ok(endpoint) if !endpoint.is_empty() => {
            let path = Path::new(&endpoint).join(format!("{run_id}.jsonl"));
            tracing::info!("Telemetry records expected at {}", path.display());
            Box::new(FileTelemetry::new(path))
        }
        _ => {
            tracing::info!("TELEMETRY_ENDPOINT not set; cost figures will be zero");
            Box::new(NoopTelemetry)
        }
    }
}
