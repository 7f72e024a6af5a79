// Newt - benchmark evaluation harness for AI agents
//
// Dispatches benchmark tasks across isolated workers (local sandbox,
// Docker container, or cloud VM), records terminal outcomes in a
// crash-safe submissions log, and finalizes runs into results bundles.

pub mod agent_runner;
pub mod benchmarks;
pub mod cli;
pub mod config;
pub mod continuation;
pub mod errors;
pub mod finalize;
pub mod runner;
pub mod store;
pub mod telemetry;

// Re-exports for convenience
pub use agent_runner::{AgentRunner, RunOptions};
pub use benchmarks::{Benchmark, Dataset, Task};
pub use config::HarnessConfig;
pub use errors::HarnessError;
pub use runner::{AgentSpec, DispatchConfig, Dispatcher, ExecutionMode, WorkerTransport};
pub use store::SubmissionStore;

/// Current Newt version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
