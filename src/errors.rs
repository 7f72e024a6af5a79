//! Harness-level error types
//!
//! Distinguishes errors that abort a run before any task is dispatched
//! (invalid configuration) from errors that stay local to a single task
//! (transport provisioning failures, which are retried and then recorded as
//! that task's terminal `ERROR` result). Per-task failures never surface
//! through this type; they live in the submissions log.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    /// Agent entry spec is not of the form `module.function`
    #[error(
        "invalid agent entry '{0}': expected 'module.function' with non-empty module and function names"
    )]
    InvalidEntrySpec(String),

    /// Agent directory does not exist or is not a directory
    #[error("agent directory not found: {0}")]
    AgentDirNotFound(PathBuf),

    /// Bare local execution needs a requirements file to build the agent's
    /// environment from
    #[error("no requirements.txt found in agent directory: {0}")]
    MissingRequirements(PathBuf),

    /// More than one of environment name, docker, and vm was selected
    #[error("only one of --env, --docker, or --vm can be set at a time")]
    ConflictingExecutionModes,

    /// The requested benchmark is not registered
    #[error("benchmark '{0}' not found")]
    BenchmarkNotFound(String),

    /// The benchmark insists on isolation stronger than a local sandbox
    #[error("benchmark '{0}' requires sandbox execution; rerun with --docker or --vm")]
    SandboxRequired(String),

    /// A required environment variable is missing for the selected
    /// execution mode
    #[error("environment variable {name} is required for {mode} execution")]
    MissingEnvironment { name: String, mode: String },

    /// Worker transport failed to provision or communicate with a worker
    #[error("transport error: {0}")]
    Transport(String),
}

impl HarnessError {
    /// Whether the error is transient enough that the transport layer may
    /// retry the operation that produced it.
    ///
    /// Only infrastructure provisioning is retryable; configuration errors
    /// are permanent and abort the run before dispatch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarnessError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_permanent() {
        assert!(!HarnessError::InvalidEntrySpec("main".into()).is_retryable());
        assert!(!HarnessError::BenchmarkNotFound("nope".into()).is_retryable());
        assert!(!HarnessError::ConflictingExecutionModes.is_retryable());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(HarnessError::Transport("vm create timed out".into()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = HarnessError::SandboxRequired("corebench".into());
        assert!(err.to_string().contains("--docker or --vm"));

        let err = HarnessError::MissingEnvironment {
            name: "SSH_PRIVATE_KEY_PATH".into(),
            mode: "vm".into(),
        };
        assert!(err.to_string().contains("SSH_PRIVATE_KEY_PATH"));
    }
}
