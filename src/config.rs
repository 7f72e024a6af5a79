//! Harness configuration
//!
//! Layered the usual way: built-in defaults, overridden by a TOML config
//! file (`./newt.toml`, or `newt/config.toml` under the platform config
//! directory), overridden again by CLI flags. Cloud credentials and other
//! secrets never live here — they come from the environment (see the vm
//! transport) and `.env` via dotenvy.

use crate::runner::DispatchConfig;
use crate::runner::docker::DockerConfig;
use crate::runner::retry::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level harness configuration.
///
/// # Examples
///
/// ```
/// use newt::config::HarnessConfig;
///
/// let config: HarnessConfig = toml::from_str(r#"
///     results_dir = "out"
///
///     [dispatch]
///     max_concurrent = 10
///     task_timeout = "1h"
///     poll_interval = "30s"
/// "#).unwrap();
///
/// assert_eq!(config.dispatch.max_concurrent, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root of all run directories.
    pub results_dir: PathBuf,

    pub dispatch: DispatchConfig,
    pub retry: RetryPolicy,
    pub docker: DockerConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            dispatch: DispatchConfig::default(),
            retry: RetryPolicy::default(),
            docker: DockerConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist; otherwise the first config file found
    /// in the search order is used, and no file at all means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::search_paths().into_iter().find(|candidate| candidate.is_file()),
        };

        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                let config = toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?;
                tracing::debug!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("newt.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("newt").join("config.toml"));
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.results_dir, PathBuf::from("results"));
        assert_eq!(config.dispatch.max_concurrent, 1);
        assert_eq!(config.dispatch.task_timeout, Duration::from_secs(7200));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.docker.image, "newt-agent-runner:latest");
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("newt.toml");
        std::fs::write(
            &path,
            r#"
            [dispatch]
            max_concurrent = 25
            task_timeout = "90m"
            poll_interval = "10s"

            [retry]
            max_retries = 5
            base_delay = "2s"
            max_delay = "30s"
            jitter = false
            "#,
        )
        .unwrap();

        let config = HarnessConfig::load(Some(&path)).unwrap();
        assert_eq!(config.dispatch.max_concurrent, 25);
        assert_eq!(config.dispatch.task_timeout, Duration::from_secs(5400));
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.retry.jitter);
        // untouched sections keep their defaults
        assert_eq!(config.results_dir, PathBuf::from("results"));
        assert_eq!(config.docker.python_version, "3.12");
    }

    #[test]
    fn test_missing_explicit_path_errors() {
        assert!(HarnessConfig::load(Some(Path::new("/no/such/newt.toml"))).is_err());
    }

    #[test]
    fn test_malformed_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("newt.toml");
        std::fs::write(&path, "results_dir = [this is not toml").unwrap();
        assert!(HarnessConfig::load(Some(&path)).is_err());
    }
}
