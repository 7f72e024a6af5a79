//! Retry with exponential backoff for transient infrastructure calls
//!
//! Applies to worker provisioning and file transfer only — never to the
//! agent execution itself. A task whose worker cannot be provisioned after
//! all attempts gets a terminal `ERROR` result; the run continues.

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff policy: `base_delay * 2^attempt`, capped at `max_delay`, with
/// optional ±25% jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries; used by tests and by callers that do
    /// their own failure accounting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Run `op`, retrying on failure until the policy is exhausted.
    ///
    /// The last error is returned unchanged so callers can classify it.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("{what} succeeded after {} attempts", attempt + 1);
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{what} failed (attempt {}/{}), retrying in {:.1}s: {err:#}",
                        attempt + 1,
                        self.max_retries + 1,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!("{what} failed after {} attempts", attempt + 1);
                    return Err(err);
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let jittered = capped * rand::rng().random_range(0.75..=1.25);
            Duration::from_secs_f64(jittered.max(0.1))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}
