//! # Retry Mechanism
//!
//! Caller-side retry with exponential backoff and jitter. The orchestrator
//! itself never retries a diagnosis; front ends wrap their calls in a
//! `RetryPolicy` to ride out lock contention.

use std::future::Future;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::logging::current_correlation_id;
use crate::types::{Error, ErrorKind, Result};

/// Configuration for a retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,

    /// Base duration for exponential backoff
    pub base_backoff: Duration,

    /// Maximum backoff time
    pub max_backoff: Duration,

    /// Jitter factor (0.0 - 1.0) to add randomness to backoff
    pub jitter_factor: f64,

    /// Error kinds worth another attempt
    pub retryable: Vec<ErrorKind>,

    /// Wait at least as long as the error's own retry hint
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter_factor: 0.1,
            retryable: vec![ErrorKind::LockBusy, ErrorKind::LockTimeout],
            respect_retry_after: true,
        }
    }
}

/// A retry policy that determines how to handle retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    name: String,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: Option<RetryConfig>) -> Self {
        Self {
            config: config.unwrap_or_default(),
            name: name.into(),
        }
    }

    /// Creates a policy for operations that should never be retried
    pub fn never() -> Self {
        Self::new(
            "never",
            Some(RetryConfig {
                max_retries: 0,
                ..Default::default()
            }),
        )
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Checks if an error is retryable according to this policy
    pub fn should_retry(&self, error: &Error, attempt: usize) -> bool {
        attempt < self.config.max_retries && self.config.retryable.contains(&error.kind())
    }

    /// Calculates the backoff duration before retry number `attempt` (zero based)
    pub fn calculate_backoff(&self, error: &Error, attempt: usize) -> Duration {
        let base_ms = self.config.base_backoff.as_millis() as f64;
        let max_ms = self.config.max_backoff.as_millis() as f64;

        let capped = (base_ms * 2.0_f64.powi(attempt.min(30) as i32)).min(max_ms);

        let jitter_range = capped * self.config.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };
        let backoff = Duration::from_millis((capped + jitter).max(0.0) as u64);

        match error.retry_after() {
            Some(hint) if self.config.respect_retry_after => backoff.max(hint),
            _ => backoff,
        }
    }

    /// Executes `f` until it succeeds, fails with a non-retryable error, or
    /// runs out of retries. The last error is returned unchanged.
    pub async fn retry<F, Fut, T>(&self, operation_name: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            policy = %self.name,
                            operation = %operation_name,
                            attempts = attempt + 1,
                            "Operation succeeded after retries"
                        );
                    }
                    counter!("retry_outcomes_total", 1, "policy" => self.name.clone(), "outcome" => "success");
                    histogram!("retry_attempts", (attempt + 1) as f64, "policy" => self.name.clone());
                    return Ok(value);
                }
                Err(err) if self.should_retry(&err, attempt) => {
                    let backoff = self.calculate_backoff(&err, attempt);
                    debug!(
                        policy = %self.name,
                        operation = %operation_name,
                        attempt = attempt + 1,
                        error_kind = %err.kind(),
                        backoff_ms = backoff.as_millis() as u64,
                        correlation_id = ?current_correlation_id(),
                        "Retrying after error"
                    );
                    counter!("retry_attempts_total", 1, "policy" => self.name.clone(), "error_kind" => err.kind().as_str());
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 0 {
                        warn!(
                            policy = %self.name,
                            operation = %operation_name,
                            attempts = attempt + 1,
                            duration_ms = start.elapsed().as_millis() as u64,
                            error = %err,
                            "Operation failed after retries"
                        );
                    }
                    counter!("retry_outcomes_total", 1, "policy" => self.name.clone(), "outcome" => "failure");
                    histogram!("retry_attempts", (attempt + 1) as f64, "policy" => self.name.clone());
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default", None)
    }
}
