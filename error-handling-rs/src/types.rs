//! # Standardized Error Types
//!
//! Every failure that crosses a component boundary in the orchestrator is one
//! of the variants below. Variants carry the context a caller needs to decide
//! between retrying and abandoning: fingerprint, dependency name, tenant.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Core error type for the orchestrator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Malformed input. Never retried.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Admission control rejected the call. The caller must back off.
    #[error("rate limit exceeded for {scope} on tier {tier}, retry after {retry_after:?}")]
    RateLimitExceeded {
        scope: String,
        tier: String,
        retry_after: Duration,
    },

    /// The dependency's breaker is open; the call was not attempted.
    #[error("dependency '{dependency}' unavailable: circuit open")]
    DependencyUnavailable {
        dependency: String,
        retry_after: Option<Duration>,
    },

    /// The dependency was called and failed.
    #[error("dependency '{dependency}' failed: {message}")]
    DependencyFailure { dependency: String, message: String },

    /// A single agent failed. Absorbed by the orchestrator up to quorum.
    #[error("agent '{agent}' failed: {reason}")]
    AgentFailure { agent: String, reason: String },

    /// Fewer agents than the quorum floor produced a usable finding.
    #[error("insufficient consensus for {fingerprint} (tenant {tenant}): {succeeded} of {required} required agents succeeded")]
    InsufficientConsensus {
        fingerprint: String,
        tenant: String,
        succeeded: usize,
        required: usize,
    },

    /// Another holder owns the computation lock for this fingerprint.
    #[error("lock busy for fingerprint {fingerprint}")]
    LockBusy { fingerprint: String },

    /// Waiting for the computation lock exceeded the bounded wait.
    #[error("timed out after {waited:?} waiting for lock on fingerprint {fingerprint}")]
    LockTimeout { fingerprint: String, waited: Duration },

    /// A release or put presented a fencing token that is no longer current.
    #[error("stale lock token {token} for fingerprint {fingerprint}")]
    StaleLock { fingerprint: String, token: u64 },

    /// The caller-specified deadline was exceeded.
    #[error("deadline exceeded during {stage}{}", fingerprint_suffix(.fingerprint))]
    Timeout {
        stage: String,
        fingerprint: Option<String>,
    },

    /// Invalid or unloadable configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

fn fingerprint_suffix(fingerprint: &Option<String>) -> String {
    fingerprint
        .as_ref()
        .map(|fp| format!(" for fingerprint {}", fp))
        .unwrap_or_default()
}

/// Categorizes errors for metrics labels and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    RateLimitExceeded,
    DependencyUnavailable,
    DependencyFailure,
    AgentFailure,
    InsufficientConsensus,
    LockBusy,
    LockTimeout,
    StaleLock,
    Timeout,
    Configuration,
    Internal,
}

impl ErrorKind {
    /// Stable label used in metrics and audit records
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::DependencyUnavailable => "dependency_unavailable",
            ErrorKind::DependencyFailure => "dependency_failure",
            ErrorKind::AgentFailure => "agent_failure",
            ErrorKind::InsufficientConsensus => "insufficient_consensus",
            ErrorKind::LockBusy => "lock_busy",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::StaleLock => "stale_lock",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Error::InvalidRequest { reason: reason.into() }
    }

    pub fn dependency_failure(dependency: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::DependencyFailure {
            dependency: dependency.into(),
            message: message.to_string(),
        }
    }

    pub fn internal(message: impl fmt::Display) -> Self {
        Error::Internal(message.to_string())
    }

    /// Returns the discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Error::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Error::DependencyUnavailable { .. } => ErrorKind::DependencyUnavailable,
            Error::DependencyFailure { .. } => ErrorKind::DependencyFailure,
            Error::AgentFailure { .. } => ErrorKind::AgentFailure,
            Error::InsufficientConsensus { .. } => ErrorKind::InsufficientConsensus,
            Error::LockBusy { .. } => ErrorKind::LockBusy,
            Error::LockTimeout { .. } => ErrorKind::LockTimeout,
            Error::StaleLock { .. } => ErrorKind::StaleLock,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if a caller-side retry with backoff may succeed.
    ///
    /// Rate-limit rejections are not retryable; the caller backs off on its
    /// own schedule.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::LockBusy | ErrorKind::LockTimeout | ErrorKind::DependencyUnavailable
        )
    }

    /// Suggested delay before the caller tries again, when the error knows one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Error::DependencyUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Fingerprint the error refers to, if any
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Error::InsufficientConsensus { fingerprint, .. }
            | Error::LockBusy { fingerprint }
            | Error::LockTimeout { fingerprint, .. }
            | Error::StaleLock { fingerprint, .. } => Some(fingerprint),
            Error::Timeout { fingerprint, .. } => fingerprint.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", err))
    }
}
