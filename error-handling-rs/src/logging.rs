//! # Structured Logging
//!
//! Structured logging setup plus correlation IDs that follow a request across
//! `.await` points and spawned agent calls.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::types::{Error, Result};

tokio::task_local! {
    static CORRELATION_ID: String;
}

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name for identification
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Directory for daily-rolling log files; stdout only when unset
    pub log_dir: Option<String>,
    /// Whether to include the event target
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "orchestrator-service".to_string(),
            json_format: true,
            log_dir: None,
            include_target: true,
        }
    }
}

/// Initializes the structured logging system.
///
/// Returns the file writer guard when file output is enabled; it must be held
/// for the lifetime of the process so buffered lines are flushed. Calling this
/// more than once is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(None);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Configuration(format!("invalid log level '{}': {}", config.level, e)))?;

    let stdout_layer = if config.json_format {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(config.include_target)
            .boxed()
    } else {
        fmt::layer()
            .with_target(config.include_target)
            .with_thread_ids(true)
            .boxed()
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(log_dir) => {
            let appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Configuration(format!("failed to set global subscriber: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(guard)
}

/// Runs `future` with `correlation_id` as the task-scoped correlation ID
pub async fn with_correlation_id<F>(correlation_id: impl Into<String>, future: F) -> F::Output
where
    F: Future,
{
    CORRELATION_ID.scope(correlation_id.into(), future).await
}

/// Retrieves the correlation ID of the current task, if one is scoped
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_correlation_id_scoping() {
        assert!(current_correlation_id().is_none());

        let seen = with_correlation_id("req-1", async {
            tokio::task::yield_now().await;
            current_correlation_id()
        })
        .await;

        assert_eq!(seen.as_deref(), Some("req-1"));
        assert!(current_correlation_id().is_none());
    }

    #[tokio::test]
    async fn test_nested_correlation_ids() {
        let (outer, inner) = with_correlation_id("outer", async {
            let inner = with_correlation_id("inner", async { current_correlation_id() }).await;
            (current_correlation_id(), inner)
        })
        .await;

        assert_eq!(outer.as_deref(), Some("outer"));
        assert_eq!(inner.as_deref(), Some("inner"));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.json_format);
        assert!(config.log_dir.is_none());
    }
}
