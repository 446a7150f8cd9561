//! Audit and notification sinks consumed by the orchestrator.
//!
//! Both are best-effort: a failing sink is logged and never fails an
//! orchestration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use error_handling::Result;
use serde::Serialize;
use shared_types::{Fingerprint, FlagSeverity};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub tenant_id: String,
    pub fingerprint: Option<Fingerprint>,
    /// `success`, `cache_hit`, or an error kind
    pub outcome: String,
    pub correlation_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: &str, tenant_id: &str, fingerprint: Option<&Fingerprint>, outcome: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            fingerprint: fingerprint.cloned(),
            outcome: outcome.to_string(),
            correlation_id: error_handling::current_correlation_id(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub severity: FlagSeverity,
    pub message: String,
    pub destination: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Writes audit events to the structured log
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        info!(
            target: "audit",
            event_type = %event.event_type,
            tenant = %event.tenant_id,
            fingerprint = event.fingerprint.as_ref().map(|fp| fp.short()).unwrap_or("-"),
            outcome = %event.outcome,
            correlation_id = event.correlation_id.as_deref().unwrap_or("-"),
            "Audit event"
        );
        Ok(())
    }
}

/// Writes notifications to the structured log at warn level
#[derive(Debug, Default)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: Notification) -> Result<()> {
        warn!(
            target: "notifications",
            severity = %notification.severity.as_str(),
            destination = %notification.destination,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// The sinks handed to the orchestrator context
#[derive(Clone)]
pub struct Collaborators {
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            audit: Arc::new(TracingAuditSink),
            notifier: Arc::new(TracingNotificationSink),
        }
    }
}

impl Collaborators {
    /// Fire-and-forget; the event is recorded on a background task
    pub fn audit(&self, event: AuditEvent) {
        let sink = Arc::clone(&self.audit);
        tokio::spawn(async move {
            let event_type = event.event_type.clone();
            if let Err(err) = sink.record(event).await {
                warn!(event_type = %event_type, error = %err, "Audit sink rejected event");
                metrics::counter!("collaborator_failures_total", 1, "sink" => "audit");
            }
        });
    }

    /// Delivers a notification, giving up after `limit`
    pub async fn notify(&self, notification: Notification, limit: Duration) {
        let severity = notification.severity;
        match tokio::time::timeout(limit, self.notifier.notify(notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(severity = %severity.as_str(), error = %err, "Notification sink failed");
                metrics::counter!("collaborator_failures_total", 1, "sink" => "notification");
            }
            Err(_) => {
                warn!(severity = %severity.as_str(), "Notification sink timed out");
                metrics::counter!("collaborator_failures_total", 1, "sink" => "notification");
            }
        }
    }
}
