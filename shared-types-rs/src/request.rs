use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use error_handling::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Longest issue text accepted, in characters
pub const MAX_ISSUE_CHARS: usize = 5000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A free-form diagnostic request about a network problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRequest {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    #[serde(alias = "client_issue")]
    pub issue: String,
    #[serde(default)]
    pub priority: Priority,
    /// Structured client context, e.g. environment, affected users, location
    #[serde(default, alias = "client_context")]
    pub context: BTreeMap<String, Value>,
    pub tenant_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl DiagnosticRequest {
    pub fn new(tenant_id: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            issue: issue.into(),
            priority: Priority::default(),
            context: BTreeMap::new(),
            tenant_id: tenant_id.into(),
            tags: Vec::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Checks the request is well-formed
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::invalid_request("tenant id must not be empty"));
        }
        if self.issue.trim().is_empty() {
            return Err(Error::invalid_request("issue text must not be empty"));
        }
        let chars = self.issue.chars().count();
        if chars > MAX_ISSUE_CHARS {
            return Err(Error::invalid_request(format!(
                "issue text is {} characters, limit is {}",
                chars, MAX_ISSUE_CHARS
            )));
        }
        Ok(())
    }
}
