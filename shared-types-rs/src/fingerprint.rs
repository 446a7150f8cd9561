//! Request fingerprinting.
//!
//! A fingerprint is the SHA-256 of the tenant, the normalized issue text and
//! the canonical JSON of the client context. Priority, tags and request id do
//! not take part, so resubmitting the same problem hits the same cache entry.

use std::fmt;

use error_handling::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::request::DiagnosticRequest;

/// Hex-encoded SHA-256 identity of a request's semantic content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an existing hex digest, e.g. one received from a caller
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFingerprinter;

impl RequestFingerprinter {
    pub fn new() -> Self {
        Self
    }

    /// Derives the fingerprint of a request. Fails only on malformed input.
    pub fn fingerprint(&self, request: &DiagnosticRequest) -> Result<Fingerprint> {
        request.validate()?;

        let tenant = request.tenant_id.trim();
        let issue = normalize_issue(&request.issue);
        let context = canonical_json(&Value::Object(
            request.context.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ));

        let mut hasher = Sha256::new();
        for part in [tenant, issue.as_str(), context.as_str()] {
            // Length-prefixed so no two part splits hash alike
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }

        Ok(Fingerprint(format!("{:x}", hasher.finalize())))
    }
}

/// Trims, lower-cases and collapses runs of whitespace to one space
pub fn normalize_issue(issue: &str) -> String {
    issue
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Serializes a JSON value with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key.clone(), canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
