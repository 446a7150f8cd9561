use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::finding::{AgentFinding, DegradedAgent, FlagSeverity};
use crate::fingerprint::Fingerprint;

/// A flag at or above the red-flag threshold, surfaced regardless of cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedFlag {
    pub agent: String,
    pub severity: FlagSeverity,
    pub message: String,
}

/// One cluster of agreeing findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDiagnosis {
    /// Diagnosis of the cluster's first member
    pub diagnosis: String,
    pub agents: Vec<String>,
    /// Authority-weighted mean confidence of the members
    pub confidence: f64,
}

/// The answer to a diagnostic request. Written once, then served from cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub fingerprint: Fingerprint,
    pub tenant_id: String,
    /// Diagnosis of the primary cluster
    pub diagnosis: String,
    pub confidence: f64,
    /// All clusters, primary first
    pub ranked: Vec<RankedDiagnosis>,
    pub findings: Vec<AgentFinding>,
    pub red_flags: Vec<RedFlag>,
    pub recommendations: Vec<String>,
    pub degraded: Vec<DegradedAgent>,
    pub escalation_required: bool,
    pub generated_at: DateTime<Utc>,
}

impl ConsensusResult {
    pub fn has_red_flags(&self) -> bool {
        !self.red_flags.is_empty()
    }
}
