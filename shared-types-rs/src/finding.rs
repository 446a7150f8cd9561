use std::fmt;
use std::str::FromStr;

use error_handling::Error;
use serde::{Deserialize, Serialize};

/// Analysis capabilities an agent can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    InfrastructureAnalysis,
    SecurityAudit,
    DirectoryAndAuthAnalysis,
    ComplianceCheck,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::InfrastructureAnalysis,
        Capability::SecurityAudit,
        Capability::DirectoryAndAuthAnalysis,
        Capability::ComplianceCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::InfrastructureAnalysis => "infrastructure-analysis",
            Capability::SecurityAudit => "security-audit",
            Capability::DirectoryAndAuthAnalysis => "directory-and-auth-analysis",
            Capability::ComplianceCheck => "compliance-check",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown capability '{}'", s)))
    }
}

/// Severity attached to a finding's flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl FlagSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagSeverity::Info => "info",
            FlagSeverity::Low => "low",
            FlagSeverity::Medium => "medium",
            FlagSeverity::High => "high",
            FlagSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for FlagSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub severity: FlagSeverity,
    pub message: String,
}

impl Flag {
    pub fn new(severity: FlagSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// One agent's answer for one orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFinding {
    pub agent: String,
    pub capability: Capability,
    pub diagnosis: String,
    /// Always within `[0, 1]`
    pub confidence: f64,
    /// References to the evidence the diagnosis rests on
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub flags: Vec<Flag>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl AgentFinding {
    /// Creates a finding; `confidence` is clamped into `[0, 1]` and NaN becomes 0
    pub fn new(
        agent: impl Into<String>,
        capability: Capability,
        diagnosis: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        Self {
            agent: agent.into(),
            capability,
            diagnosis: diagnosis.into(),
            confidence,
            evidence: Vec::new(),
            flags: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn with_flag(mut self, severity: FlagSeverity, message: impl Into<String>) -> Self {
        self.flags.push(Flag::new(severity, message));
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }

    /// Highest flag severity carried, if any
    pub fn max_severity(&self) -> Option<FlagSeverity> {
        self.flags.iter().map(|f| f.severity).max()
    }
}

/// An agent that timed out or failed during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedAgent {
    pub agent: String,
    pub capability: Capability,
    pub reason: String,
}
