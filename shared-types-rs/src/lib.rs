//! Shared data model for the diagnostic consensus orchestrator.
//!
//! Every type here is plain data: requests, findings, consensus results and
//! tenant usage. The only behaviour is the pure request fingerprinter.

pub mod consensus;
pub mod finding;
pub mod fingerprint;
pub mod request;
pub mod tenant;

pub use consensus::{ConsensusResult, RankedDiagnosis, RedFlag};
pub use finding::{AgentFinding, Capability, DegradedAgent, Flag, FlagSeverity};
pub use fingerprint::{Fingerprint, RequestFingerprinter};
pub use request::{DiagnosticRequest, Priority, MAX_ISSUE_CHARS};
pub use tenant::{TenantPlan, TenantStats};

/// Names of the external dependencies guarded by circuit breakers
pub mod dependency {
    /// Language-model provider behind the analysis agents
    pub const LLM_PROVIDER: &str = "llm_provider";
    pub const DATABASE: &str = "database";
    /// Distributed cache and lock store
    pub const CACHE: &str = "cache";
}
