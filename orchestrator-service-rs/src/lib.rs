//! # Orchestrator Service
//!
//! Resilience-aware multi-agent consensus orchestrator for network
//! diagnostics. A diagnostic request is fingerprinted, admitted, deduplicated
//! through a fenced computation lock, fanned out to specialized analysis
//! agents behind circuit breakers, and folded into one ranked diagnosis.

pub mod agents;
pub mod cache;
pub mod collaborators;
pub mod consensus;
pub mod context;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod tenancy;

pub use agents::{AgentOutcome, AgentPool, AnalysisAgent, HeuristicAgent};
pub use cache::{Acquisition, CacheManager, CacheStore, HeldLock, LocalStore, LockToken, RedisStore};
pub use collaborators::{AuditEvent, AuditSink, Collaborators, Notification, NotificationSink};
pub use consensus::{ConsensusBuilder, ConsensusInput};
pub use context::OrchestratorContext;
pub use health::{DependencyProbe, HealthMonitor, HealthReport};
pub use metrics::{Metrics, MetricsSnapshot};
pub use orchestrator::{DiagnoseOptions, Orchestrator};
pub use rate_limit::{Caller, RateLimiter, Tier};
pub use tenancy::TenantRegistry;
