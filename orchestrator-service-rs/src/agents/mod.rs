//! # Agent Pool
//!
//! Registration-ordered set of analysis agents behind one trait. Each call
//! goes through the agent's dependency breaker and a per-call timeout; a
//! failed or timed-out agent becomes a `Degraded` outcome instead of failing
//! the orchestration.

pub mod heuristic;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_handling::{CircuitBreaker, Error, Result};
use futures::future::join_all;
use shared_types::{dependency, AgentFinding, Capability, DegradedAgent, DiagnosticRequest};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

pub use heuristic::HeuristicAgent;

/// A specialized analysis capability
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    /// Unique name within the pool
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Breaker the agent's calls are accounted to
    fn dependency(&self) -> &str {
        dependency::LLM_PROVIDER
    }

    async fn analyze(&self, request: &DiagnosticRequest) -> Result<AgentFinding>;

    /// Lightweight reachability check used by the health monitor
    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Finding(AgentFinding),
    Degraded(DegradedAgent),
}

impl AgentOutcome {
    pub fn is_finding(&self) -> bool {
        matches!(self, AgentOutcome::Finding(_))
    }
}

#[derive(Clone)]
struct RegisteredAgent {
    agent: Arc<dyn AnalysisAgent>,
    weight: f64,
}

pub struct AgentPool {
    agents: Vec<RegisteredAgent>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

impl AgentPool {
    pub fn new(breaker: Arc<CircuitBreaker>, call_timeout: Duration) -> Self {
        Self {
            agents: Vec::new(),
            breaker,
            call_timeout,
        }
    }

    /// Adds an agent; registration order is the consensus tie-break order
    pub fn register(&mut self, agent: Arc<dyn AnalysisAgent>, weight: f64) -> Result<()> {
        if self.agents.iter().any(|r| r.agent.name() == agent.name()) {
            return Err(Error::Configuration(format!("agent '{}' registered twice", agent.name())));
        }
        if !(weight.is_finite() && weight > 0.0) {
            return Err(Error::Configuration(format!(
                "agent '{}' has invalid authority weight {}",
                agent.name(),
                weight
            )));
        }
        self.breaker.register(agent.dependency());
        debug!(agent = %agent.name(), capability = %agent.capability(), weight, "Agent registered");
        self.agents.push(RegisteredAgent { agent, weight });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.agents.iter().map(|r| r.agent.capability()).collect()
    }

    /// Authority weight of an agent; 1.0 for unknown names
    pub fn weight_of(&self, agent: &str) -> f64 {
        self.agents
            .iter()
            .find(|r| r.agent.name() == agent)
            .map_or(1.0, |r| r.weight)
    }

    /// Registration index of an agent
    pub fn position_of(&self, agent: &str) -> Option<usize> {
        self.agents.iter().position(|r| r.agent.name() == agent)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<dyn AnalysisAgent>> {
        self.agents.iter().map(|r| &r.agent)
    }

    /// Invokes the first agent registered for `capability`
    pub async fn invoke(
        &self,
        capability: Capability,
        request: &DiagnosticRequest,
        deadline: Option<Instant>,
    ) -> Result<AgentOutcome> {
        let registered = self
            .agents
            .iter()
            .find(|r| r.agent.capability() == capability)
            .ok_or_else(|| Error::Configuration(format!("no agent registered for {}", capability)))?;
        Ok(self.call(&registered.agent, request, deadline).await)
    }

    /// Calls every agent concurrently; outcomes come back in registration order
    pub async fn fan_out(&self, request: &DiagnosticRequest, deadline: Option<Instant>) -> Vec<AgentOutcome> {
        join_all(
            self.agents
                .iter()
                .map(|registered| self.call(&registered.agent, request, deadline)),
        )
        .await
    }

    async fn call(
        &self,
        agent: &Arc<dyn AnalysisAgent>,
        request: &DiagnosticRequest,
        deadline: Option<Instant>,
    ) -> AgentOutcome {
        let name = agent.name();
        let budget = match deadline {
            Some(deadline) => self.call_timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => self.call_timeout,
        };

        let started = Instant::now();
        let result = self
            .breaker
            .execute(agent.dependency(), async {
                match timeout(budget, agent.analyze(request)).await {
                    Ok(result) => result
                        .map_err(|err| match err {
                            Error::AgentFailure { .. } | Error::DependencyFailure { .. } => err,
                            other => Error::AgentFailure {
                                agent: name.to_string(),
                                reason: other.to_string(),
                            },
                        })
                        .and_then(|finding| bounded_confidence(name, finding)),
                    Err(_) => Err(Error::Timeout {
                        stage: format!("agent {}", name),
                        fingerprint: None,
                    }),
                }
            })
            .await;

        match result {
            Ok(mut finding) => {
                finding.agent = name.to_string();
                finding.capability = agent.capability();
                debug!(
                    agent = %name,
                    confidence = finding.confidence,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Agent finding received"
                );
                AgentOutcome::Finding(finding)
            }
            Err(err) => {
                warn!(agent = %name, error = %err, "Agent degraded");
                metrics::counter!("agent_degraded_total", 1, "agent" => name.to_string(), "reason" => err.kind().as_str());
                AgentOutcome::Degraded(DegradedAgent {
                    agent: name.to_string(),
                    capability: agent.capability(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

/// Findings can be built without `AgentFinding::new`; a non-finite
/// confidence is a failed answer, anything else is clamped into `[0, 1]`.
fn bounded_confidence(agent: &str, mut finding: AgentFinding) -> Result<AgentFinding> {
    if !finding.confidence.is_finite() {
        return Err(Error::AgentFailure {
            agent: agent.to_string(),
            reason: format!("non-finite confidence {}", finding.confidence),
        });
    }
    finding.confidence = finding.confidence.clamp(0.0, 1.0);
    Ok(finding)
}
