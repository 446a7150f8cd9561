//! # Orchestrator
//!
//! End-to-end request lifecycle:
//!
//! fingerprint → rate-limit admission → cache lookup → computation lock →
//! tenant quota → agent fan-out → consensus → cache write (releases the
//! lock) → red-flag notification.
//!
//! Admission happens once per call; a caller-side retry policy only repeats
//! the steps after it. Quota is charged for computations, not cache hits.
//!
//! The orchestrator holds no state of its own beyond an in-flight bound; every
//! mutable structure lives in the [`OrchestratorContext`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use error_handling::{with_correlation_id, CircuitHealth, Error, Result, RetryPolicy};
use shared_types::{ConsensusResult, DiagnosticRequest, Fingerprint, TenantStats};
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::agents::{AgentOutcome, AgentPool};
use crate::cache::{Acquisition, LockGuard};
use crate::collaborators::{AuditEvent, Notification};
use crate::consensus::ConsensusInput;
use crate::context::OrchestratorContext;
use crate::health::HealthReport;
use crate::metrics::MetricsSnapshot;
use crate::rate_limit::{Caller, Tier};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-call options that are not part of the request's identity
#[derive(Debug, Clone, Default)]
pub struct DiagnoseOptions {
    pub client_ip: Option<IpAddr>,
    /// Budget for the whole orchestration, measured from the call
    pub deadline: Option<Duration>,
}

impl DiagnoseOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_client_ip(mut self, client_ip: IpAddr) -> Self {
        self.client_ip = Some(client_ip);
        self
    }
}

enum Served {
    Cached(ConsensusResult),
    Computed(ConsensusResult),
}

impl Served {
    fn outcome(&self) -> &'static str {
        match self {
            Served::Cached(_) => "cache_hit",
            Served::Computed(_) => "success",
        }
    }

    fn into_result(self) -> ConsensusResult {
        match self {
            Served::Cached(result) | Served::Computed(result) => result,
        }
    }
}

pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    pool: Arc<AgentPool>,
    in_flight: Semaphore,
}

impl Orchestrator {
    pub fn new(ctx: Arc<OrchestratorContext>, pool: Arc<AgentPool>) -> Self {
        let permits = ctx.config.service.max_in_flight.max(1);
        Self {
            ctx,
            pool,
            in_flight: Semaphore::new(permits),
        }
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    /// Answers a diagnostic request, computing it at most once per fingerprint
    pub async fn diagnose(&self, request: DiagnosticRequest, options: DiagnoseOptions) -> Result<ConsensusResult> {
        self.diagnose_with_retry(request, options, &RetryPolicy::never()).await
    }

    /// Like [`Orchestrator::diagnose`], retrying lock contention per `retry`.
    /// The caller is admitted once; retries do not consume rate-limit tokens.
    pub async fn diagnose_with_retry(
        &self,
        request: DiagnosticRequest,
        options: DiagnoseOptions,
        retry: &RetryPolicy,
    ) -> Result<ConsensusResult> {
        let correlation_id = request.request_id.to_string();
        with_correlation_id(correlation_id, self.run(request, options, retry)).await
    }

    async fn run(&self, request: DiagnosticRequest, options: DiagnoseOptions, retry: &RetryPolicy) -> Result<ConsensusResult> {
        let started = Instant::now();
        let deadline = options.deadline.map(|budget| started + budget);

        let fingerprint = self.ctx.fingerprinter.fingerprint(&request);
        let served = match &fingerprint {
            Ok(fingerprint) => {
                let caller = Caller::tenant(&request.tenant_id).with_ip(options.client_ip);
                let admitted = self
                    .ctx
                    .rate_limiter
                    .admit(&caller, Tier::Orchestration)
                    .and_then(|()| self.ctx.tenants.ensure_active(&request.tenant_id));
                match admitted {
                    Ok(()) => {
                        retry
                            .retry("diagnose", || self.orchestrate(&request, fingerprint, deadline))
                            .await
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err.clone()),
        };

        let outcome = match &served {
            Ok(served) => served.outcome(),
            Err(err) => err.kind().as_str(),
        };
        let elapsed = started.elapsed();
        self.ctx.metrics.record_orchestration(outcome, elapsed);
        self.ctx.collaborators.audit(AuditEvent::new(
            "diagnose",
            &request.tenant_id,
            fingerprint.as_ref().ok(),
            outcome,
        ));

        match served {
            Ok(served) => {
                info!(
                    tenant = %request.tenant_id,
                    outcome,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Diagnosis served"
                );
                Ok(served.into_result())
            }
            Err(err) => {
                warn!(tenant = %request.tenant_id, error = %err, "Diagnosis failed");
                Err(err)
            }
        }
    }

    async fn orchestrate(
        &self,
        request: &DiagnosticRequest,
        fingerprint: &Fingerprint,
        deadline: Option<Instant>,
    ) -> Result<Served> {
        let permit = match deadline {
            Some(deadline) => timeout_at(deadline, self.in_flight.acquire())
                .await
                .map_err(|_| Error::Timeout {
                    stage: "in-flight slot".to_string(),
                    fingerprint: Some(fingerprint.to_string()),
                })?,
            None => self.in_flight.acquire().await,
        };
        let _permit = permit.map_err(|_| Error::internal("orchestrator is shutting down"))?;

        if let Some(result) = self.ctx.cache.get(fingerprint).await {
            debug!(fingerprint = %fingerprint.short(), "Cache hit");
            return Ok(Served::Cached(result));
        }

        let guard = match self.ctx.cache.acquire_with_wait(fingerprint, deadline).await? {
            Acquisition::Cached(result) => return Ok(Served::Cached(result)),
            Acquisition::Locked(guard) => guard,
        };

        if let Err(err) = self.ctx.tenants.check_and_consume(&request.tenant_id) {
            release(guard, fingerprint).await;
            return Err(err);
        }

        let result = match self.compute(request, fingerprint, deadline).await {
            Ok(result) => result,
            Err(err) => {
                release(guard, fingerprint).await;
                return Err(err);
            }
        };

        match guard.commit(&result).await {
            Ok(()) => {}
            Err(err @ Error::StaleLock { .. }) => {
                // Our lock expired mid-computation; the newer holder's write wins
                warn!(fingerprint = %fingerprint.short(), error = %err, "Result not cached, lock superseded");
                metrics::counter!("stale_lock_total", 1);
            }
            Err(err) => {
                warn!(fingerprint = %fingerprint.short(), error = %err, "Failed to cache consensus result");
            }
        }

        self.notify_red_flags(&result).await;
        Ok(Served::Computed(result))
    }

    async fn compute(
        &self,
        request: &DiagnosticRequest,
        fingerprint: &Fingerprint,
        deadline: Option<Instant>,
    ) -> Result<ConsensusResult> {
        let outcomes = self.pool.fan_out(request, deadline).await;

        let mut findings = Vec::with_capacity(outcomes.len());
        let mut degraded = Vec::new();
        for outcome in outcomes {
            match outcome {
                AgentOutcome::Finding(finding) => {
                    let weight = self.pool.weight_of(&finding.agent);
                    findings.push((finding, weight));
                }
                AgentOutcome::Degraded(agent) => degraded.push(agent),
            }
        }

        let required = self.ctx.config.agents.quorum;
        if findings.len() < required {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(Error::Timeout {
                    stage: "agent fan-out".to_string(),
                    fingerprint: Some(fingerprint.to_string()),
                });
            }
            return Err(Error::InsufficientConsensus {
                fingerprint: fingerprint.to_string(),
                tenant: request.tenant_id.clone(),
                succeeded: findings.len(),
                required,
            });
        }
        if !degraded.is_empty() {
            info!(
                fingerprint = %fingerprint.short(),
                succeeded = findings.len(),
                degraded = degraded.len(),
                "Consensus proceeding with degraded agents"
            );
        }

        self.ctx.consensus.build(ConsensusInput {
            fingerprint: fingerprint.clone(),
            tenant_id: request.tenant_id.clone(),
            priority: request.priority,
            findings,
            degraded,
        })
    }

    async fn notify_red_flags(&self, result: &ConsensusResult) {
        for flag in &result.red_flags {
            self.ctx
                .collaborators
                .notify(
                    Notification {
                        severity: flag.severity,
                        message: format!(
                            "[{}] {} reported: {} (fingerprint {})",
                            result.tenant_id,
                            flag.agent,
                            flag.message,
                            result.fingerprint.short()
                        ),
                        destination: result.tenant_id.clone(),
                    },
                    NOTIFY_TIMEOUT,
                )
                .await;
        }
    }

    /// Fetches a cached consensus the caller's tenant owns
    pub async fn lookup(&self, caller: &Caller, fingerprint: &Fingerprint) -> Result<Option<ConsensusResult>> {
        self.ctx.rate_limiter.admit(caller, Tier::General)?;
        Ok(self
            .ctx
            .cache
            .get(fingerprint)
            .await
            .filter(|result| caller.tenant_id.as_deref() == Some(result.tenant_id.as_str())))
    }

    /// Forces a dependency's breaker closed
    pub async fn reset_breaker(&self, caller: &Caller, dependency: &str) -> Result<CircuitHealth> {
        self.ctx.rate_limiter.admit(caller, Tier::Administrative)?;
        self.ctx.breaker.reset(dependency);
        self.audit_admin("reset_breaker", caller);
        Ok(self.ctx.breaker.health(dependency))
    }

    pub async fn reset_tenant_usage(&self, caller: &Caller, tenant_id: &str) -> Result<TenantStats> {
        self.ctx.rate_limiter.admit(caller, Tier::Administrative)?;
        let stats = self.ctx.tenants.reset_usage(tenant_id)?;
        self.audit_admin("reset_tenant_usage", caller);
        Ok(stats)
    }

    fn audit_admin(&self, event_type: &str, caller: &Caller) {
        let tenant = caller.tenant_id.as_deref().unwrap_or("-");
        self.ctx
            .collaborators
            .audit(AuditEvent::new(event_type, tenant, None, "success"));
    }

    pub fn health(&self) -> HealthReport {
        self.ctx.health.report(&self.ctx.breaker)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot(&self.ctx.breaker)
    }
}

async fn release(guard: LockGuard, fingerprint: &Fingerprint) {
    if let Err(err) = guard.release().await {
        warn!(fingerprint = %fingerprint.short(), error = %err, "Failed to release computation lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::ScriptedAgent;
    use crate::agents::HeuristicAgent;
    use crate::collaborators::tests::MockNotifier;
    use crate::collaborators::{Collaborators, TracingAuditSink};
    use config_rs::OrchestratorConfig;
    use error_handling::{CircuitState, RetryConfig};
    use shared_types::{Capability, FlagSeverity};

    fn context(notifier: Option<MockNotifier>) -> Arc<OrchestratorContext> {
        let collaborators = match notifier {
            Some(notifier) => Collaborators {
                audit: Arc::new(TracingAuditSink),
                notifier: Arc::new(notifier),
            },
            None => Collaborators::default(),
        };
        OrchestratorContext::with_store(OrchestratorConfig::default(), collaborators, None).unwrap()
    }

    fn context_with(config: OrchestratorConfig) -> Arc<OrchestratorContext> {
        OrchestratorContext::with_store(config, Collaborators::default(), None).unwrap()
    }

    fn orchestrator(ctx: Arc<OrchestratorContext>, agents: Vec<Arc<ScriptedAgent>>) -> Orchestrator {
        let mut pool = AgentPool::new(ctx.breaker.clone(), ctx.config.agents.call_timeout());
        for agent in agents {
            pool.register(agent, 1.0).unwrap();
        }
        Orchestrator::new(ctx, Arc::new(pool))
    }

    fn dns_agents() -> Vec<Arc<ScriptedAgent>> {
        vec![
            Arc::new(ScriptedAgent::new("infra", Capability::InfrastructureAnalysis, "DNS forwarder misconfiguration", 0.9)),
            Arc::new(ScriptedAgent::new("directory", Capability::DirectoryAndAuthAnalysis, "DNS forwarder misconfiguration", 0.85)),
            Arc::new(ScriptedAgent::new("security", Capability::SecurityAudit, "Expired TLS certificate", 0.2)),
        ]
    }

    #[tokio::test]
    async fn test_second_identical_request_is_served_from_cache() {
        let agents = dns_agents();
        let orchestrator = orchestrator(context(None), agents.clone());
        let request = DiagnosticRequest::new("acme", "DNS lookups failing for internal zones");

        let first = orchestrator.diagnose(request.clone(), DiagnoseOptions::default()).await.unwrap();
        let second = orchestrator
            .diagnose(DiagnosticRequest::new("acme", "  dns lookups FAILING for internal zones "), DiagnoseOptions::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.diagnosis, "DNS forwarder misconfiguration");
        assert!(agents.iter().all(|a| a.calls() == 1));

        let snapshot = orchestrator.metrics();
        assert_eq!(snapshot.cache.hits, 1);
        assert_eq!(snapshot.orchestrations.get("cache_hit"), Some(&1));
    }

    #[tokio::test]
    async fn test_quorum_failure_releases_lock() {
        let agents = vec![
            Arc::new(ScriptedAgent::new("infra", Capability::InfrastructureAnalysis, "DNS", 0.9)),
            Arc::new(ScriptedAgent::new("security", Capability::SecurityAudit, "x", 0.5).failing()),
        ];
        let orchestrator = orchestrator(context(None), agents);
        let request = DiagnosticRequest::new("acme", "DNS lookups failing");
        let fingerprint = orchestrator.ctx.fingerprinter.fingerprint(&request).unwrap();

        let err = orchestrator.diagnose(request, DiagnoseOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientConsensus { succeeded: 1, required: 2, .. }));

        // The lock was released, not left to expire
        assert!(orchestrator.ctx.cache.acquire(&fingerprint).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_converts_to_timeout() {
        let agents = vec![
            Arc::new(ScriptedAgent::new("infra", Capability::InfrastructureAnalysis, "DNS", 0.9).delayed(Duration::from_secs(10))),
            Arc::new(ScriptedAgent::new("dir", Capability::DirectoryAndAuthAnalysis, "DNS", 0.9).delayed(Duration::from_secs(10))),
        ];
        let orchestrator = orchestrator(context(None), agents);

        let err = orchestrator
            .diagnose(
                DiagnosticRequest::new("acme", "DNS lookups failing"),
                DiagnoseOptions::default().with_deadline(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref stage, .. } if stage == "agent fan-out"));
    }

    #[tokio::test]
    async fn test_red_flags_are_notified_for_fresh_results_only() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|n: &Notification| n.severity == FlagSeverity::High && n.destination == "acme")
            .times(2)
            .returning(|_| Ok(()));

        let ctx = context(Some(notifier));
        let mut pool = AgentPool::new(ctx.breaker.clone(), ctx.config.agents.call_timeout());
        pool.register(Arc::new(HeuristicAgent::security()), 1.0).unwrap();
        pool.register(Arc::new(HeuristicAgent::directory_and_auth()), 1.0).unwrap();
        let orchestrator = Orchestrator::new(ctx, Arc::new(pool));

        let request = DiagnosticRequest::new("acme", "Password spray against the domain controller");
        let result = orchestrator.diagnose(request.clone(), DiagnoseOptions::default()).await.unwrap();
        assert!(result.escalation_required);
        // Both agents raise the same incident flag; each is surfaced
        assert_eq!(result.red_flags.len(), 2);

        // Cached answers do not notify again
        orchestrator.diagnose(request, DiagnoseOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_admission() {
        let orchestrator = orchestrator(context(None), dns_agents());
        let err = orchestrator
            .diagnose(DiagnosticRequest::new("acme", "   "), DiagnoseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
        assert!(orchestrator.ctx.tenants.stats("acme").is_none());
    }

    #[tokio::test]
    async fn test_lookup_hides_other_tenants_results() {
        let orchestrator = orchestrator(context(None), dns_agents());
        let request = DiagnosticRequest::new("acme", "DNS lookups failing");
        let result = orchestrator.diagnose(request, DiagnoseOptions::default()).await.unwrap();

        let own = orchestrator.lookup(&Caller::tenant("acme"), &result.fingerprint).await.unwrap();
        assert_eq!(own, Some(result.clone()));
        let other = orchestrator.lookup(&Caller::tenant("globex"), &result.fingerprint).await.unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_administrative_operations() {
        let ctx = context(None);
        let orchestrator = orchestrator(ctx.clone(), dns_agents());
        let admin = Caller::tenant("ops");

        for _ in 0..3 {
            let _ = ctx
                .breaker
                .execute("llm_provider", async { Err::<(), _>(Error::dependency_failure("llm_provider", "503")) })
                .await;
        }
        assert!(!orchestrator.health().dependencies.is_empty());
        let health = orchestrator.reset_breaker(&admin, "llm_provider").await.unwrap();
        assert_eq!(health.state, CircuitState::Closed);

        orchestrator
            .diagnose(DiagnosticRequest::new("acme", "DNS lookups failing"), DiagnoseOptions::default())
            .await
            .unwrap();
        assert_eq!(orchestrator.reset_tenant_usage(&admin, "acme").await.unwrap().used, 0);
        assert!(orchestrator.reset_tenant_usage(&admin, "ghost").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_reuse_the_initial_admission() {
        let mut config = OrchestratorConfig::default();
        config.cache.lock_wait_ms = 100;
        let orchestrator = orchestrator(context_with(config), dns_agents());
        let request = DiagnosticRequest::new("acme", "DNS lookups failing");
        let fingerprint = orchestrator.ctx.fingerprinter.fingerprint(&request).unwrap();
        let _held = orchestrator.ctx.cache.acquire(&fingerprint).await.unwrap();

        let retry = RetryPolicy::new(
            "test",
            Some(RetryConfig {
                max_retries: 3,
                jitter_factor: 0.0,
                ..Default::default()
            }),
        );
        let err = orchestrator
            .diagnose_with_retry(request, DiagnoseOptions::default(), &retry)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        let snapshot = orchestrator.metrics();
        let orchestration = snapshot
            .rate_limits
            .iter()
            .find(|s| s.tier == Tier::Orchestration)
            .unwrap();
        assert_eq!((orchestration.admitted, orchestration.rejected), (1, 0));
        // Nothing was computed, so nothing was charged
        assert_eq!(orchestrator.ctx.tenants.stats("acme").unwrap().used, 0);
    }

    #[tokio::test]
    async fn test_cache_hits_do_not_consume_quota() {
        let mut config = OrchestratorConfig::default();
        config.tenancy.plans.insert("trial".to_string(), 1);
        config.tenancy.default_plan = "trial".to_string();
        let orchestrator = orchestrator(context_with(config), dns_agents());
        let request = DiagnosticRequest::new("acme", "DNS lookups failing");

        orchestrator.diagnose(request.clone(), DiagnoseOptions::default()).await.unwrap();
        orchestrator.diagnose(request, DiagnoseOptions::default()).await.unwrap();
        assert_eq!(orchestrator.ctx.tenants.stats("acme").unwrap().used, 1);

        let err = orchestrator
            .diagnose(DiagnosticRequest::new("acme", "Printers offline"), DiagnoseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { ref tier, .. } if tier == "daily-quota"));
    }

    #[tokio::test]
    async fn test_inactive_tenant_cannot_read_cached_results() {
        let orchestrator = orchestrator(context(None), dns_agents());
        let request = DiagnosticRequest::new("acme", "DNS lookups failing");
        orchestrator.diagnose(request.clone(), DiagnoseOptions::default()).await.unwrap();

        orchestrator.ctx.tenants.set_active("acme", false).unwrap();
        let err = orchestrator.diagnose(request, DiagnoseOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_wait_respects_deadline() {
        let mut config = OrchestratorConfig::default();
        config.service.max_in_flight = 1;
        let agents = vec![
            Arc::new(ScriptedAgent::new("infra", Capability::InfrastructureAnalysis, "DNS", 0.9).delayed(Duration::from_secs(10))),
            Arc::new(ScriptedAgent::new("dir", Capability::DirectoryAndAuthAnalysis, "DNS", 0.9).delayed(Duration::from_secs(10))),
        ];
        let orchestrator = Arc::new(orchestrator(context_with(config), agents));

        let busy = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .diagnose(DiagnosticRequest::new("acme", "DNS lookups failing"), DiagnoseOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let err = orchestrator
            .diagnose(
                DiagnosticRequest::new("acme", "Printers offline"),
                DiagnoseOptions::default().with_deadline(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref stage, .. } if stage == "in-flight slot"));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(busy.await.unwrap().is_ok());
    }
}
