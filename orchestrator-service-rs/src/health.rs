//! # Health Monitor
//!
//! Background loop that probes every dependency through its circuit breaker,
//! so breaker state tracks ambient health even without live traffic, and runs
//! periodic maintenance on rate-limit buckets and local cache state.
//!
//! - Liveness: the loop has ticked within the configured grace period
//! - Startup: the first full probe cycle has completed
//! - Readiness: started, and no critical dependency's breaker is open

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config_rs::HealthConfig;
use error_handling::{CircuitBreaker, CircuitState, Error, Result};
use serde::Serialize;
use shared_types::dependency;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agents::{AgentPool, AnalysisAgent};
use crate::cache::CacheStore;
use crate::context::OrchestratorContext;

/// A lightweight reachability check for one dependency
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    /// Breaker the probe reports into
    fn dependency(&self) -> &str;

    /// Critical dependencies gate readiness
    fn critical(&self) -> bool;

    async fn check(&self) -> Result<()>;
}

/// Pings the distributed cache store
pub struct CacheStoreProbe {
    store: Arc<dyn CacheStore>,
}

impl CacheStoreProbe {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DependencyProbe for CacheStoreProbe {
    fn dependency(&self) -> &str {
        dependency::CACHE
    }

    // Losing the cache only costs cross-process deduplication
    fn critical(&self) -> bool {
        false
    }

    async fn check(&self) -> Result<()> {
        self.store.ping().await
    }
}

/// Probes every agent served by one provider
pub struct AgentProviderProbe {
    dependency: String,
    agents: Vec<Arc<dyn AnalysisAgent>>,
}

impl AgentProviderProbe {
    pub fn new(dependency: impl Into<String>, agents: Vec<Arc<dyn AnalysisAgent>>) -> Self {
        Self {
            dependency: dependency.into(),
            agents,
        }
    }
}

#[async_trait]
impl DependencyProbe for AgentProviderProbe {
    fn dependency(&self) -> &str {
        &self.dependency
    }

    fn critical(&self) -> bool {
        true
    }

    async fn check(&self) -> Result<()> {
        for agent in &self.agents {
            agent.probe().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub dependency: String,
    pub healthy: bool,
    pub error: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub at: DateTime<Utc>,
    pub probes: Vec<ProbeResult>,
    pub evicted_buckets: usize,
    pub purged_cache_records: usize,
}

impl CycleSummary {
    pub fn all_healthy(&self) -> bool {
        self.probes.iter().all(|p| p.healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub dependency: String,
    pub critical: bool,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Outcome of the most recent probe, if the dependency is probed
    pub last_probe_healthy: Option<bool>,
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
    pub started: bool,
    pub dependencies: Vec<DependencyHealth>,
    pub last_cycle: Option<CycleSummary>,
}

/// Health signals shared between the monitor loop and readers
#[derive(Debug)]
pub struct HealthState {
    started: AtomicBool,
    last_tick: Mutex<Instant>,
    critical: RwLock<BTreeMap<String, bool>>,
    history: Mutex<VecDeque<CycleSummary>>,
    history_size: usize,
    liveness_grace: Duration,
}

impl HealthState {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            started: AtomicBool::new(false),
            last_tick: Mutex::new(Instant::now()),
            critical: RwLock::new(BTreeMap::new()),
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            history_size: config.history_size.max(1),
            liveness_grace: config.liveness_grace(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.last_tick.lock().unwrap_or_else(PoisonError::into_inner).elapsed() <= self.liveness_grace
    }

    fn register_probe(&self, dependency: &str, critical: bool) {
        self.critical
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dependency.to_string(), critical);
    }

    fn tick(&self) {
        *self.last_tick.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn record(&self, summary: CycleSummary) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.history_size {
            history.pop_front();
        }
        history.push_back(summary);
        self.started.store(true, Ordering::Release);
    }

    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    /// Cycle summaries, oldest first
    pub fn history(&self) -> Vec<CycleSummary> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn report(&self, breaker: &CircuitBreaker) -> HealthReport {
        let critical = self.critical.read().unwrap_or_else(PoisonError::into_inner).clone();
        let last_cycle = self.last_cycle();

        let dependencies: Vec<DependencyHealth> = breaker
            .all_health()
            .into_iter()
            .map(|health| DependencyHealth {
                critical: critical.get(&health.dependency).copied().unwrap_or(false),
                last_probe_healthy: last_cycle.as_ref().and_then(|cycle| {
                    cycle
                        .probes
                        .iter()
                        .find(|p| p.dependency == health.dependency)
                        .map(|p| p.healthy)
                }),
                retry_in_ms: health.estimated_time_to_retry.map(|d| d.as_millis() as u64),
                state: health.state,
                failure_count: health.failure_count,
                dependency: health.dependency,
            })
            .collect();

        let started = self.is_started();
        let ready = started
            && !dependencies
                .iter()
                .any(|d| d.critical && d.state == CircuitState::Open);

        HealthReport {
            live: self.is_live(),
            ready,
            started,
            dependencies,
            last_cycle,
        }
    }
}

pub struct HealthMonitor {
    ctx: Arc<OrchestratorContext>,
    probes: Vec<Arc<dyn DependencyProbe>>,
}

impl HealthMonitor {
    pub fn new(ctx: Arc<OrchestratorContext>, probes: Vec<Arc<dyn DependencyProbe>>) -> Self {
        for probe in &probes {
            ctx.breaker.register(probe.dependency());
            ctx.health.register_probe(probe.dependency(), probe.critical());
        }
        Self { ctx, probes }
    }

    /// The cache store probe plus one probe per agent provider
    pub fn standard_probes(ctx: &OrchestratorContext, pool: &AgentPool) -> Vec<Arc<dyn DependencyProbe>> {
        let mut probes: Vec<Arc<dyn DependencyProbe>> = Vec::new();
        if let Some(store) = ctx.cache.distributed() {
            probes.push(Arc::new(CacheStoreProbe::new(Arc::clone(store))));
        }

        let mut providers: BTreeMap<String, Vec<Arc<dyn AnalysisAgent>>> = BTreeMap::new();
        for agent in pool.agents() {
            providers
                .entry(agent.dependency().to_string())
                .or_default()
                .push(Arc::clone(agent));
        }
        for (dependency, agents) in providers {
            probes.push(Arc::new(AgentProviderProbe::new(dependency, agents)));
        }
        probes
    }

    /// Runs every probe once, then maintenance
    pub async fn run_cycle(&self) -> CycleSummary {
        self.ctx.health.tick();
        let probe_timeout = self.ctx.config.health.probe_timeout();

        let mut probes = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            let started = Instant::now();
            let outcome = self
                .ctx
                .breaker
                .execute(probe.dependency(), async {
                    timeout(probe_timeout, probe.check())
                        .await
                        .unwrap_or_else(|_| {
                            Err(Error::Timeout {
                                stage: format!("health probe {}", probe.dependency()),
                                fingerprint: None,
                            })
                        })
                })
                .await;

            match &outcome {
                Err(err) => warn!(dependency = %probe.dependency(), error = %err, "Health probe failed"),
                Ok(()) if probe.dependency() == dependency::CACHE => self.ctx.cache.mark_recovered(),
                Ok(()) => {}
            }
            probes.push(ProbeResult {
                dependency: probe.dependency().to_string(),
                healthy: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        let evicted_buckets = self.ctx.rate_limiter.evict_idle();
        let purged_cache_records = self.ctx.cache.purge_expired();

        let summary = CycleSummary {
            at: Utc::now(),
            probes,
            evicted_buckets,
            purged_cache_records,
        };
        debug!(
            healthy = summary.all_healthy(),
            evicted_buckets,
            purged_cache_records,
            "Health cycle complete"
        );
        self.ctx.health.record(summary.clone());
        self.ctx.health.tick();
        summary
    }

    /// Runs cycles on the configured interval until the context shuts down
    pub fn spawn(self) -> JoinHandle<()> {
        let mut shutdown = self.ctx.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = interval(self.ctx.config.health.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                probes = self.probes.len(),
                interval_secs = self.ctx.config.health.interval().as_secs(),
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Health monitor shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use config_rs::OrchestratorConfig;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::advance;

    struct FlakyProbe {
        dependency: &'static str,
        critical: bool,
        healthy: AtomicBool,
        checks: AtomicUsize,
    }

    impl FlakyProbe {
        fn new(dependency: &'static str, critical: bool) -> Arc<Self> {
            Arc::new(Self {
                dependency,
                critical,
                healthy: AtomicBool::new(false),
                checks: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DependencyProbe for FlakyProbe {
        fn dependency(&self) -> &str {
            self.dependency
        }

        fn critical(&self) -> bool {
            self.critical
        }

        async fn check(&self) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::dependency_failure(self.dependency, "connection refused"))
            }
        }
    }

    fn context() -> Arc<OrchestratorContext> {
        let mut config = OrchestratorConfig::default();
        config.health.history_size = 3;
        OrchestratorContext::with_store(config, Collaborators::default(), None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_drive_breaker_and_readiness() {
        let ctx = context();
        let provider = FlakyProbe::new(dependency::LLM_PROVIDER, true);
        let monitor = HealthMonitor::new(ctx.clone(), vec![provider.clone() as Arc<dyn DependencyProbe>]);

        assert!(!ctx.health.report(&ctx.breaker).started);

        // Default llm_provider threshold is 3
        for _ in 0..3 {
            monitor.run_cycle().await;
        }
        let report = ctx.health.report(&ctx.breaker);
        assert!(report.started);
        assert!(!report.ready);
        assert_eq!(ctx.breaker.state(dependency::LLM_PROVIDER), CircuitState::Open);

        // While open, the probe is not invoked
        monitor.run_cycle().await;
        assert_eq!(provider.checks.load(Ordering::SeqCst), 3);

        // After the cool-down the probe is the half-open trial
        provider.healthy.store(true, Ordering::SeqCst);
        advance(Duration::from_secs(121)).await;
        monitor.run_cycle().await;

        let report = ctx.health.report(&ctx.breaker);
        assert!(report.ready);
        assert!(report.live);
        assert_eq!(ctx.breaker.state(dependency::LLM_PROVIDER), CircuitState::Closed);
        assert_eq!(ctx.health.history().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_critical_failure_keeps_readiness() {
        let ctx = context();
        let cache = FlakyProbe::new(dependency::CACHE, false);
        let monitor = HealthMonitor::new(ctx.clone(), vec![cache as Arc<dyn DependencyProbe>]);

        for _ in 0..3 {
            monitor.run_cycle().await;
        }
        let report = ctx.health.report(&ctx.breaker);
        assert_eq!(ctx.breaker.state(dependency::CACHE), CircuitState::Open);
        assert!(report.ready);
        assert_eq!(report.dependencies[0].last_probe_healthy, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_lapses_when_loop_stops() {
        let ctx = context();
        let monitor = HealthMonitor::new(ctx.clone(), Vec::new());
        let handle = monitor.spawn();

        tokio::task::yield_now().await;
        advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(ctx.health.is_live());
        assert!(ctx.health.is_started());

        ctx.shutdown();
        handle.await.unwrap();

        advance(ctx.config.health.liveness_grace() + Duration::from_secs(1)).await;
        assert!(!ctx.health.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_probe_success_leaves_degraded_mode() {
        let ctx = context();
        let cache = FlakyProbe::new(dependency::CACHE, false);
        let monitor = HealthMonitor::new(ctx.clone(), vec![cache.clone() as Arc<dyn DependencyProbe>]);
        ctx.cache.mark_degraded("distributed cache unreachable at startup");

        monitor.run_cycle().await;
        assert!(ctx.cache.is_degraded());

        cache.healthy.store(true, Ordering::SeqCst);
        monitor.run_cycle().await;
        assert!(!ctx.cache.is_degraded());
    }
}
