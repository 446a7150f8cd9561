//! Process-wide orchestrator state.
//!
//! Breakers, rate-limit buckets, tenant quotas and the cache live here and are
//! handed to callers by reference. There is no ambient global state; a test
//! can run several contexts side by side to stand in for several processes.

use std::sync::Arc;

use config_rs::OrchestratorConfig;
use error_handling::{CircuitBreaker, Result};
use shared_types::{dependency, RequestFingerprinter};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheManager, CacheSettings, CacheStore, RedisStore};
use crate::collaborators::Collaborators;
use crate::consensus::ConsensusBuilder;
use crate::health::HealthState;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::tenancy::TenantRegistry;

pub struct OrchestratorContext {
    pub config: OrchestratorConfig,
    /// Lock holder identity of this process
    pub instance_id: String,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: RateLimiter,
    pub tenants: TenantRegistry,
    pub cache: Arc<CacheManager>,
    pub collaborators: Collaborators,
    pub fingerprinter: RequestFingerprinter,
    pub consensus: ConsensusBuilder,
    pub health: HealthState,
    shutdown: watch::Sender<bool>,
}

impl OrchestratorContext {
    /// Builds the context, connecting to the distributed cache when one is configured.
    ///
    /// An unreachable cache is not fatal: the context starts in degraded,
    /// process-local mode and the store keeps trying to connect on use and on
    /// every health probe.
    pub async fn initialize(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        let store = match config.cache.redis_url.clone() {
            Some(url) => Some(RedisStore::connect(&url, &config.cache.key_prefix).await?),
            None => None,
        };
        let connected = match &store {
            Some(store) => store.is_connected().await,
            None => true,
        };

        let ctx = Self::with_store(
            config,
            collaborators,
            store.map(|store| Arc::new(store) as Arc<dyn CacheStore>),
        )?;
        if !connected {
            warn!("Distributed cache unreachable at startup");
            ctx.cache.mark_degraded("distributed cache unreachable at startup");
        }
        Ok(ctx)
    }

    /// Builds the context around an explicit distributed store (or none)
    pub fn with_store(
        config: OrchestratorConfig,
        collaborators: Collaborators,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let instance_id = config
            .service
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.service.name, Uuid::new_v4().simple()));

        let breaker = Arc::new(
            config
                .breakers
                .dependencies
                .iter()
                .fold(
                    CircuitBreaker::new(config.breakers.default.to_breaker_config()),
                    |breaker, (name, settings)| breaker.with_dependency_config(name.clone(), settings.to_breaker_config()),
                ),
        );
        breaker.register(dependency::CACHE);

        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(CacheManager::new(
            CacheSettings::from(&config.cache),
            instance_id.clone(),
            store,
            Arc::clone(&breaker),
            Arc::clone(&metrics),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(
            instance_id = %instance_id,
            distributed_cache = cache.distributed().is_some(),
            quorum = config.agents.quorum,
            "Orchestrator context initialized"
        );

        Ok(Arc::new(Self {
            rate_limiter: RateLimiter::new(&config.rate_limits, Arc::clone(&metrics)),
            tenants: TenantRegistry::new(&config.tenancy),
            consensus: ConsensusBuilder::new(&config.consensus),
            health: HealthState::new(&config.health),
            fingerprinter: RequestFingerprinter::new(),
            instance_id,
            breaker,
            metrics,
            cache,
            collaborators,
            shutdown,
            config,
        }))
    }

    /// Signals background tasks to stop
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(instance_id = %self.instance_id, "Orchestrator context shutting down");
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentPool;
    use crate::cache::tests::UnreachableStore;
    use crate::health::HealthMonitor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_breaker_overrides_come_from_config() {
        let ctx = OrchestratorContext::with_store(OrchestratorConfig::default(), Collaborators::default(), None).unwrap();

        for _ in 0..3 {
            let _ = ctx
                .breaker
                .execute(dependency::LLM_PROVIDER, async {
                    Err::<(), _>(error_handling::Error::dependency_failure(dependency::LLM_PROVIDER, "503"))
                })
                .await;
        }
        assert_eq!(ctx.breaker.state(dependency::LLM_PROVIDER), error_handling::CircuitState::Open);
        assert!(ctx.instance_id.starts_with(&ctx.config.service.name));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = OrchestratorConfig::default();
        config.agents.quorum = 0;
        assert!(OrchestratorContext::with_store(config, Collaborators::default(), None).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let ctx = OrchestratorContext::with_store(
            OrchestratorConfig::default(),
            Collaborators::default(),
            Some(Arc::new(UnreachableStore::default()) as Arc<dyn CacheStore>),
        )
        .unwrap();
        let mut signal = ctx.shutdown_signal();

        ctx.shutdown();
        signal.changed().await.unwrap();
        assert!(*signal.borrow());
        assert!(ctx.is_shutting_down());
    }

    #[tokio::test]
    async fn test_unreachable_redis_at_startup_keeps_the_store() {
        let mut config = OrchestratorConfig::default();
        // Nothing listens on port 1
        config.cache.redis_url = Some("redis://127.0.0.1:1/".to_string());

        let ctx = OrchestratorContext::initialize(config, Collaborators::default()).await.unwrap();
        assert!(ctx.cache.distributed().is_some());
        assert!(ctx.cache.is_degraded());

        let pool = AgentPool::new(Arc::clone(&ctx.breaker), Duration::from_secs(1));
        let probes = HealthMonitor::standard_probes(&ctx, &pool);
        assert!(probes.iter().any(|probe| probe.dependency() == dependency::CACHE));
    }

    #[tokio::test]
    async fn test_malformed_redis_url_is_a_configuration_error() {
        let mut config = OrchestratorConfig::default();
        config.cache.redis_url = Some("not a url".to_string());

        let err = OrchestratorContext::initialize(config, Collaborators::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, error_handling::Error::Configuration(_)));
    }
}
