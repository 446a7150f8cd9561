//! config-rs/lib.rs
//! Layered configuration for the orchestrator service.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file,
//! then `DIAG__`-prefixed environment variables with `__` between path
//! segments (`DIAG__AGENTS__QUORUM=3`). A `.env` file is read before the
//! environment is consulted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use error_handling::{CircuitBreakerConfig, Error, LoggingConfig, Result, RetryConfig};
use serde::{Deserialize, Serialize};
use shared_types::{dependency, Capability, FlagSeverity};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "DIAG";

/// Root configuration for the orchestrator service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub breakers: BreakersConfig,
    pub rate_limits: RateLimitsConfig,
    pub tenancy: TenancyConfig,
    pub cache: CacheConfig,
    pub agents: AgentsConfig,
    pub consensus: ConsensusConfig,
    pub health: HealthConfig,
    pub metrics: MetricsConfig,
    pub retry: ClientRetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Holder identity used for distributed locks; generated when unset
    pub instance_id: Option<String>,
    /// Concurrent requests served by the stdin front end
    pub max_in_flight: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "orchestrator-service".to_string(),
            instance_id: None,
            max_in_flight: 32,
        }
    }
}

/// Settings for one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cool_down_secs: u64,
    pub failure_window_secs: u64,
}

impl BreakerSettings {
    pub fn new(failure_threshold: u32, cool_down_secs: u64) -> Self {
        Self {
            failure_threshold,
            cool_down_secs,
            ..Default::default()
        }
    }

    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cool_down: Duration::from_secs(self.cool_down_secs),
            failure_window: Duration::from_secs(self.failure_window_secs),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_secs: 60,
            failure_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakersConfig {
    pub default: BreakerSettings,
    /// Per-dependency overrides keyed by dependency name
    pub dependencies: HashMap<String, BreakerSettings>,
}

impl Default for BreakersConfig {
    fn default() -> Self {
        let mut dependencies = HashMap::new();
        dependencies.insert(dependency::LLM_PROVIDER.to_string(), BreakerSettings::new(3, 120));
        dependencies.insert(dependency::DATABASE.to_string(), BreakerSettings::new(5, 60));
        dependencies.insert(dependency::CACHE.to_string(), BreakerSettings::new(3, 30));
        Self {
            default: BreakerSettings::default(),
            dependencies,
        }
    }
}

impl BreakersConfig {
    /// Effective settings for a dependency
    pub fn for_dependency(&self, dependency: &str) -> &BreakerSettings {
        self.dependencies.get(dependency).unwrap_or(&self.default)
    }
}

/// Token bucket shape for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimit {
    /// Sustained refill rate
    pub requests_per_minute: u32,
    /// Bucket capacity; defaults to one minute's worth
    pub burst: Option<u32>,
}

impl TierLimit {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            burst: None,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.burst.unwrap_or(self.requests_per_minute)
    }

    /// Tokens added per second
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }
}

impl Default for TierLimit {
    fn default() -> Self {
        Self::per_minute(100)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub general: TierLimit,
    pub orchestration: TierLimit,
    pub administrative: TierLimit,
    /// Buckets untouched for this long are evicted
    pub idle_eviction_secs: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            general: TierLimit::per_minute(100),
            orchestration: TierLimit::per_minute(10),
            administrative: TierLimit::per_minute(200),
            idle_eviction_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    /// Daily request ceilings keyed by plan name
    pub plans: HashMap<String, u64>,
    pub default_plan: String,
    /// Provision unknown tenants on the default plan instead of rejecting them
    pub allow_unknown_tenants: bool,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        let plans = [("free", 100), ("pro", 1000), ("enterprise", 10_000)]
            .into_iter()
            .map(|(name, limit)| (name.to_string(), limit))
            .collect();
        Self {
            plans,
            default_plan: "free".to_string(),
            allow_unknown_tenants: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Distributed store; process-local only when unset
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub result_ttl_secs: u64,
    pub lock_ttl_ms: u64,
    /// Longest a request waits on another holder's lock
    pub lock_wait_ms: u64,
    pub poll_interval_ms: u64,
    /// Lock statistics for fingerprints idle this long are dropped
    pub stats_retention_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "diag".to_string(),
            result_ttl_secs: 3600,
            lock_ttl_ms: 30_000,
            lock_wait_ms: 10_000,
            poll_interval_ms: 50,
            stats_retention_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stats_retention(&self) -> Duration {
        Duration::from_secs(self.stats_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Upper bound on a single agent call
    pub call_timeout_ms: u64,
    /// Minimum successful agents for a valid consensus
    pub quorum: usize,
    /// Authority weight per capability name; missing capabilities weigh 1.0
    pub weights: HashMap<String, f64>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 20_000,
            quorum: 2,
            weights: Capability::ALL
                .iter()
                .map(|c| (c.as_str().to_string(), 1.0))
                .collect(),
        }
    }
}

impl AgentsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn weight_for(&self, capability: Capability) -> f64 {
        self.weights.get(capability.as_str()).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Findings below this confidence do not vote
    pub confidence_floor: f64,
    /// Token Jaccard similarity at which two diagnoses agree
    pub similarity_threshold: f64,
    /// Lowest flag severity surfaced as a red flag
    pub red_flag_severity: FlagSeverity,
    /// Confidence discount at zero agreement
    pub disagreement_penalty: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.1,
            similarity_threshold: 0.5,
            red_flag_severity: FlagSeverity::High,
            disagreement_penalty: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// Liveness fails when the loop has not ticked for this long
    pub liveness_grace_secs: u64,
    pub history_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_ms: 5_000,
            liveness_grace_secs: 90,
            history_size: 100,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn liveness_grace(&self) -> Duration {
        Duration::from_secs(self.liveness_grace_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9464`
    pub prometheus_listen: Option<String>,
}

impl MetricsConfig {
    pub fn listen_addr(&self) -> Result<Option<SocketAddr>> {
        self.prometheus_listen
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| Error::Configuration(format!("invalid metrics address '{}': {}", addr, e)))
            })
            .transpose()
    }
}

/// Retry policy the front end applies to lock contention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientRetryConfig {
    pub max_retries: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_factor: f64,
    /// Also retry rate-limit rejections after their retry-after hint
    pub retry_rate_limited: bool,
}

impl Default for ClientRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
            jitter_factor: 0.1,
            retry_rate_limited: false,
        }
    }
}

impl ClientRetryConfig {
    pub fn to_retry_config(&self) -> RetryConfig {
        let mut config = RetryConfig {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter_factor: self.jitter_factor,
            ..Default::default()
        };
        if self.retry_rate_limited {
            config.retryable.push(error_handling::ErrorKind::RateLimitExceeded);
        }
        config
    }
}

impl OrchestratorConfig {
    /// Loads defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env is normal outside development
        dotenv::dotenv().ok();

        let mut builder = Config::builder().add_source(defaults_source()?);
        if let Some(path) = path {
            log::info!("Loading configuration file {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: OrchestratorConfig = builder
            .build()
            .and_then(Config::try_deserialize::<OrchestratorConfig>)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document layered over the defaults; the environment is not read
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: OrchestratorConfig = Config::builder()
            .add_source(defaults_source()?)
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()
            .and_then(Config::try_deserialize::<OrchestratorConfig>)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Configuration(msg));

        if self.agents.quorum == 0 {
            return fail("agents.quorum must be at least 1".into());
        }
        if self.agents.call_timeout_ms == 0 {
            return fail("agents.call_timeout_ms must be positive".into());
        }
        if let Some((name, weight)) = self.agents.weights.iter().find(|(_, w)| !w.is_finite() || **w <= 0.0) {
            return fail(format!("agents.weights.{} must be positive, got {}", name, weight));
        }
        for name in self.agents.weights.keys() {
            name.parse::<Capability>()?;
        }

        let c = &self.consensus;
        if !(0.0..=1.0).contains(&c.confidence_floor) {
            return fail(format!("consensus.confidence_floor must be within [0, 1], got {}", c.confidence_floor));
        }
        if !(c.similarity_threshold > 0.0 && c.similarity_threshold <= 1.0) {
            return fail(format!("consensus.similarity_threshold must be within (0, 1], got {}", c.similarity_threshold));
        }
        if !(0.0..=1.0).contains(&c.disagreement_penalty) {
            return fail(format!("consensus.disagreement_penalty must be within [0, 1], got {}", c.disagreement_penalty));
        }

        for (tier, limit) in [
            ("general", &self.rate_limits.general),
            ("orchestration", &self.rate_limits.orchestration),
            ("administrative", &self.rate_limits.administrative),
        ] {
            if limit.requests_per_minute == 0 || limit.capacity() == 0 {
                return fail(format!("rate_limits.{} must admit at least one request", tier));
            }
        }

        for (name, settings) in std::iter::once(("default", &self.breakers.default))
            .chain(self.breakers.dependencies.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if settings.failure_threshold == 0 {
                return fail(format!("breakers.{}.failure_threshold must be at least 1", name));
            }
        }

        if !self.tenancy.plans.contains_key(&self.tenancy.default_plan) {
            return fail(format!("tenancy.default_plan '{}' is not a configured plan", self.tenancy.default_plan));
        }

        if self.cache.lock_ttl_ms == 0 || self.cache.poll_interval_ms == 0 {
            return fail("cache.lock_ttl_ms and cache.poll_interval_ms must be positive".into());
        }
        if self.cache.result_ttl_secs == 0 {
            return fail("cache.result_ttl_secs must be positive".into());
        }
        if self.health.interval_secs == 0 || self.health.history_size == 0 {
            return fail("health.interval_secs and health.history_size must be positive".into());
        }

        self.metrics.listen_addr()?;

        if self.cache.redis_url.is_none() {
            log::warn!("cache.redis_url not set, deduplication is limited to this process");
        }
        Ok(())
    }
}

fn defaults_source() -> Result<Config> {
    Config::try_from(&OrchestratorConfig::default()).map_err(|e| Error::Configuration(e.to_string()))
}
