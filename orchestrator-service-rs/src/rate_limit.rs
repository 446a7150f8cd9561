// Tiered token-bucket rate limiting.
//
// One bucket per (scope key, tier), created on first use and refilled lazily
// from the elapsed time whenever it is touched. A caller is checked against
// its tenant scope and its client IP scope; both must have a token.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use config_rs::{RateLimitsConfig, TierLimit};
use dashmap::DashMap;
use error_handling::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    General,
    Orchestration,
    Administrative,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::General => "general",
            Tier::Orchestration => "orchestration",
            Tier::Administrative => "administrative",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is calling: the tenant and, when known, the client address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub tenant_id: Option<String>,
    pub client_ip: Option<IpAddr>,
}

impl Caller {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            client_ip: None,
        }
    }

    pub fn with_ip(mut self, client_ip: Option<IpAddr>) -> Self {
        self.client_ip = client_ip;
        self
    }

    fn scope_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(tenant) = &self.tenant_id {
            keys.push(format!("tenant:{}", tenant));
        }
        if let Some(ip) = &self.client_ip {
            keys.push(format!("ip:{}", ip));
        }
        if keys.is_empty() {
            keys.push("anonymous".to_string());
        }
        keys
    }
}

#[derive(Debug, Clone, Copy)]
struct BucketShape {
    capacity: f64,
    refill_per_sec: f64,
}

impl From<&TierLimit> for BucketShape {
    fn from(limit: &TierLimit) -> Self {
        Self {
            capacity: f64::from(limit.capacity()),
            refill_per_sec: limit.refill_per_sec(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(shape: BucketShape, now: Instant) -> Self {
        Self {
            tokens: shape.capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, shape: BucketShape, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * shape.refill_per_sec).min(shape.capacity);
        self.last_refill = now;
    }

    /// Takes a token, or reports how long until one is available
    fn try_take(&mut self, shape: BucketShape, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(shape, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / shape.refill_per_sec))
        }
    }
}

pub struct RateLimiter {
    general: BucketShape,
    orchestration: BucketShape,
    administrative: BucketShape,
    idle_eviction: Duration,
    buckets: DashMap<(String, Tier), Bucket>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitsConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            general: (&config.general).into(),
            orchestration: (&config.orchestration).into(),
            administrative: (&config.administrative).into(),
            idle_eviction: Duration::from_secs(config.idle_eviction_secs),
            buckets: DashMap::new(),
            metrics,
        }
    }

    fn shape(&self, tier: Tier) -> BucketShape {
        match tier {
            Tier::General => self.general,
            Tier::Orchestration => self.orchestration,
            Tier::Administrative => self.administrative,
        }
    }

    /// Consumes one token from the bucket of `key` in `tier`
    pub fn allow(&self, key: &str, tier: Tier) -> Result<()> {
        let outcome = self.take(key, tier);
        self.metrics.record_admission(tier, outcome.is_ok());
        outcome
    }

    fn take(&self, key: &str, tier: Tier) -> Result<()> {
        let shape = self.shape(tier);
        let now = Instant::now();
        let outcome = self
            .buckets
            .entry((key.to_string(), tier))
            .or_insert_with(|| Bucket::full(shape, now))
            .try_take(shape, now);

        outcome.map_err(|retry_after| {
            debug!(scope = %key, tier = %tier, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
            Error::RateLimitExceeded {
                scope: key.to_string(),
                tier: tier.to_string(),
                retry_after,
            }
        })
    }

    /// Admits a caller only if every one of its scopes has a token.
    /// Tokens taken from earlier scopes are handed back on rejection.
    /// Counts as a single decision in the admission metrics.
    pub fn admit(&self, caller: &Caller, tier: Tier) -> Result<()> {
        let keys = caller.scope_keys();
        for (index, key) in keys.iter().enumerate() {
            if let Err(err) = self.take(key, tier) {
                for taken in &keys[..index] {
                    self.refund(taken, tier);
                }
                self.metrics.record_admission(tier, false);
                warn!(scope = %key, tier = %tier, "Request rejected by rate limiter");
                return Err(err);
            }
        }
        self.metrics.record_admission(tier, true);
        Ok(())
    }

    fn refund(&self, key: &str, tier: Tier) {
        let shape = self.shape(tier);
        if let Some(mut bucket) = self.buckets.get_mut(&(key.to_string(), tier)) {
            bucket.tokens = (bucket.tokens + 1.0).min(shape.capacity);
        }
    }

    /// Removes buckets untouched for longer than the idle window
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= self.idle_eviction);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate-limit buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn limiter(per_minute: u32, burst: Option<u32>) -> RateLimiter {
        limiter_with_metrics(per_minute, burst, Arc::new(Metrics::new()))
    }

    fn limiter_with_metrics(per_minute: u32, burst: Option<u32>, metrics: Arc<Metrics>) -> RateLimiter {
        let limit = TierLimit {
            requests_per_minute: per_minute,
            burst,
        };
        let config = RateLimitsConfig {
            general: limit.clone(),
            orchestration: limit.clone(),
            administrative: limit,
            idle_eviction_secs: 300,
        };
        RateLimiter::new(&config, metrics)
    }

    fn counts(metrics: &Metrics, tier: Tier) -> (u64, u64) {
        metrics
            .snapshot(&error_handling::CircuitBreaker::default())
            .rate_limits
            .iter()
            .find(|s| s.tier == tier)
            .map(|s| (s.admitted, s.rejected))
            .unwrap_or((0, 0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_capacity_then_refills_at_rate() {
        // 60/min = one token per second, bucket of 5
        let rl = limiter(60, Some(5));

        for _ in 0..5 {
            assert!(rl.allow("tenant:acme", Tier::Orchestration).is_ok());
        }
        let err = rl.allow("tenant:acme", Tier::Orchestration).unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        advance(Duration::from_millis(999)).await;
        assert!(rl.allow("tenant:acme", Tier::Orchestration).is_err());

        advance(Duration::from_secs(2)).await;
        assert!(rl.allow("tenant:acme", Tier::Orchestration).is_ok());
        assert!(rl.allow("tenant:acme", Tier::Orchestration).is_ok());
        assert!(rl.allow("tenant:acme", Tier::Orchestration).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let rl = limiter(60, Some(3));
        advance(Duration::from_secs(3600)).await;

        let admitted = (0..10).filter(|_| rl.allow("k", Tier::General).is_ok()).count();
        assert_eq!(admitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiers_and_keys_are_independent() {
        let rl = limiter(60, Some(1));
        assert!(rl.allow("tenant:acme", Tier::Orchestration).is_ok());
        assert!(rl.allow("tenant:acme", Tier::Orchestration).is_err());

        assert!(rl.allow("tenant:acme", Tier::Administrative).is_ok());
        assert!(rl.allow("tenant:globex", Tier::Orchestration).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_rejection_refunds_tenant_token() {
        let rl = limiter(60, Some(1));
        let ip: IpAddr = "10.0.0.7".parse().unwrap();

        // Exhaust the IP scope through another tenant
        assert!(rl.admit(&Caller::tenant("globex").with_ip(Some(ip)), Tier::General).is_ok());

        let err = rl
            .admit(&Caller::tenant("acme").with_ip(Some(ip)), Tier::General)
            .unwrap_err();
        assert!(matches!(err, Error::RateLimitExceeded { ref scope, .. } if scope == "ip:10.0.0.7"));

        // acme's own token is still there
        assert!(rl.admit(&Caller::tenant("acme"), Tier::General).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refunded_scope_is_not_counted_as_admitted() {
        let metrics = Arc::new(Metrics::new());
        let rl = limiter_with_metrics(60, Some(1), Arc::clone(&metrics));
        let ip: IpAddr = "10.0.0.7".parse().unwrap();

        rl.admit(&Caller::tenant("globex").with_ip(Some(ip)), Tier::General).unwrap();
        assert!(rl.admit(&Caller::tenant("acme").with_ip(Some(ip)), Tier::General).is_err());

        // One admitted caller, one rejected caller; scopes are not tallied
        assert_eq!(counts(&metrics, Tier::General), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_metrics_do_not_grow_with_callers() {
        let metrics = Arc::new(Metrics::new());
        let rl = limiter_with_metrics(600, None, Arc::clone(&metrics));

        for n in 0..50u8 {
            let ip = IpAddr::from([10, 0, 0, n]);
            rl.admit(&Caller::tenant(format!("tenant-{}", n)).with_ip(Some(ip)), Tier::General)
                .unwrap();
        }

        let snapshot = metrics.snapshot(&error_handling::CircuitBreaker::default());
        assert_eq!(snapshot.rate_limits.len(), 1);
        assert_eq!(counts(&metrics, Tier::General), (50, 0));

        advance(Duration::from_secs(301)).await;
        assert_eq!(rl.evict_idle(), 100);
        assert_eq!(rl.bucket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_buckets_are_evicted() {
        let rl = limiter(60, None);
        rl.allow("tenant:acme", Tier::General).unwrap();
        rl.allow("tenant:globex", Tier::General).unwrap();

        advance(Duration::from_secs(200)).await;
        rl.allow("tenant:globex", Tier::General).unwrap();
        advance(Duration::from_secs(200)).await;

        assert_eq!(rl.evict_idle(), 1);
        assert_eq!(rl.bucket_count(), 1);
    }
}
