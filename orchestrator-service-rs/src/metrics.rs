//! In-process metrics registry.
//!
//! Every counter is emitted through the `metrics` facade for the Prometheus
//! exporter and also kept here so `Orchestrator::metrics()` can return a
//! snapshot without a scrape.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use error_handling::{CircuitBreaker, CircuitState};
use metrics::{counter, histogram};
use serde::Serialize;
use shared_types::Fingerprint;
use tokio::time::Instant;

use crate::rate_limit::Tier;

#[derive(Debug, Default)]
struct AdmissionCounts {
    admitted: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug)]
struct LockStats {
    acquisitions: u64,
    contended: u64,
    total_wait: Duration,
    max_wait: Duration,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct Metrics {
    /// One entry per tier; scope keys stay in the limiter, whose idle eviction bounds them
    admissions: DashMap<Tier, AdmissionCounts>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_degraded: AtomicU64,
    locks: DashMap<Fingerprint, LockStats>,
    orchestrations: DashMap<&'static str, AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub transitions: BTreeMap<String, u64>,
    pub rejected_calls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub tier: Tier,
    pub admitted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Operations served by the process-local fallback
    pub degraded_operations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockSnapshot {
    pub fingerprint: Fingerprint,
    pub acquisitions: u64,
    pub contended: u64,
    pub total_wait_ms: u64,
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub breakers: Vec<BreakerSnapshot>,
    pub rate_limits: Vec<AdmissionSnapshot>,
    pub cache: CacheSnapshot,
    pub locks: Vec<LockSnapshot>,
    pub orchestrations: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one admission decision for a caller
    pub fn record_admission(&self, tier: Tier, admitted: bool) {
        let counts = self.admissions.entry(tier).or_default();
        if admitted {
            counts.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            counts.rejected.fetch_add(1, Ordering::Relaxed);
        }
        counter!(
            "rate_limit_decisions_total",
            1,
            "tier" => tier.as_str(),
            "decision" => if admitted { "admit" } else { "reject" }
        );
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            counter!("cache_hits_total", 1);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            counter!("cache_misses_total", 1);
        }
    }

    pub fn record_cache_degraded(&self, operation: &'static str) {
        self.cache_degraded.fetch_add(1, Ordering::Relaxed);
        counter!("cache_degraded_operations_total", 1, "operation" => operation);
    }

    /// Records a lock grant and how long the caller waited for it
    pub fn record_lock_wait(&self, fingerprint: &Fingerprint, waited: Duration, contended: bool) {
        let now = Instant::now();
        let mut stats = self.locks.entry(fingerprint.clone()).or_insert_with(|| LockStats {
            acquisitions: 0,
            contended: 0,
            total_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
            last_seen: now,
        });
        stats.acquisitions += 1;
        if contended {
            stats.contended += 1;
        }
        stats.total_wait += waited;
        stats.max_wait = stats.max_wait.max(waited);
        stats.last_seen = now;
        drop(stats);

        histogram!("lock_wait_seconds", waited.as_secs_f64());
        if contended {
            counter!("lock_contention_total", 1);
        }
    }

    pub fn record_orchestration(&self, outcome: &'static str, elapsed: Duration) {
        self.orchestrations
            .entry(outcome)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        counter!("orchestrations_total", 1, "outcome" => outcome);
        histogram!("orchestration_duration_seconds", elapsed.as_secs_f64(), "outcome" => outcome);
    }

    /// Drops lock statistics for fingerprints not seen within `retention`
    pub fn purge_lock_stats(&self, retention: Duration) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, stats| stats.last_seen.elapsed() <= retention);
        before - self.locks.len()
    }

    pub fn cache(&self) -> CacheSnapshot {
        CacheSnapshot {
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
            degraded_operations: self.cache_degraded.load(Ordering::Relaxed),
        }
    }

    pub fn lock_stats(&self, fingerprint: &Fingerprint) -> Option<LockSnapshot> {
        self.locks.get(fingerprint).map(|stats| lock_snapshot(fingerprint, &stats))
    }

    pub fn snapshot(&self, breaker: &CircuitBreaker) -> MetricsSnapshot {
        let breakers = breaker
            .all_health()
            .into_iter()
            .map(|health| BreakerSnapshot {
                dependency: health.dependency,
                state: health.state,
                transitions: health.transitions.into_iter().collect(),
                rejected_calls: health.rejected_calls,
            })
            .collect();

        let mut rate_limits: Vec<AdmissionSnapshot> = self
            .admissions
            .iter()
            .map(|entry| AdmissionSnapshot {
                tier: *entry.key(),
                admitted: entry.admitted.load(Ordering::Relaxed),
                rejected: entry.rejected.load(Ordering::Relaxed),
            })
            .collect();
        rate_limits.sort_by_key(|s| s.tier.as_str());

        let mut locks: Vec<LockSnapshot> = self
            .locks
            .iter()
            .map(|entry| lock_snapshot(entry.key(), entry.value()))
            .collect();
        locks.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        MetricsSnapshot {
            breakers,
            rate_limits,
            cache: self.cache(),
            locks,
            orchestrations: self
                .orchestrations
                .iter()
                .map(|entry| (entry.key().to_string(), entry.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

fn lock_snapshot(fingerprint: &Fingerprint, stats: &LockStats) -> LockSnapshot {
    LockSnapshot {
        fingerprint: fingerprint.clone(),
        acquisitions: stats.acquisitions,
        contended: stats.contended,
        total_wait_ms: stats.total_wait.as_millis() as u64,
        max_wait_ms: stats.max_wait.as_millis() as u64,
    }
}
