//! # Cache & Lock Manager
//!
//! Fingerprint-keyed consensus cache with one computation lock per
//! fingerprint. Locks carry fencing tokens: a `put` or `release` presenting a
//! token that has expired or been superseded is rejected with `StaleLock`.
//!
//! The process-local lock is always taken first and gates every computation
//! inside this process. When a distributed store is configured, its lock is
//! taken second so deduplication also holds across processes, and its fence
//! is the one presented for fencing. Any distributed failure (or its breaker
//! being open) degrades the operation to the local lock alone. The request
//! still completes; only cross-process deduplication is lost, and the
//! degradation is logged and counted.

pub mod local;
pub mod redis_store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config_rs::CacheConfig;
use error_handling::{CircuitBreaker, Error, Result};
use serde::{Deserialize, Serialize};
use shared_types::{dependency, ConsensusResult, Fingerprint};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

pub use local::LocalStore;
pub use redis_store::RedisStore;

/// Which store granted a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Distributed,
}

/// Proof of holding the computation lock for one fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub fingerprint: Fingerprint,
    pub holder: String,
    /// Monotonically increasing per store
    pub fence: u64,
    pub ttl: Duration,
    pub backend: Backend,
}

/// The computation lock held by this process for one fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub local: LockToken,
    /// Present when the distributed store granted its lock as well
    pub distributed: Option<LockToken>,
}

impl HeldLock {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.local.fingerprint
    }

    /// The fencing token: the distributed one when held
    pub fn fence(&self) -> u64 {
        self.distributed.as_ref().unwrap_or(&self.local).fence
    }

    pub fn backend(&self) -> Backend {
        match self.distributed {
            Some(_) => Backend::Distributed,
            None => Backend::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The same token was already released, or its result already stored
    AlreadyReleased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: ConsensusResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(result: ConsensusResult, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(created_at);
        Self {
            result,
            created_at,
            expires_at,
        }
    }

    /// Time left before expiry, measured on the wall clock
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A cache and lock backing store
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn backend(&self) -> Backend;

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

    /// Grants the lock if it is free or its previous holder's TTL has elapsed
    async fn try_lock(&self, fingerprint: &Fingerprint, holder: &str, ttl: Duration) -> Result<Option<LockToken>>;

    async fn release(&self, token: &LockToken) -> Result<ReleaseOutcome>;

    /// Stores the result and releases the lock in one step
    async fn put(&self, token: &LockToken, entry: &CacheEntry, ttl: Duration) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Cache timing derived from configuration
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub result_ttl: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
    pub poll_interval: Duration,
    pub stats_retention: Duration,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            result_ttl: config.result_ttl(),
            lock_ttl: config.lock_ttl(),
            lock_wait: config.lock_wait(),
            poll_interval: config.poll_interval(),
            stats_retention: config.stats_retention(),
        }
    }
}

/// Result of waiting for the computation lock
#[derive(Debug)]
pub enum Acquisition {
    /// Another holder finished while we waited
    Cached(ConsensusResult),
    /// We hold the lock and must compute
    Locked(LockGuard),
}

pub struct CacheManager {
    local: Arc<LocalStore>,
    distributed: Option<Arc<dyn CacheStore>>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    settings: CacheSettings,
    holder: String,
    degraded: AtomicBool,
}

impl CacheManager {
    pub fn new(
        settings: CacheSettings,
        holder: impl Into<String>,
        distributed: Option<Arc<dyn CacheStore>>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local: Arc::new(LocalStore::new()),
            distributed,
            breaker,
            metrics,
            settings,
            holder: holder.into(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn local(&self) -> &Arc<LocalStore> {
        &self.local
    }

    pub fn distributed(&self) -> Option<&Arc<dyn CacheStore>> {
        self.distributed.as_ref()
    }

    /// True while operations are being served by the local fallback
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Flags the manager as degraded, e.g. when the distributed store could
    /// not be reached at startup
    pub fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(reason = %reason, "Cache degraded to process-local mode; cross-process deduplication disabled");
        }
    }

    /// Leaves degraded mode once the distributed store answers again
    pub fn mark_recovered(&self) {
        self.note_distributed_ok();
    }

    fn note_distributed_ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!("Distributed cache reachable again, leaving degraded mode");
        }
    }

    fn fall_back(&self, operation: &'static str, fingerprint: &Fingerprint, err: &Error) {
        self.metrics.record_cache_degraded(operation);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                operation,
                fingerprint = %fingerprint.short(),
                error = %err,
                "Distributed cache unavailable, degrading to process-local cache and lock"
            );
        } else {
            debug!(operation, fingerprint = %fingerprint.short(), error = %err, "Degraded cache operation");
        }
    }

    /// Looks up a cached result. Never fails; store errors degrade to the local copy.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<ConsensusResult> {
        let found = self.lookup(fingerprint).await;
        self.metrics.record_cache_lookup(found.is_some());
        found
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<ConsensusResult> {
        if let Ok(Some(entry)) = self.local.get(fingerprint).await {
            return Some(entry.result);
        }

        let store = self.distributed.as_ref()?;
        match self.breaker.execute(dependency::CACHE, store.get(fingerprint)).await {
            Ok(Some(entry)) => {
                self.note_distributed_ok();
                let ttl = entry.remaining_ttl();
                let result = entry.result.clone();
                if !ttl.is_zero() {
                    self.local.insert_unfenced(fingerprint, entry, ttl);
                }
                Some(result)
            }
            Ok(None) => {
                self.note_distributed_ok();
                None
            }
            Err(err) => {
                self.fall_back("get", fingerprint, &err);
                None
            }
        }
    }

    /// Single attempt at the computation lock; `LockBusy` if someone holds it
    pub async fn acquire(&self, fingerprint: &Fingerprint) -> Result<HeldLock> {
        self.try_acquire(fingerprint).await?.ok_or_else(|| Error::LockBusy {
            fingerprint: fingerprint.to_string(),
        })
    }

    async fn try_acquire(&self, fingerprint: &Fingerprint) -> Result<Option<HeldLock>> {
        let ttl = self.settings.lock_ttl;
        let Some(local) = self.local.try_lock(fingerprint, &self.holder, ttl).await? else {
            return Ok(None);
        };

        let Some(store) = &self.distributed else {
            return Ok(Some(HeldLock {
                local,
                distributed: None,
            }));
        };

        match self
            .breaker
            .execute(dependency::CACHE, store.try_lock(fingerprint, &self.holder, ttl))
            .await
        {
            Ok(Some(distributed)) => {
                self.note_distributed_ok();
                Ok(Some(HeldLock {
                    local,
                    distributed: Some(distributed),
                }))
            }
            Ok(None) => {
                // Another process is computing; give the local lock back
                self.note_distributed_ok();
                self.local.release(&local).await?;
                Ok(None)
            }
            Err(err) => {
                self.fall_back("acquire", fingerprint, &err);
                Ok(Some(HeldLock {
                    local,
                    distributed: None,
                }))
            }
        }
    }

    /// Waits for the computation lock, polling the cache while another holder works.
    ///
    /// Bounded by the configured lock wait and by `deadline`. Running out of
    /// lock wait yields `LockTimeout`; passing the deadline yields `Timeout`.
    pub async fn acquire_with_wait(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
        deadline: Option<Instant>,
    ) -> Result<Acquisition> {
        let started = Instant::now();
        let wait_until = started + self.settings.lock_wait;
        let limit = deadline.map_or(wait_until, |d| d.min(wait_until));
        let mut contended = false;

        loop {
            if let Some(lock) = self.try_acquire(fingerprint).await? {
                self.metrics.record_lock_wait(fingerprint, started.elapsed(), contended);
                let guard = LockGuard::new(Arc::clone(self), lock);

                // A previous holder may have stored the result between the
                // caller's lookup and the grant.
                if let Some(result) = self.lookup(fingerprint).await {
                    if let Err(err) = guard.release().await {
                        debug!(error = %err, "Release after late cache hit failed");
                    }
                    return Ok(Acquisition::Cached(result));
                }
                return Ok(Acquisition::Locked(guard));
            }

            if !contended {
                debug!(fingerprint = %fingerprint.short(), "Computation in flight elsewhere, waiting");
            }
            contended = true;

            if let Some(result) = self.lookup(fingerprint).await {
                self.metrics.record_lock_wait(fingerprint, started.elapsed(), true);
                return Ok(Acquisition::Cached(result));
            }

            let now = Instant::now();
            if now >= limit {
                let waited = now - started;
                return Err(match deadline {
                    Some(d) if d <= now => Error::Timeout {
                        stage: "lock acquisition".to_string(),
                        fingerprint: Some(fingerprint.to_string()),
                    },
                    _ => Error::LockTimeout {
                        fingerprint: fingerprint.to_string(),
                        waited,
                    },
                });
            }
            sleep(self.settings.poll_interval.min(limit - now)).await;
        }
    }

    /// Stores a computed result under the lock that produced it, releasing both locks
    pub async fn put(&self, lock: &HeldLock, result: &ConsensusResult) -> Result<()> {
        let ttl = self.settings.result_ttl;
        let entry = CacheEntry::new(result.clone(), ttl);

        let Some((store, distributed)) = self.distributed.as_ref().zip(lock.distributed.as_ref()) else {
            return self.local.put(&lock.local, &entry, ttl).await;
        };

        match self.breaker.execute(dependency::CACHE, store.put(distributed, &entry, ttl)).await {
            Ok(()) => {
                self.note_distributed_ok();
                self.store_local(lock, entry, ttl).await;
                Ok(())
            }
            Err(err @ Error::StaleLock { .. }) => {
                self.release_local(&lock.local).await;
                Err(err)
            }
            Err(err) => {
                self.fall_back("put", lock.fingerprint(), &err);
                self.store_local(lock, entry, ttl).await;
                Ok(())
            }
        }
    }

    /// Fills L1 and drops the local lock once the distributed store has accepted the result
    async fn store_local(&self, lock: &HeldLock, entry: CacheEntry, ttl: Duration) {
        if self.local.put(&lock.local, &entry, ttl).await.is_err() {
            // Local lock expired alongside; the distributed fence already vouched for us
            self.local.insert_unfenced(lock.fingerprint(), entry, ttl);
        }
    }

    async fn release_local(&self, token: &LockToken) {
        if let Err(err) = self.local.release(token).await {
            debug!(fingerprint = %token.fingerprint.short(), error = %err, "Local lock already gone");
        }
    }

    /// Releases both locks. The distributed outcome is reported when that lock was held.
    pub async fn release(&self, lock: &HeldLock) -> Result<ReleaseOutcome> {
        let distributed = match self.distributed.as_ref().zip(lock.distributed.as_ref()) {
            Some((store, token)) => match self.breaker.execute(dependency::CACHE, store.release(token)).await {
                Ok(outcome) => {
                    self.note_distributed_ok();
                    Some(Ok(outcome))
                }
                Err(err @ Error::StaleLock { .. }) => Some(Err(err)),
                Err(err) => {
                    // The distributed TTL reclaims the lock once the store is back
                    self.fall_back("release", lock.fingerprint(), &err);
                    None
                }
            },
            None => None,
        };

        match distributed {
            Some(outcome) => {
                self.release_local(&lock.local).await;
                outcome
            }
            None => self.local.release(&lock.local).await,
        }
    }

    /// Periodic maintenance: expired local entries, locks and lock statistics
    pub fn purge_expired(&self) -> usize {
        self.local.purge_expired() + self.metrics.purge_lock_stats(self.settings.stats_retention)
    }
}

/// Holds a computation lock; releases it in the background if dropped unused
pub struct LockGuard {
    manager: Arc<CacheManager>,
    lock: Option<HeldLock>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("lock", &self.lock).finish()
    }
}

impl LockGuard {
    fn new(manager: Arc<CacheManager>, lock: HeldLock) -> Self {
        Self {
            manager,
            lock: Some(lock),
        }
    }

    pub fn lock(&self) -> Option<&HeldLock> {
        self.lock.as_ref()
    }

    /// Stores the result, which also releases the lock
    pub async fn commit(mut self, result: &ConsensusResult) -> Result<()> {
        match self.lock.take() {
            Some(lock) => self.manager.put(&lock, result).await,
            None => Ok(()),
        }
    }

    pub async fn release(mut self) -> Result<ReleaseOutcome> {
        match self.lock.take() {
            Some(lock) => self.manager.release(&lock).await,
            None => Ok(ReleaseOutcome::AlreadyReleased),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let manager = Arc::clone(&self.manager);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = manager.release(&lock).await {
                        warn!(fingerprint = %lock.fingerprint().short(), error = %err, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(fingerprint = %lock.fingerprint().short(), "No runtime to release lock, leaving it to expire");
            }
        }
    }
}
