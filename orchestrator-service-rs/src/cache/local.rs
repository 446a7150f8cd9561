// Process-local cache and lock store.
//
// Serves as the L1 copy in front of the distributed store and as the whole
// store when the distributed one is missing or unreachable. Locks taken here
// only exclude callers within this process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_handling::{Error, Result};
use shared_types::Fingerprint;
use tokio::time::Instant;
use tracing::debug;

use super::{Backend, CacheEntry, CacheStore, LockToken, ReleaseOutcome};

#[derive(Debug, Clone)]
struct LockRecord {
    holder: String,
    fence: u64,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct ReleasedMarker {
    fence: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<Fingerprint, (CacheEntry, Instant)>,
    locks: DashMap<Fingerprint, LockRecord>,
    released: DashMap<Fingerprint, ReleasedMarker>,
    fence: AtomicU64,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entry without a lock; used to fill L1 from the distributed store
    pub fn insert_unfenced(&self, fingerprint: &Fingerprint, entry: CacheEntry, ttl: Duration) {
        self.entries
            .insert(fingerprint.clone(), (entry, Instant::now() + ttl));
    }

    /// Whether a live lock is held for `fingerprint`
    pub fn is_locked(&self, fingerprint: &Fingerprint) -> bool {
        self.locks
            .get(fingerprint)
            .map(|record| record.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries, abandoned locks and old release markers
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len() + self.locks.len() + self.released.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        self.locks.retain(|_, record| record.expires_at > now);
        self.released.retain(|_, marker| marker.expires_at > now);
        let purged = before - (self.entries.len() + self.locks.len() + self.released.len());
        if purged > 0 {
            debug!(purged, "Purged expired local cache state");
        }
        purged
    }

    fn mark_released(&self, token: &LockToken, now: Instant) {
        self.released.insert(
            token.fingerprint.clone(),
            ReleasedMarker {
                fence: token.fence,
                expires_at: now + token.ttl,
            },
        );
    }

    fn stale(token: &LockToken) -> Error {
        Error::StaleLock {
            fingerprint: token.fingerprint.to_string(),
            token: token.fence,
        }
    }
}

#[async_trait]
impl CacheStore for LocalStore {
    fn backend(&self) -> Backend {
        Backend::Local
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let now = Instant::now();
        if let Entry::Occupied(occupied) = self.entries.entry(fingerprint.clone()) {
            if occupied.get().1 > now {
                return Ok(Some(occupied.get().0.clone()));
            }
            occupied.remove();
        }
        Ok(None)
    }

    async fn try_lock(&self, fingerprint: &Fingerprint, holder: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let grant = |fence: u64| LockRecord {
            holder: holder.to_string(),
            fence,
            expires_at: now + ttl,
        };

        let fence = match self.locks.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(None);
                }
                debug!(
                    fingerprint = %fingerprint.short(),
                    abandoned_by = %occupied.get().holder,
                    "Reclaiming expired lock"
                );
                let fence = self.fence.fetch_add(1, Ordering::SeqCst) + 1;
                occupied.insert(grant(fence));
                fence
            }
            Entry::Vacant(vacant) => {
                let fence = self.fence.fetch_add(1, Ordering::SeqCst) + 1;
                vacant.insert(grant(fence));
                fence
            }
        };

        Ok(Some(LockToken {
            fingerprint: fingerprint.clone(),
            holder: holder.to_string(),
            fence,
            ttl,
            backend: Backend::Local,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<ReleaseOutcome> {
        let now = Instant::now();
        if let Entry::Occupied(occupied) = self.locks.entry(token.fingerprint.clone()) {
            let record = occupied.get();
            if record.fence == token.fence {
                if record.expires_at <= now {
                    // Past its TTL the lock belongs to whoever reclaims it next
                    occupied.remove();
                    return Err(Self::stale(token));
                }
                occupied.remove();
                self.mark_released(token, now);
                return Ok(ReleaseOutcome::Released);
            }
        }

        match self.released.get(&token.fingerprint) {
            Some(marker) if marker.fence == token.fence => Ok(ReleaseOutcome::AlreadyReleased),
            _ => Err(Self::stale(token)),
        }
    }

    async fn put(&self, token: &LockToken, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        match self.locks.entry(token.fingerprint.clone()) {
            Entry::Occupied(occupied) if occupied.get().fence == token.fence && occupied.get().expires_at > now => {
                // Result first, then the lock, so a waiter that wins the
                // lock next always finds the result.
                self.entries
                    .insert(token.fingerprint.clone(), (entry.clone(), now + ttl));
                occupied.remove();
                self.mark_released(token, now);
                Ok(())
            }
            _ => Err(Self::stale(token)),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::sample_entry;
    use tokio::time::advance;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_exclusive_until_released() {
        let store = LocalStore::new();
        let ttl = Duration::from_secs(5);

        let token = store.try_lock(&fp("a"), "p1", ttl).await.unwrap().unwrap();
        assert!(store.try_lock(&fp("a"), "p2", ttl).await.unwrap().is_none());
        // Other fingerprints are unaffected
        assert!(store.try_lock(&fp("b"), "p2", ttl).await.unwrap().is_some());

        assert_eq!(store.release(&token).await.unwrap(), ReleaseOutcome::Released);
        let next = store.try_lock(&fp("a"), "p2", ttl).await.unwrap().unwrap();
        assert!(next.fence > token.fence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_idempotent() {
        let store = LocalStore::new();
        let token = store
            .try_lock(&fp("a"), "p1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.release(&token).await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(store.release(&token).await.unwrap(), ReleaseOutcome::AlreadyReleased);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_is_fenced_out() {
        let store = LocalStore::new();
        let ttl = Duration::from_secs(5);
        let old = store.try_lock(&fp("a"), "p1", ttl).await.unwrap().unwrap();

        advance(Duration::from_secs(6)).await;

        // The holder crashed or stalled; a new caller reclaims the lock
        let new = store.try_lock(&fp("a"), "p2", ttl).await.unwrap().unwrap();
        assert!(new.fence > old.fence);

        assert!(matches!(store.release(&old).await, Err(Error::StaleLock { .. })));
        assert!(matches!(
            store.put(&old, &sample_entry("a"), ttl).await,
            Err(Error::StaleLock { .. })
        ));
        // The new holder is unaffected
        assert!(store.is_locked(&fp("a")));
        store.put(&new, &sample_entry("a"), ttl).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_ttl_is_rejected() {
        let store = LocalStore::new();
        let token = store
            .try_lock(&fp("a"), "p1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        advance(Duration::from_secs(5)).await;

        assert!(matches!(store.release(&token).await, Err(Error::StaleLock { .. })));
        assert!(store.try_lock(&fp("a"), "p2", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_stores_result_and_releases_lock() {
        let store = LocalStore::new();
        let ttl = Duration::from_secs(60);
        let token = store.try_lock(&fp("a"), "p1", ttl).await.unwrap().unwrap();

        store.put(&token, &sample_entry("a"), ttl).await.unwrap();
        assert!(!store.is_locked(&fp("a")));
        assert!(store.get(&fp("a")).await.unwrap().is_some());
        assert_eq!(store.release(&token).await.unwrap(), ReleaseOutcome::AlreadyReleased);

        advance(Duration::from_secs(61)).await;
        assert!(store.get(&fp("a")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = LocalStore::new();
        store.insert_unfenced(&fp("a"), sample_entry("a"), Duration::from_secs(1));
        store.insert_unfenced(&fp("b"), sample_entry("b"), Duration::from_secs(10));
        let _ = store.try_lock(&fp("c"), "p1", Duration::from_secs(1)).await.unwrap();

        advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 1);
    }
}
