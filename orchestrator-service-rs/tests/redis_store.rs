// Redis store scripts against a live server.
//
// Run with `cargo test --test redis_store -- --ignored`; REDIS_URL selects
// the server (default redis://127.0.0.1:6379). Each test works under its
// own key prefix.

use std::time::Duration;

use chrono::Utc;
use error_handling::Error;
use orchestrator_service::cache::{CacheEntry, ReleaseOutcome};
use orchestrator_service::{CacheStore, RedisStore};
use shared_types::{ConsensusResult, Fingerprint};
use uuid::Uuid;

const LOCK_TTL: Duration = Duration::from_secs(30);
const RESULT_TTL: Duration = Duration::from_secs(3600);

async fn store() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let prefix = format!("diag-test-{}", Uuid::new_v4());
    let store = RedisStore::connect(&url, &prefix).await.unwrap();
    assert!(store.is_connected().await, "no Redis server at {}", url);
    store
}

fn result(fingerprint: &Fingerprint) -> ConsensusResult {
    ConsensusResult {
        fingerprint: fingerprint.clone(),
        tenant_id: "acme".to_string(),
        diagnosis: "DNS forwarder misconfiguration".to_string(),
        confidence: 0.86,
        ranked: Vec::new(),
        findings: Vec::new(),
        red_flags: Vec::new(),
        recommendations: Vec::new(),
        degraded: Vec::new(),
        escalation_required: false,
        generated_at: Utc::now(),
    }
}

fn entry(fingerprint: &Fingerprint, ttl: Duration) -> CacheEntry {
    CacheEntry::new(result(fingerprint), ttl)
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn fences_increase_across_grants() {
    let store = store().await;
    let fp = Fingerprint::from_hex("a1");

    let first = store.try_lock(&fp, "node-a", LOCK_TTL).await.unwrap().unwrap();
    assert!(store.try_lock(&fp, "node-b", LOCK_TTL).await.unwrap().is_none());
    assert_eq!(store.release(&first).await.unwrap(), ReleaseOutcome::Released);

    let second = store.try_lock(&fp, "node-b", LOCK_TTL).await.unwrap().unwrap();
    assert!(second.fence > first.fence);

    // The counter is shared across fingerprints
    let other = store
        .try_lock(&Fingerprint::from_hex("b2"), "node-a", LOCK_TTL)
        .await
        .unwrap()
        .unwrap();
    assert!(other.fence > second.fence);
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn release_checks_the_owner() {
    let store = store().await;
    let fp = Fingerprint::from_hex("a1");
    let token = store.try_lock(&fp, "node-a", LOCK_TTL).await.unwrap().unwrap();

    let forged = orchestrator_service::LockToken {
        fence: token.fence + 7,
        ..token.clone()
    };
    assert!(matches!(store.release(&forged).await, Err(Error::StaleLock { .. })));
    let impostor = orchestrator_service::LockToken {
        holder: "node-b".to_string(),
        ..token.clone()
    };
    assert!(matches!(store.release(&impostor).await, Err(Error::StaleLock { .. })));

    // Still held by the real owner
    assert!(store.try_lock(&fp, "node-b", LOCK_TTL).await.unwrap().is_none());

    assert_eq!(store.release(&token).await.unwrap(), ReleaseOutcome::Released);
    assert_eq!(store.release(&token).await.unwrap(), ReleaseOutcome::AlreadyReleased);
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn put_requires_the_live_lock() {
    let store = store().await;
    let fp = Fingerprint::from_hex("a1");
    let token = store.try_lock(&fp, "node-a", LOCK_TTL).await.unwrap().unwrap();

    let stale = orchestrator_service::LockToken {
        fence: token.fence - 1,
        ..token.clone()
    };
    let err = store.put(&stale, &entry(&fp, RESULT_TTL), RESULT_TTL).await.unwrap_err();
    assert!(matches!(err, Error::StaleLock { .. }));
    assert!(store.get(&fp).await.unwrap().is_none());

    store.put(&token, &entry(&fp, RESULT_TTL), RESULT_TTL).await.unwrap();
    let cached = store.get(&fp).await.unwrap().unwrap();
    assert_eq!(cached.result.diagnosis, "DNS forwarder misconfiguration");

    // Storing frees the lock; the token is spent
    assert_eq!(store.release(&token).await.unwrap(), ReleaseOutcome::AlreadyReleased);
    let err = store.put(&token, &entry(&fp, RESULT_TTL), RESULT_TTL).await.unwrap_err();
    assert!(matches!(err, Error::StaleLock { .. }));
    assert!(store.try_lock(&fp, "node-b", LOCK_TTL).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn expired_lock_is_reclaimed_and_old_holder_fenced_out() {
    let store = store().await;
    let fp = Fingerprint::from_hex("a1");
    let abandoned = store
        .try_lock(&fp, "node-a", Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let successor = store.try_lock(&fp, "node-b", LOCK_TTL).await.unwrap().unwrap();
    assert!(successor.fence > abandoned.fence);

    assert!(matches!(store.release(&abandoned).await, Err(Error::StaleLock { .. })));
    let err = store
        .put(&abandoned, &entry(&fp, RESULT_TTL), RESULT_TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StaleLock { .. }));
    assert!(store.get(&fp).await.unwrap().is_none());

    store.put(&successor, &entry(&fp, RESULT_TTL), RESULT_TTL).await.unwrap();
    assert!(store.get(&fp).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn stored_results_expire() {
    let store = store().await;
    let fp = Fingerprint::from_hex("a1");
    let ttl = Duration::from_millis(200);
    let token = store.try_lock(&fp, "node-a", LOCK_TTL).await.unwrap().unwrap();

    store.put(&token, &entry(&fp, ttl), ttl).await.unwrap();
    assert!(store.get(&fp).await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.get(&fp).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn ping_answers() {
    store().await.ping().await.unwrap();
}
