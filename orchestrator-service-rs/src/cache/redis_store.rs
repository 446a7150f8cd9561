// Redis-backed distributed cache and lock store.
//
// Key layout, all under the configured prefix:
//   <prefix>:result:<fp>    serialized CacheEntry, PX = result TTL
//   <prefix>:lock:<fp>      "<holder>:<fence>", PX = lock TTL
//   <prefix>:released:<fp>  last released "<holder>:<fence>", PX = lock TTL
//   <prefix>:fence          INCR counter handing out fencing tokens
//
// Every lock mutation is a Lua script so check-and-set is atomic on the
// server. Redis expires abandoned locks on its own.
//
// The connection is made on first use and kept; until a connect succeeds
// every call fails fast enough for the cache breaker to count it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_handling::{Error, Result};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use shared_types::{dependency, Fingerprint};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::{Backend, CacheEntry, CacheStore, LockToken, ReleaseOutcome};

static ACQUIRE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 1 then
            return 0
        end
        local fence = redis.call('INCR', KEYS[2])
        redis.call('SET', KEYS[1], ARGV[1] .. ':' .. fence, 'PX', ARGV[2])
        return fence
        "#,
    )
});

static RELEASE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            redis.call('DEL', KEYS[1])
            redis.call('SET', KEYS[2], ARGV[1], 'PX', ARGV[2])
            return 1
        end
        if redis.call('GET', KEYS[2]) == ARGV[1] then
            return 2
        end
        return 0
        "#,
    )
});

static PUT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
        redis.call('DEL', KEYS[1])
        redis.call('SET', KEYS[3], ARGV[1], 'PX', ARGV[4])
        return 1
        "#,
    )
});

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connection: Arc<AsyncMutex<Option<ConnectionManager>>>,
    prefix: String,
}

impl RedisStore {
    /// Creates the store without contacting the server. Only a malformed URL fails.
    pub fn new(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Configuration(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            connection: Arc::new(AsyncMutex::new(None)),
            prefix: prefix.to_string(),
        })
    }

    /// Creates the store and tries to connect now. An unreachable server is
    /// logged, not returned; the next call tries again.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let store = Self::new(url, prefix)?;
        if let Err(err) = store.connection().await {
            warn!(error = %err, "Distributed cache unreachable, will retry on use");
        }
        Ok(store)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| Error::dependency_failure(dependency::CACHE, "connect timed out"))?
            .map_err(redis_error)?;
        info!(prefix = %self.prefix, "Connected to distributed cache");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    fn key(&self, namespace: &str, fingerprint: &Fingerprint) -> String {
        format!("{}:{}:{}", self.prefix, namespace, fingerprint)
    }

    fn fence_key(&self) -> String {
        format!("{}:fence", self.prefix)
    }
}

fn lock_value(token: &LockToken) -> String {
    format!("{}:{}", token.holder, token.fence)
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().max(1) as u64
}

fn redis_error(err: redis::RedisError) -> Error {
    Error::dependency_failure(dependency::CACHE, err)
}

fn stale(token: &LockToken) -> Error {
    Error::StaleLock {
        fingerprint: token.fingerprint.to_string(),
        token: token.fence,
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn backend(&self) -> Backend {
        Backend::Distributed
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.key("result", fingerprint))
            .await
            .map_err(redis_error)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn try_lock(&self, fingerprint: &Fingerprint, holder: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let mut conn = self.connection().await?;
        let fence: u64 = ACQUIRE
            .key(self.key("lock", fingerprint))
            .key(self.fence_key())
            .arg(holder)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        if fence == 0 {
            return Ok(None);
        }
        debug!(fingerprint = %fingerprint.short(), fence, "Distributed lock granted");
        Ok(Some(LockToken {
            fingerprint: fingerprint.clone(),
            holder: holder.to_string(),
            fence,
            ttl,
            backend: Backend::Distributed,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<ReleaseOutcome> {
        let mut conn = self.connection().await?;
        let outcome: i64 = RELEASE
            .key(self.key("lock", &token.fingerprint))
            .key(self.key("released", &token.fingerprint))
            .arg(lock_value(token))
            .arg(millis(token.ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        match outcome {
            1 => Ok(ReleaseOutcome::Released),
            2 => Ok(ReleaseOutcome::AlreadyReleased),
            _ => Err(stale(token)),
        }
    }

    async fn put(&self, token: &LockToken, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(entry)?;
        let mut conn = self.connection().await?;
        let stored: i64 = PUT
            .key(self.key("lock", &token.fingerprint))
            .key(self.key("result", &token.fingerprint))
            .key(self.key("released", &token.fingerprint))
            .arg(lock_value(token))
            .arg(payload)
            .arg(millis(ttl))
            .arg(millis(token.ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        if stored == 1 {
            Ok(())
        } else {
            Err(stale(token))
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_url_is_rejected() {
        assert!(matches!(
            RedisStore::new("not a url", "diag"),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_per_call() {
        let store = RedisStore::connect("redis://127.0.0.1:1/", "diag").await.unwrap();
        assert!(!store.is_connected().await);

        let err = store.ping().await.unwrap_err();
        assert!(matches!(err, Error::DependencyFailure { dependency: ref name, .. } if name == dependency::CACHE));
        assert!(!store.is_connected().await);
    }
}
