use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;
// tokio's Instant respects the paused test clock; std's does not.
use tokio::time::Instant;

/// Bound on any single store operation so a slow Redis can never stall a
/// registry mutation or the reaper sweep.
const OP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out")]
    Timeout,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key/value persistence collaborator with get/set/expire semantics.
///
/// The registry treats this as best-effort: failures are logged by the
/// caller and never block a state transition.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    async fn del(&self, key: &str) -> StoreResult<()>;
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store used when no Redis URL is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, deadline)) if expired(*deadline) => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, deadline)| !expired(*deadline));
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// RedisStore
// ---------------------------------------------------------------------------

/// Redis-backed store for registry persistence across manager restarts.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(url: &str) -> StoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        bounded(self.client.get_multiplexed_async_connection()).await
    }
}

/// Apply the store-wide operation timeout to a Redis future.
async fn bounded<T, F>(fut: F) -> StoreResult<T>
where
    F: std::future::Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(OP_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
        Err(_) => Err(StoreError::Timeout),
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        bounded(conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        bounded(conn.set(key, value)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        bounded(conn.set_ex(key, value, ttl.as_secs())).await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        bounded(conn.del(key)).await
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        // KEYS is acceptable here: the keyspace is bounded by the sandbox
        // cap and the call happens once per restart.
        let mut conn = self.conn().await?;
        bounded(conn.keys(format!("{prefix}*"))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_set_get_round_trip() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_del_removes() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        store.del("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_keys_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("sandbox:1", "x").await.unwrap();
        store.set("sandbox:2", "y").await.unwrap();
        store.set("job:1", "z").await.unwrap();

        let mut keys = store.keys("sandbox:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["sandbox:1", "sandbox:2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_set_ex_expires() {
        let store = MemoryStore::new();
        store
            .set_ex("a", "1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
