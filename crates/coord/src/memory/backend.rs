use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use sentinel_common::{keys, Result, SentinelError};

/// Opaque key/value store behind the memory synchronizer.
///
/// Keys are hierarchical `/`-separated paths; the backend prepends the
/// process-wide namespace prefix and strips it again on search. Writes are
/// at-most-once, reads at-least-once; no transactional guarantees.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All stored keys starting with `prefix`, namespace-relative.
    async fn search(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Validate a key at the adapter boundary, logging rejects.
fn checked(key: &str) -> Result<()> {
    keys::validate(key).inspect_err(|e| {
        tracing::warn!(key = %key, error = %e, "Rejected shared-memory key");
        metrics::counter!("sync.backend.rejected_keys").increment(1);
    })
}

/// Redis implementation over a multiplexed async connection.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    namespace: String,
}

impl RedisBackend {
    /// Connect and verify with a PING.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self> {
        tracing::info!("Connecting to Redis");

        let client = redis::Client::open(redis_url)
            .map_err(|e| SentinelError::Transport(format!("redis open: {}", e)))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SentinelError::Transport(format!("redis connect: {}", e)))?;

        let backend = Self {
            conn,
            namespace: namespace.trim_end_matches('/').to_string(),
        };
        backend.health_check().await?;
        tracing::info!("Redis connection established");

        Ok(backend)
    }

    /// Verify the connection is alive (PING).
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| SentinelError::Transport(format!("redis ping: {}", e)))?;

        if pong != "PONG" {
            return Err(SentinelError::Transport(format!(
                "unexpected PING response: {}",
                pong
            )));
        }
        Ok(())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }
}

#[async_trait]
impl MemoryBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        checked(key)?;
        let mut conn = self.conn.clone();

        let value: Option<String> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| SentinelError::Transport(format!("redis GET {}: {}", key, e)))?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        checked(key)?;
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key)).arg(value);
        if let Some(ttl) = ttl_seconds {
            cmd.arg("EX").arg(ttl);
        }

        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| SentinelError::Transport(format!("redis SET {}: {}", key, e)))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        checked(key)?;
        let mut conn = self.conn.clone();

        redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| SentinelError::Transport(format!("redis DEL {}: {}", key, e)))?;

        Ok(())
    }

    async fn search(&self, prefix: &str) -> Result<Vec<String>> {
        checked(prefix)?;
        let mut conn = self.conn.clone();

        let pattern = format!("{}*", self.namespaced(prefix));
        let strip = format!("{}/", self.namespace);
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        // SCAN never blocks the server the way KEYS would.
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| SentinelError::Transport(format!("redis SCAN {}: {}", prefix, e)))?;

            found.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&strip).map(str::to_string)),
            );

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(found)
    }
}

/// Mutexed in-process backend honoring TTLs, for tests and as a reference
/// implementation of the contract.
pub struct InMemoryBackend {
    entries: Mutex<HashMap<String, StoredValue>>,
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|v| !v.expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        checked(key)?;
        let mut entries = self.entries.lock().unwrap();

        match entries.get(key) {
            Some(stored) if stored.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<()> {
        checked(key)?;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl_seconds.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        checked(key)?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn search(&self, prefix: &str) -> Result<Vec<String>> {
        checked(prefix)?;
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(key, stored)| key.starts_with(prefix) && !stored.expired())
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_round_trip() {
        let backend = InMemoryBackend::new();

        backend.put("tasks/1/state", "running", None).await.unwrap();
        assert_eq!(
            backend.get("tasks/1/state").await.unwrap().as_deref(),
            Some("running")
        );

        backend.delete("tasks/1/state").await.unwrap();
        assert_eq!(backend.get("tasks/1/state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_search_by_prefix() {
        let backend = InMemoryBackend::new();
        backend.put("tasks/1/lock", "a", None).await.unwrap();
        backend.put("tasks/2/lock", "b", None).await.unwrap();
        backend.put("workers/x/status", "c", None).await.unwrap();

        let mut found = backend.search("tasks/").await.unwrap();
        found.sort();
        assert_eq!(found, vec!["tasks/1/lock", "tasks/2/lock"]);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = InMemoryBackend::new();
        backend.put("events/x/1", "v", Some(0)).await.unwrap();
        assert_eq!(backend.get("events/x/1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let backend = InMemoryBackend::new();
        let err = backend.put("tasks/1;evil", "v", None).await.unwrap_err();
        assert!(matches!(err, SentinelError::InvalidInput(_)));
        let err = backend.search("tasks/$(x)").await.unwrap_err();
        assert!(matches!(err, SentinelError::InvalidInput(_)));
    }
}
