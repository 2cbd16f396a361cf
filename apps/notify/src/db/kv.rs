use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::time::Instant;

use crate::error::StorageError;

/// Abstraction over the shared counter store behind online presence.
///
/// Every operation is a single atomic round trip. Backed by Redis in
/// production and an in-memory map in tests.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and (re)apply its TTL. Returns the new value.
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<i64, StorageError>;

    /// Decrement `key`, deleting it when it reaches zero. Returns `None` when
    /// the key did not exist (nothing was decremented).
    async fn decr_or_delete(&self, key: &str) -> Result<Option<i64>, StorageError>;

    async fn get_count(&self, key: &str) -> Result<Option<i64>, StorageError>;

    /// Values for `keys` in order; absent keys are `None`.
    async fn get_counts(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StorageError>;

    /// Reset the TTL on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, single-node runs)
// ---------------------------------------------------------------------------

struct Counter {
    value: i64,
    expires_at: Instant,
}

impl Counter {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

pub struct MemoryStore {
    data: Mutex<HashMap<String, Counter>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Lookup that drops an expired entry on the way.
    fn live_value(data: &mut HashMap<String, Counter>, key: &str, now: Instant) -> Option<i64> {
        match data.get(key) {
            Some(c) if c.live(now) => Some(c.value),
            Some(_) => {
                data.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<i64, StorageError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let value = Self::live_value(&mut data, key, now).unwrap_or(0) + 1;
        data.insert(
            key.to_string(),
            Counter {
                value,
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
        Ok(value)
    }

    async fn decr_or_delete(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let Some(current) = Self::live_value(&mut data, key, now) else {
            return Ok(None);
        };
        if current <= 1 {
            data.remove(key);
            return Ok(Some(0));
        }
        if let Some(c) = data.get_mut(key) {
            c.value = current - 1;
        }
        Ok(Some(current - 1))
    }

    async fn get_count(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let now = Instant::now();
        Ok(Self::live_value(&mut self.data.lock(), key, now))
    }

    async fn get_counts(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StorageError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        Ok(keys
            .iter()
            .map(|k| Self::live_value(&mut data, k, now))
            .collect())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if Self::live_value(&mut data, key, now).is_none() {
            return Ok(false);
        }
        if let Some(c) = data.get_mut(key) {
            c.expires_at = now + Duration::from_secs(ttl_secs);
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

const INCR_WITH_TTL: &str = r"
local v = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return v
";

// Returns nil for a missing key so callers can tell "nothing to decrement".
const DECR_OR_DELETE: &str = r"
local v = redis.call('GET', KEYS[1])
if not v then
  return nil
end
if tonumber(v) <= 1 then
  redis.call('DEL', KEYS[1])
  return 0
end
return redis.call('DECR', KEYS[1])
";

pub struct RedisStore {
    conn: ConnectionManager,
    incr: Script,
    decr: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            incr: Script::new(INCR_WITH_TTL),
            decr: Script::new(DECR_OR_DELETE),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<i64, StorageError> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .incr
            .key(key)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn decr_or_delete(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self.decr.key(key).invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_count(&self, key: &str) -> Result<Option<i64>, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn get_counts(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let applied: bool = conn.expire(key, ttl_secs as i64).await?;
        Ok(applied)
    }
}
