//! Redis-backed queue store for multi-process deployments.
//!
//! Every queue is a Redis list, the worker set is a Redis set and liveness
//! keys are plain strings with a millisecond expiry.
//!
//! # Command mapping
//!
//! - `push`: `LPUSH`
//! - `pop_into`: `BLMOVE source destination RIGHT LEFT timeout`
//! - `remove`: `LREM queue 1 entry`
//! - `move_entry`: Lua script (`LREM` then `LPUSH`, only if removed)
//! - `drain`: Lua script looping `LMOVE` until the source is empty
//! - `entries` / `len`: `LRANGE` / `LLEN`
//! - sets: `SADD` / `SREM` / `SMEMBERS`
//! - liveness: `SET key 1 PX ttl` / `EXISTS` / `DEL`
//!
//! Blocking pops hold their pooled connection for up to the pop timeout, so
//! the pool must be at least as large as the number of receivers sharing it
//! plus headroom for the other actors. See [`RedisQueueStore::with_pool_size`].

use super::{
    error::{Result, StorageError},
    QueueStore,
};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

/// Default number of pooled connections.
const DEFAULT_POOL_SIZE: usize = 32;

/// Atomically moves one entry between lists; returns 1 if it was present.
const MOVE_ENTRY_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) > 0 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Atomically moves every entry between lists, oldest first.
const DRAIN_SCRIPT: &str = r#"
local moved = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT') do
    moved = moved + 1
end
return moved
"#;

/// Queue store backed by a Redis server.
pub struct RedisQueueStore {
    pool: Pool,
    move_entry_script: redis::Script,
    drain_script: redis::Script,
}

impl RedisQueueStore {
    /// Creates a store with a connection pool of the default size.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use conveyor::storage::RedisQueueStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisQueueStore::new("redis://localhost:6379").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_pool_size(redis_url, DEFAULT_POOL_SIZE).await
    }

    /// Creates a store with a connection pool of `max_size` connections.
    ///
    /// Fails if the pool cannot be built or the server cannot be reached.
    pub async fn with_pool_size(redis_url: &str, max_size: usize) -> Result<Self> {
        let mut cfg = Config::from_url(redis_url);
        cfg.pool = Some(PoolConfig::new(max_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self {
            pool,
            move_entry_script: redis::Script::new(MOVE_ENTRY_SCRIPT),
            drain_script: redis::Script::new(DRAIN_SCRIPT),
        };

        // Fail fast on a bad URL instead of on the first queue operation.
        let mut conn = store.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        Ok(store)
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push(&self, queue: &str, entry: &[u8]) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.lpush::<_, _, ()>(queue, entry).await?;
        Ok(())
    }

    async fn pop_into(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        let entry: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(source)
            .arg(destination)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(entry)
    }

    async fn remove(&self, queue: &str, entry: &[u8]) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = conn.lrem(queue, 1, entry).await?;
        Ok(removed > 0)
    }

    async fn move_entry(&self, source: &str, destination: &str, entry: &[u8]) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let moved: i64 = self
            .move_entry_script
            .key(source)
            .key(destination)
            .arg(entry)
            .invoke_async(&mut *conn)
            .await?;
        Ok(moved == 1)
    }

    async fn drain(&self, source: &str, destination: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let moved: u64 = self
            .drain_script
            .key(source)
            .key(destination)
            .invoke_async(&mut *conn)
            .await?;
        Ok(moved)
    }

    async fn entries(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        // LRANGE lists newest first.
        let mut entries: Vec<Vec<u8>> = conn.lrange(queue, 0, -1).await?;
        entries.reverse();
        Ok(entries)
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        let mut conn = self.get_connection().await?;
        Ok(conn.llen(queue).await?)
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.sadd::<_, _, ()>(set, member).await?;
        Ok(())
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.srem::<_, _, ()>(set, member).await?;
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        Ok(conn.smembers(set).await?)
    }

    async fn set_expiring(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, 1, ttl_ms).await?;
        Ok(())
    }

    async fn is_live(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        Ok(conn.exists(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
