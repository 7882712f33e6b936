//! Shared queue store for the conveyor task engine.
//!
//! This module provides a trait-based interface over the crash-independent
//! store that every worker process shares, with two implementations:
//!
//! - [`InMemoryQueueStore`]: single-process storage for testing and development
//! - [`RedisQueueStore`]: Redis-based storage for true distributed execution
//!
//! The store is the only shared mutable resource in the system. Workers never
//! coordinate through in-process state; every hand-off between actors and
//! between processes is one of the atomic operations below.
//!
//! # Example
//!
//! ```no_run
//! use conveyor::storage::{InMemoryQueueStore, QueueStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryQueueStore::new();
//! store.push("jobs", b"hello").await?;
//! assert_eq!(store.len("jobs").await?, 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;

mod error;
mod keys;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use error::{Result, StorageError};
pub use keys::{QueueKeys, DEFAULT_KEY_PREFIX};
pub use memory::InMemoryQueueStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisQueueStore;

/// Trait for shared queue store backends.
///
/// Lists are FIFO: `push` adds at the head and every pop takes the oldest
/// entry from the tail. Entries are compared byte for byte, so callers that
/// want to remove or move an entry later must keep the exact bytes they
/// received.
///
/// Implementations must make `pop_into`, `move_entry` and `drain` atomic: an
/// entry is never observable in both queues, or in neither, mid-move.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Adds `entry` at the head of `queue`.
    async fn push(&self, queue: &str, entry: &[u8]) -> Result<()>;

    /// Takes the oldest entry of `source` and adds it at the head of
    /// `destination` in one atomic step.
    ///
    /// Waits up to `timeout` for an entry to arrive. Returns `None` if the
    /// timeout elapsed with `source` still empty.
    async fn pop_into(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>>;

    /// Removes the first entry of `queue` equal to `entry`.
    ///
    /// Returns `false` if no such entry was present.
    async fn remove(&self, queue: &str, entry: &[u8]) -> Result<bool>;

    /// Removes `entry` from `source` and adds it at the head of `destination`
    /// in one atomic step.
    ///
    /// Returns `false`, touching nothing, if `entry` was no longer in
    /// `source`.
    async fn move_entry(&self, source: &str, destination: &str, entry: &[u8]) -> Result<bool>;

    /// Moves every entry of `source` to `destination` atomically, preserving
    /// their relative order. Returns how many entries moved.
    async fn drain(&self, source: &str, destination: &str) -> Result<u64>;

    /// Returns all entries of `queue`, oldest first.
    async fn entries(&self, queue: &str) -> Result<Vec<Vec<u8>>>;

    /// Returns the number of entries in `queue`.
    async fn len(&self, queue: &str) -> Result<usize>;

    /// Adds `member` to `set`.
    async fn add_member(&self, set: &str, member: &str) -> Result<()>;

    /// Removes `member` from `set`.
    async fn remove_member(&self, set: &str, member: &str) -> Result<()>;

    /// Returns every member of `set`.
    async fn members(&self, set: &str) -> Result<Vec<String>>;

    /// Creates or renews `key` so that it expires `ttl` from now.
    async fn set_expiring(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Returns true if `key` exists and has not expired.
    async fn is_live(&self, key: &str) -> Result<bool>;

    /// Deletes `key`, whatever its type.
    async fn delete(&self, key: &str) -> Result<()>;
}

// Implement QueueStore for Box<dyn QueueStore> to allow type-erased storage
#[async_trait]
impl QueueStore for Box<dyn QueueStore> {
    async fn push(&self, queue: &str, entry: &[u8]) -> Result<()> {
        (**self).push(queue, entry).await
    }

    async fn pop_into(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        (**self).pop_into(source, destination, timeout).await
    }

    async fn remove(&self, queue: &str, entry: &[u8]) -> Result<bool> {
        (**self).remove(queue, entry).await
    }

    async fn move_entry(&self, source: &str, destination: &str, entry: &[u8]) -> Result<bool> {
        (**self).move_entry(source, destination, entry).await
    }

    async fn drain(&self, source: &str, destination: &str) -> Result<u64> {
        (**self).drain(source, destination).await
    }

    async fn entries(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        (**self).entries(queue).await
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        (**self).len(queue).await
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<()> {
        (**self).add_member(set, member).await
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<()> {
        (**self).remove_member(set, member).await
    }

    async fn members(&self, set: &str) -> Result<Vec<String>> {
        (**self).members(set).await
    }

    async fn set_expiring(&self, key: &str, ttl: Duration) -> Result<()> {
        (**self).set_expiring(key, ttl).await
    }

    async fn is_live(&self, key: &str) -> Result<bool> {
        (**self).is_live(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
