#![allow(dead_code)]

use async_trait::async_trait;
use conveyor::storage::{InMemoryQueueStore, QueueStore, Result, StorageError};
use conveyor::{EngineConfig, Task};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Engine settings scaled down so tests finish in well under a second.
pub fn fast_config(worker_id: &str) -> EngineConfig {
    EngineConfig::default()
        .with_worker_id(worker_id)
        .with_dispatchers(2)
        .with_watchers(4)
        .with_pop_timeout(Duration::from_millis(50))
        .with_heartbeat_ttl(Duration::from_millis(300))
        .with_cleaning_interval(Duration::from_millis(100))
        .with_shutdown_grace(Duration::from_millis(200))
}

/// Polls `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory store that counts every task pushed, per job name.
#[derive(Default)]
pub struct CountingStore {
    inner: InMemoryQueueStore,
    pushed: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self, job: &str) -> usize {
        self.pushed.lock().unwrap().get(job).copied().unwrap_or(0)
    }

    pub fn pushed_total(&self) -> usize {
        self.pushed.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl QueueStore for CountingStore {
    async fn push(&self, queue: &str, entry: &[u8]) -> Result<()> {
        if let Ok(task) = Task::decode(entry) {
            *self.pushed.lock().unwrap().entry(task.job_name).or_default() += 1;
        }
        self.inner.push(queue, entry).await
    }

    async fn pop_into(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.inner.pop_into(source, destination, timeout).await
    }

    async fn remove(&self, queue: &str, entry: &[u8]) -> Result<bool> {
        self.inner.remove(queue, entry).await
    }

    async fn move_entry(&self, source: &str, destination: &str, entry: &[u8]) -> Result<bool> {
        self.inner.move_entry(source, destination, entry).await
    }

    async fn drain(&self, source: &str, destination: &str) -> Result<u64> {
        self.inner.drain(source, destination).await
    }

    async fn entries(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        self.inner.entries(queue).await
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        self.inner.len(queue).await
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<()> {
        self.inner.add_member(set, member).await
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<()> {
        self.inner.remove_member(set, member).await
    }

    async fn members(&self, set: &str) -> Result<Vec<String>> {
        self.inner.members(set).await
    }

    async fn set_expiring(&self, key: &str, ttl: Duration) -> Result<()> {
        self.inner.set_expiring(key, ttl).await
    }

    async fn is_live(&self, key: &str) -> Result<bool> {
        self.inner.is_live(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
}

/// In-memory store whose named operation fails once armed with
/// [`FailingStore::fail`]. Every other operation keeps working, so the engine
/// can still deregister.
#[derive(Default)]
pub struct FailingStore {
    inner: InMemoryQueueStore,
    failing: Mutex<Option<&'static str>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `operation` fail.
    pub fn fail(&self, operation: &'static str) {
        *self.failing.lock().unwrap() = Some(operation);
    }

    pub fn inner(&self) -> &InMemoryQueueStore {
        &self.inner
    }

    fn check(&self, operation: &str) -> Result<()> {
        match *self.failing.lock().unwrap() {
            Some(failing) if failing == operation => {
                Err(StorageError::Connection(format!("injected {operation} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl QueueStore for FailingStore {
    async fn push(&self, queue: &str, entry: &[u8]) -> Result<()> {
        self.check("push")?;
        self.inner.push(queue, entry).await
    }

    async fn pop_into(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.check("pop_into")?;
        self.inner.pop_into(source, destination, timeout).await
    }

    async fn remove(&self, queue: &str, entry: &[u8]) -> Result<bool> {
        self.check("remove")?;
        self.inner.remove(queue, entry).await
    }

    async fn move_entry(&self, source: &str, destination: &str, entry: &[u8]) -> Result<bool> {
        self.check("move_entry")?;
        self.inner.move_entry(source, destination, entry).await
    }

    async fn drain(&self, source: &str, destination: &str) -> Result<u64> {
        self.check("drain")?;
        self.inner.drain(source, destination).await
    }

    async fn entries(&self, queue: &str) -> Result<Vec<Vec<u8>>> {
        self.check("entries")?;
        self.inner.entries(queue).await
    }

    async fn len(&self, queue: &str) -> Result<usize> {
        self.check("len")?;
        self.inner.len(queue).await
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<()> {
        self.check("add_member")?;
        self.inner.add_member(set, member).await
    }

    async fn remove_member(&self, set: &str, member: &str) -> Result<()> {
        self.check("remove_member")?;
        self.inner.remove_member(set, member).await
    }

    async fn members(&self, set: &str) -> Result<Vec<String>> {
        self.check("members")?;
        self.inner.members(set).await
    }

    async fn set_expiring(&self, key: &str, ttl: Duration) -> Result<()> {
        self.check("set_expiring")?;
        self.inner.set_expiring(key, ttl).await
    }

    async fn is_live(&self, key: &str) -> Result<bool> {
        self.check("is_live")?;
        self.inner.is_live(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check("delete")?;
        self.inner.delete(key).await
    }
}

/// Shared, ordered record of events observed by handlers.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}
