use crate::storage::DEFAULT_KEY_PREFIX;
use std::time::Duration;
use uuid::Uuid;

/// Shortest period any timed actor runs at.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Tunables for one [`Engine`](super::Engine).
///
/// Every process sharing a store must use the same `key_prefix`. The
/// heartbeat TTL should comfortably exceed the worst store latency, since a
/// worker whose heartbeat lapses is treated as dead and its work is requeued.
///
/// # Example
///
/// ```
/// use conveyor::executor::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_worker_id("worker-a")
///     .with_dispatchers(10)
///     .with_heartbeat_ttl(Duration::from_secs(10));
/// assert_eq!(config.worker_id, "worker-a");
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique id of this worker. Generated when not configured.
    pub worker_id: String,
    /// Prefix of every key in the shared store.
    pub key_prefix: String,
    /// Number of concurrent dispatchers running handlers.
    pub dispatchers: usize,
    /// Number of concurrent watchers timing deferred tasks.
    pub watchers: usize,
    /// Lifetime of the heartbeat key. Refreshed every half TTL.
    pub heartbeat_ttl: Duration,
    /// How often the cleaner looks for dead workers.
    pub cleaning_interval: Duration,
    /// Upper bound of one blocking pop, and so of how long a receiver takes
    /// to notice cancellation.
    pub pop_timeout: Duration,
    /// Longest time a watcher holds one deferred task before handing it back
    /// to the deferred inbox.
    pub watch_horizon: Duration,
    /// How long in-flight handlers may keep running after cancellation.
    pub shutdown_grace: Duration,
    /// Optional limit on a single handler invocation.
    pub handler_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            dispatchers: 5,
            watchers: 100,
            heartbeat_ttl: Duration::from_secs(30),
            cleaning_interval: Duration::from_secs(30),
            pop_timeout: Duration::from_secs(2),
            watch_horizon: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            handler_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the dispatcher pool size. At least one dispatcher always runs.
    pub fn with_dispatchers(mut self, dispatchers: usize) -> Self {
        self.dispatchers = dispatchers.max(1);
        self
    }

    /// Sets the watcher pool size. At least one watcher always runs.
    pub fn with_watchers(mut self, watchers: usize) -> Self {
        self.watchers = watchers.max(1);
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_cleaning_interval(mut self, interval: Duration) -> Self {
        self.cleaning_interval = interval;
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_watch_horizon(mut self, horizon: Duration) -> Self {
        self.watch_horizon = horizon;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Interval between two heartbeats.
    pub(crate) fn heartbeat_interval(&self) -> Duration {
        (self.heartbeat_ttl / 2).max(MIN_PERIOD)
    }

    /// Interval between two cleaner sweeps.
    pub(crate) fn cleaning_period(&self) -> Duration {
        self.cleaning_interval.max(MIN_PERIOD)
    }

    /// Longest sleep of one watcher.
    pub(crate) fn watch_period(&self) -> Duration {
        self.watch_horizon.max(MIN_PERIOD)
    }
}

/// Builds a worker id from the host name, if known, and a fresh UUID.
fn generate_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, Uuid::new_v4())
}
