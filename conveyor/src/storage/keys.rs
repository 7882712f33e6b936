//! Key layout inside the shared store.
//!
//! Every process that shares a store must agree on these names, so they are
//! derived from a single prefix:
//!
//! | key | type | holds |
//! |-----|------|-------|
//! | `{prefix}:tasks:pending` | list | tasks ready to run |
//! | `{prefix}:tasks:deferred` | list | tasks waiting for a watcher |
//! | `{prefix}:tasks:active:{worker}` | list | tasks a worker is running |
//! | `{prefix}:tasks:watched:{worker}` | list | deferred tasks a worker is timing |
//! | `{prefix}:workers` | set | registered worker ids |
//! | `{prefix}:heartbeat:{worker}` | string with TTL | worker liveness |

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "conveyor";

/// Names of every queue, set and key the engine touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    /// Creates the key layout for `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns the prefix every key starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The global queue of tasks ready to run.
    pub fn pending(&self) -> String {
        format!("{}:tasks:pending", self.prefix)
    }

    /// The global inbox of tasks scheduled for later.
    pub fn deferred(&self) -> String {
        format!("{}:tasks:deferred", self.prefix)
    }

    /// Tasks `worker_id` is currently executing.
    pub fn active(&self, worker_id: &str) -> String {
        format!("{}:tasks:active:{}", self.prefix, worker_id)
    }

    /// Deferred tasks `worker_id` is waiting on.
    pub fn watched(&self, worker_id: &str) -> String {
        format!("{}:tasks:watched:{}", self.prefix, worker_id)
    }

    /// The set of registered worker ids.
    pub fn workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    /// Liveness key of `worker_id`.
    pub fn heartbeat(&self, worker_id: &str) -> String {
        format!("{}:heartbeat:{}", self.prefix, worker_id)
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
