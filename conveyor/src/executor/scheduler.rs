use crate::core::Task;
use crate::storage::{QueueKeys, QueueStore, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Submits tasks to the shared store.
///
/// Cheap to clone. Usable from job handlers, from request-handling code, and
/// from processes that never run an engine themselves.
pub struct TaskSubmitter<S: QueueStore> {
    store: Arc<S>,
    keys: QueueKeys,
}

impl<S: QueueStore> Clone for TaskSubmitter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            keys: self.keys.clone(),
        }
    }
}

impl<S: QueueStore> TaskSubmitter<S> {
    pub fn new(store: Arc<S>, keys: QueueKeys) -> Self {
        Self { store, keys }
    }

    /// Queues `task`: on pending if it is due, otherwise on the deferred
    /// inbox where a watcher picks it up.
    ///
    /// Only fails if the store cannot be reached.
    pub async fn submit_task(&self, task: &Task) -> Result<()> {
        let entry = task.encode()?;
        let queue = if task.is_due(Utc::now()) {
            self.keys.pending()
        } else {
            self.keys.deferred()
        };
        self.store.push(&queue, &entry).await?;
        debug!(task.id = %task.id, job = %task.job_name, queue = %queue, "submitted task");
        Ok(())
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
