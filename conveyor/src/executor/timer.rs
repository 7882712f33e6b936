//! Watchers for deferred tasks.
//!
//! The deferred receiver moves tasks from the global deferred inbox into this
//! worker's watched queue; a watcher then sleeps until the task is due and
//! moves it to pending. A watcher never sleeps longer than the watch
//! horizon: a task further out goes back to the inbox, so the number of
//! armed timers stays bounded by the pool size.

use super::error::{EngineError, Result};
use super::worker::{Delivery, SharedReceiver};
use super::WorkerContext;
use crate::storage::{QueueStore, StorageError};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Watches deferred tasks handed over by the deferred receiver until `token`
/// is cancelled. Tasks still being watched stay in the watched queue.
pub(crate) async fn watch<S: QueueStore>(
    index: usize,
    ctx: Arc<WorkerContext<S>>,
    rx: SharedReceiver,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            delivery = async { rx.lock().await.recv().await } => delivery,
        };
        let Some(delivery) = delivery else {
            return Ok(());
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            outcome = settle(&ctx, delivery) => {
                outcome.map_err(|source| EngineError::WatcherStopped { index, source })?;
            }
        }
    }
}

/// Waits for one deferred task, then promotes it or hands it back.
async fn settle<S: QueueStore>(
    ctx: &WorkerContext<S>,
    delivery: Delivery,
) -> std::result::Result<(), StorageError> {
    let Delivery { task, entry } = delivery;
    let remaining = task.remaining(Utc::now());
    let horizon = ctx.config.watch_period();
    let due_within_horizon = remaining <= horizon;

    tokio::time::sleep(remaining.min(horizon)).await;

    let watched = ctx.keys.watched(&ctx.worker_id);
    let (destination, action) = if due_within_horizon {
        (ctx.keys.pending(), "promoted deferred task")
    } else {
        (ctx.keys.deferred(), "returned deferred task to inbox")
    };

    if ctx.store.move_entry(&watched, &destination, &entry).await? {
        debug!(task.id = %task.id, job = %task.job_name, "{}", action);
    } else {
        debug!(task.id = %task.id, "deferred task already handled elsewhere");
    }
    Ok(())
}
