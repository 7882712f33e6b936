//! Recovery of work owned by dead workers.

use super::error::{EngineError, Result};
use super::WorkerContext;
use crate::storage::{QueueStore, StorageError};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sweeps the worker set every cleaning interval until `token` is cancelled.
pub(crate) async fn run<S: QueueStore>(
    ctx: Arc<WorkerContext<S>>,
    token: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(ctx.config.cleaning_period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = interval.tick() => {
                sweep(&ctx).await.map_err(EngineError::CleanerStopped)?;
            }
        }
    }
}

/// Requeues the work of every worker whose heartbeat expired, then evicts it.
///
/// Each drain is atomic. A worker is removed from the set only after both of
/// its queues were drained, so a sweep interrupted halfway is finished by the
/// next one. Returns how many workers were evicted.
pub(crate) async fn sweep<S: QueueStore>(
    ctx: &WorkerContext<S>,
) -> std::result::Result<usize, StorageError> {
    let keys = &ctx.keys;
    let mut evicted = 0;

    for member in ctx.store.members(&keys.workers()).await? {
        if member == ctx.worker_id || ctx.store.is_live(&keys.heartbeat(&member)).await? {
            continue;
        }

        let requeued = ctx
            .store
            .drain(&keys.active(&member), &keys.pending())
            .await?;
        let rewatched = ctx
            .store
            .drain(&keys.watched(&member), &keys.deferred())
            .await?;
        ctx.store.remove_member(&keys.workers(), &member).await?;
        evicted += 1;

        info!(
            worker.id = %ctx.worker_id,
            dead_worker = %member,
            requeued,
            rewatched,
            "recovered tasks of dead worker"
        );
    }

    if evicted == 0 {
        debug!(worker.id = %ctx.worker_id, "cleaner found no dead workers");
    }
    Ok(evicted)
}
