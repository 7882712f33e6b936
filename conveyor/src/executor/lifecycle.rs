//! Worker registration, heartbeat and deregistration.

use super::error::{EngineError, Result};
use super::WorkerContext;
use crate::storage::{QueueStore, StorageError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Writes the first heartbeat and joins the worker set.
///
/// The heartbeat goes first so that the cleaner on another process never
/// sees this worker in the set without a live key.
pub(crate) async fn register<S: QueueStore>(
    ctx: &WorkerContext<S>,
) -> std::result::Result<(), StorageError> {
    beat(ctx).await?;
    info!(worker.id = %ctx.worker_id, "worker registered");
    Ok(())
}

async fn beat<S: QueueStore>(ctx: &WorkerContext<S>) -> std::result::Result<(), StorageError> {
    ctx.store
        .set_expiring(&ctx.keys.heartbeat(&ctx.worker_id), ctx.config.heartbeat_ttl)
        .await?;
    // Re-adding also restores membership if a cleaner evicted us during a
    // long stall.
    ctx.store
        .add_member(&ctx.keys.workers(), &ctx.worker_id)
        .await
}

/// Refreshes the heartbeat every half TTL until `token` is cancelled.
pub(crate) async fn heartbeat<S: QueueStore>(
    ctx: std::sync::Arc<WorkerContext<S>>,
    token: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(ctx.config.heartbeat_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and `register` already beat.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = interval.tick() => {
                beat(&ctx).await.map_err(EngineError::HeartbeatStopped)?;
                debug!(worker.id = %ctx.worker_id, "heartbeat");
            }
        }
    }
}

/// Hands this worker's queues back and leaves the worker set.
///
/// Active tasks go back to pending, watched tasks back to the deferred inbox
/// so they keep their delay. Membership is dropped only after both drains
/// succeeded; otherwise the cleaner of another worker finishes the job once
/// the heartbeat expires.
pub(crate) async fn deregister<S: QueueStore>(
    ctx: &WorkerContext<S>,
) -> std::result::Result<(), StorageError> {
    let worker_id = &ctx.worker_id;
    let requeued = ctx
        .store
        .drain(&ctx.keys.active(worker_id), &ctx.keys.pending())
        .await?;
    let rewatched = ctx
        .store
        .drain(&ctx.keys.watched(worker_id), &ctx.keys.deferred())
        .await?;
    ctx.store.remove_member(&ctx.keys.workers(), worker_id).await?;
    ctx.store.delete(&ctx.keys.heartbeat(worker_id)).await?;
    info!(
        worker.id = %worker_id,
        requeued,
        rewatched,
        "worker deregistered"
    );
    Ok(())
}
