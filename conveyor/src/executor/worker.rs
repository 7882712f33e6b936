//! Receivers and the dispatcher pool.
//!
//! A receiver moves one entry at a time from a shared queue into a queue this
//! worker owns, then hands it to a pool over a bounded channel. It reserves
//! channel capacity before popping, so a popped entry never sits in this
//! worker's queue while the whole pool is busy for longer than one hand-off.

use super::error::{EngineError, Result};
use super::registry::{BoxError, JobContext, Registry};
use super::WorkerContext;
use crate::core::Task;
use crate::storage::{QueueStore, StorageError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

/// A decoded task together with the exact bytes it was stored as.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) task: Task,
    pub(crate) entry: Vec<u8>,
}

/// Receiving end shared by every member of a pool.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Delivery>>>;

/// Moves entries from `source` to `destination` and feeds them to a pool.
///
/// Entries that do not decode are removed from `destination` and skipped.
/// Stops cleanly when `token` is cancelled or every pool member is gone.
pub(crate) async fn receive<S: QueueStore>(
    ctx: Arc<WorkerContext<S>>,
    source: String,
    destination: String,
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
) -> Result<()> {
    let stopped = |source_err: StorageError| EngineError::ReceiverStopped {
        queue: source.clone(),
        source: source_err,
    };

    loop {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(()),
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            },
        };

        // The pop is bounded by the pop timeout, so cancellation is seen on
        // the next iteration without abandoning an in-flight move.
        let entry = ctx
            .store
            .pop_into(&source, &destination, ctx.config.pop_timeout)
            .await
            .map_err(stopped)?;
        let Some(entry) = entry else {
            continue;
        };

        match Task::decode(&entry) {
            Ok(task) => {
                debug!(task.id = %task.id, queue = %destination, "received task");
                permit.send(Delivery { task, entry });
            }
            Err(e) => {
                warn!(
                    worker.id = %ctx.worker_id,
                    queue = %destination,
                    error = %e,
                    "dropping malformed task entry"
                );
                ctx.store.remove(&destination, &entry).await.map_err(stopped)?;
            }
        }
    }
}

/// Runs handlers for tasks handed over by the pending receiver.
///
/// `token` stops taking new tasks; `hard` abandons the running one. An
/// abandoned task stays in the active queue for deregistration to requeue.
pub(crate) async fn dispatch<S: QueueStore>(
    index: usize,
    ctx: Arc<WorkerContext<S>>,
    registry: Arc<Registry>,
    rx: SharedReceiver,
    token: CancellationToken,
    hard: CancellationToken,
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

        let span = info_span!(
            "task",
            task.id = %delivery.task.id,
            job = %delivery.task.job_name,
            worker.id = %ctx.worker_id,
        );
        execute(&ctx, &registry, delivery, &hard)
            .instrument(span)
            .await
            .map_err(|source| EngineError::DispatcherStopped { index, source })?;
    }
}

async fn execute<S: QueueStore>(
    ctx: &WorkerContext<S>,
    registry: &Registry,
    delivery: Delivery,
    hard: &CancellationToken,
) -> std::result::Result<(), StorageError> {
    let Delivery { task, entry } = delivery;
    let active = ctx.keys.active(&ctx.worker_id);

    let Some(handler) = registry.get(&task.job_name) else {
        warn!("no handler registered for job, dropping task");
        ctx.store.remove(&active, &entry).await?;
        return Ok(());
    };

    // The handler runs in its own task so that a panic fails the task, not
    // the dispatcher.
    let job_token = hard.child_token();
    let job_ctx = JobContext::new(task.id, task.job_name.clone(), job_token.clone(), hard.clone());
    let payload = task.payload;
    let mut running = tokio::spawn(
        async move { handler.handle(job_ctx, &payload).await }.in_current_span(),
    );

    let outcome = tokio::select! {
        biased;
        _ = hard.cancelled() => {
            running.abort();
            warn!("shutdown grace expired, leaving task for requeue");
            return Ok(());
        }
        outcome = wait_for_handler(&mut running, &job_token, ctx.config.handler_timeout) => outcome,
    };

    match outcome {
        Ok(()) => debug!("task completed"),
        Err(e) => warn!(error = %e, "task handler failed"),
    }

    if !ctx.store.remove(&active, &entry).await? {
        // Only happens if a cleaner judged this worker dead mid-run.
        warn!("finished task was no longer in the active queue");
    }
    Ok(())
}

type HandlerOutcome = std::result::Result<(), BoxError>;

/// Waits for a spawned handler.
///
/// Once `limit` elapses the handler's token is cancelled and it gets as long
/// again to wind down before it is aborted.
async fn wait_for_handler(
    running: &mut JoinHandle<HandlerOutcome>,
    token: &CancellationToken,
    limit: Option<Duration>,
) -> HandlerOutcome {
    let Some(limit) = limit else {
        return joined(running.await);
    };
    if let Ok(result) = tokio::time::timeout(limit, &mut *running).await {
        return joined(result);
    }

    warn!(?limit, "handler timed out, cancelling it");
    token.cancel();
    match tokio::time::timeout(limit, &mut *running).await {
        Ok(result) => joined(result).and_then(|()| {
            Err(format!("handler timed out after {:?}", limit).into())
        }),
        Err(_) => {
            running.abort();
            Err(format!("handler timed out after {:?} and ignored cancellation", limit).into())
        }
    }
}

fn joined(result: std::result::Result<HandlerOutcome, JoinError>) -> HandlerOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "task handler panicked");
            Err(e.into())
        }
    }
}
