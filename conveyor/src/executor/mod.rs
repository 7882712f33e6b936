//! The task engine.
//!
//! An [`Engine`] turns one process into a worker of the shared store. It runs
//! a fixed set of actors on the tokio runtime:
//!
//! - **heartbeat**: keeps this worker's liveness key fresh
//! - **cleaner**: requeues the work of workers whose heartbeat expired
//! - **pending receiver** and **dispatchers**: move due tasks into this
//!   worker's active queue and run their handlers
//! - **deferred receiver** and **watchers**: move deferred tasks into this
//!   worker's watched queue and promote them once due
//!
//! The actors share nothing but the store. If any of them fails the whole
//! engine shuts down; the hosting process is expected to restart it.
//!
//! # Example
//!
//! ```no_run
//! use conveyor::executor::{Engine, EngineConfig, JobContext};
//! use conveyor::core::Task;
//! use conveyor::storage::InMemoryQueueStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let store = Arc::new(InMemoryQueueStore::new());
//! let mut engine = Engine::new(store, EngineConfig::default());
//! engine.register_fn("greet", |_ctx: JobContext, payload: Vec<u8>| async move {
//!     println!("hello {}", String::from_utf8_lossy(&payload));
//!     Ok::<_, std::io::Error>(())
//! })?;
//!
//! engine.submit_task(&Task::new("greet", b"world".to_vec())).await?;
//!
//! let token = CancellationToken::new();
//! let stopped = engine.run(token.clone()).await;
//! assert!(stopped.is_cancelled());
//! # Ok(())
//! # }
//! ```

mod cleaner;
mod config;
mod error;
mod lifecycle;
mod registry;
mod scheduler;
mod timer;
mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use registry::{BoxError, FnJob, JobContext, JobHandler};
pub use scheduler::TaskSubmitter;

use crate::core::Task;
use crate::storage::{QueueKeys, QueueStore};
use registry::Registry;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Everything an actor needs to know about the worker it belongs to.
pub(crate) struct WorkerContext<S> {
    pub(crate) store: Arc<S>,
    pub(crate) keys: QueueKeys,
    pub(crate) worker_id: String,
    pub(crate) config: EngineConfig,
}

impl<S> WorkerContext<S> {
    pub(crate) fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            keys: QueueKeys::new(config.key_prefix.clone()),
            worker_id: config.worker_id.clone(),
            config,
        }
    }
}

/// A worker process of the task engine.
///
/// Jobs are registered first; [`run`](Engine::run) consumes the engine, so
/// the set of jobs cannot change while it runs.
pub struct Engine<S: QueueStore> {
    ctx: WorkerContext<S>,
    registry: Registry,
}

impl<S: QueueStore + 'static> Engine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            ctx: WorkerContext::new(store, config),
            registry: Registry::default(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.ctx.worker_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.ctx.keys
    }

    /// Registers `handler` under `name`.
    ///
    /// Fails with [`EngineError::DuplicateJob`] if the name is taken.
    pub fn register_job(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        self.registry.register(name, handler)
    }

    /// Registers an async closure under `name`.
    pub fn register_fn<F, Fut, E>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.register_job(name, Arc::new(FnJob::new(f)))
    }

    /// Queues `task` for execution by any worker sharing the store.
    pub async fn submit_task(&self, task: &Task) -> Result<()> {
        self.submitter().submit_task(task).await?;
        Ok(())
    }

    /// Returns a cloneable handle for submitting tasks, usable after the
    /// engine has been moved into [`run`](Engine::run).
    pub fn submitter(&self) -> TaskSubmitter<S> {
        TaskSubmitter::new(self.ctx.store.clone(), self.ctx.keys.clone())
    }

    /// Runs the worker until `token` is cancelled or an actor fails.
    ///
    /// On the way out, in-flight handlers get the configured shutdown grace,
    /// then this worker's active and watched tasks are requeued and it leaves
    /// the worker set. Returns [`EngineError::Cancelled`] after a requested
    /// shutdown, otherwise the first actor error.
    pub async fn run(self, token: CancellationToken) -> EngineError {
        let Engine { ctx, registry } = self;
        let ctx = Arc::new(ctx);
        let registry = Arc::new(registry);
        let worker_id = ctx.worker_id.clone();

        if let Err(e) = lifecycle::register(&ctx).await {
            error!(worker.id = %worker_id, error = %e, "failed to register worker");
            return EngineError::HeartbeatStopped(e);
        }

        // `soft` stops every actor from taking new work; `hard` abandons
        // running handlers and stops the heartbeat.
        let soft = token.child_token();
        let hard = CancellationToken::new();
        let mut actors = JoinSet::new();
        let mut dispatchers = JoinSet::new();

        actors.spawn(lifecycle::heartbeat(ctx.clone(), hard.clone()));
        actors.spawn(cleaner::run(ctx.clone(), soft.clone()));

        let (pending_tx, pending_rx) = mpsc::channel(1);
        let pending_rx = Arc::new(Mutex::new(pending_rx));
        actors.spawn(worker::receive(
            ctx.clone(),
            ctx.keys.pending(),
            ctx.keys.active(&worker_id),
            pending_tx,
            soft.clone(),
        ));
        for index in 0..ctx.config.dispatchers {
            dispatchers.spawn(worker::dispatch(
                index,
                ctx.clone(),
                registry.clone(),
                pending_rx.clone(),
                soft.clone(),
                hard.clone(),
            ));
        }

        let (deferred_tx, deferred_rx) = mpsc::channel(1);
        let deferred_rx = Arc::new(Mutex::new(deferred_rx));
        actors.spawn(worker::receive(
            ctx.clone(),
            ctx.keys.deferred(),
            ctx.keys.watched(&worker_id),
            deferred_tx,
            soft.clone(),
        ));
        for index in 0..ctx.config.watchers {
            actors.spawn(timer::watch(index, ctx.clone(), deferred_rx.clone(), soft.clone()));
        }

        info!(
            worker.id = %worker_id,
            jobs = registry.len(),
            dispatchers = ctx.config.dispatchers,
            watchers = ctx.config.watchers,
            "engine started"
        );

        let mut first_error = None;
        while first_error.is_none() {
            tokio::select! {
                _ = soft.cancelled() => break,
                Some(joined) = actors.join_next() => first_error = failure(joined),
                Some(joined) = dispatchers.join_next() => first_error = failure(joined),
                else => break,
            }
        }

        match &first_error {
            Some(e) => {
                error!(worker.id = %worker_id, error = %e, "engine actor failed, shutting down")
            }
            None => info!(worker.id = %worker_id, "engine cancelled, shutting down"),
        }
        soft.cancel();

        let grace = ctx.config.shutdown_grace;
        if tokio::time::timeout(grace, join_all(&mut dispatchers, &mut first_error))
            .await
            .is_err()
        {
            warn!(
                worker.id = %worker_id,
                ?grace,
                "shutdown grace expired, abandoning running tasks"
            );
        }
        hard.cancel();
        join_all(&mut dispatchers, &mut first_error).await;
        join_all(&mut actors, &mut first_error).await;

        if let Err(e) = lifecycle::deregister(&ctx).await {
            error!(worker.id = %worker_id, error = %e, "failed to deregister worker");
            first_error.get_or_insert(EngineError::Storage(e));
        }

        info!(worker.id = %worker_id, "engine stopped");
        first_error.unwrap_or(EngineError::Cancelled)
    }
}

fn failure(joined: std::result::Result<Result<()>, JoinError>) -> Option<EngineError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(EngineError::ActorPanicked(e.to_string())),
    }
}

/// Waits for every task of `set`, keeping the first failure.
async fn join_all(set: &mut JoinSet<Result<()>>, first_error: &mut Option<EngineError>) {
    while let Some(joined) = set.join_next().await {
        if let Some(e) = failure(joined) {
            match first_error {
                Some(_) => warn!(error = %e, "actor failed during shutdown"),
                None => *first_error = Some(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryQueueStore;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_worker_id("w1")
            .with_pop_timeout(Duration::from_millis(20))
            .with_shutdown_grace(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_register_fn_rejects_duplicates() {
        let mut engine = Engine::new(Arc::new(InMemoryQueueStore::new()), config());
        engine
            .register_fn("job", |_ctx: JobContext, _p: Vec<u8>| async { Ok::<_, BoxError>(()) })
            .unwrap();
        let err = engine
            .register_fn("job", |_ctx: JobContext, _p: Vec<u8>| async { Ok::<_, BoxError>(()) })
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateJob(_)));
    }

    #[tokio::test]
    async fn test_run_registers_and_deregisters() {
        let store = Arc::new(InMemoryQueueStore::new());
        let engine = Engine::new(store.clone(), config());
        let keys = engine.keys().clone();
        let token = CancellationToken::new();
        let running = tokio::spawn(engine.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.members(&keys.workers()).await.unwrap(), vec!["w1"]);
        assert!(store.is_live(&keys.heartbeat("w1")).await.unwrap());

        token.cancel();
        let stopped = running.await.unwrap();
        assert!(stopped.is_cancelled());
        assert!(store.members(&keys.workers()).await.unwrap().is_empty());
        assert!(!store.is_live(&keys.heartbeat("w1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_still_cleans_up() {
        let store = Arc::new(InMemoryQueueStore::new());
        let engine = Engine::new(store.clone(), config());
        let token = CancellationToken::new();
        token.cancel();

        assert!(engine.run(token).await.is_cancelled());
        assert!(store.members("conveyor:workers").await.unwrap().is_empty());
    }
}
