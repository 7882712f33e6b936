//! Job handlers and the registry that maps job names to them.

use super::error::{EngineError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Error type returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler knows about the task it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    task_id: Uuid,
    job_name: String,
    token: CancellationToken,
    shutdown: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        task_id: Uuid,
        job_name: impl Into<String>,
        token: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            job_name: job_name.into(),
            token,
            shutdown,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Token cancelled when the handler must give up: shutdown grace expired
    /// or the handler timeout elapsed.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the engine abandons running handlers on shutdown. A task
    /// cancelled this way stays queued and is delivered again; a task
    /// cancelled by the handler timeout is not.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A named unit of work the engine can run.
///
/// Delivery is at least once: after a worker crash the same task runs again
/// on another worker, so handlers must be idempotent. Returning an error
/// only logs it; the task is cleared either way.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: &[u8]) -> std::result::Result<(), BoxError>;
}

/// Adapts an async closure into a [`JobHandler`].
///
/// ```
/// use conveyor::executor::{FnJob, JobContext};
///
/// let job = FnJob::new(|_ctx: JobContext, payload: Vec<u8>| async move {
///     println!("got {} bytes", payload.len());
///     Ok::<_, std::io::Error>(())
/// });
/// # let _ = job;
/// ```
pub struct FnJob<F> {
    f: F,
}

impl<F> FnJob<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, E> JobHandler for FnJob<F>
where
    F: Fn(JobContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: &[u8]) -> std::result::Result<(), BoxError> {
        (self.f)(ctx, payload.to_vec()).await.map_err(Into::into)
    }
}

/// Job name to handler map. Frozen once the engine runs.
#[derive(Default, Clone)]
pub(crate) struct Registry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Registry {
    pub(crate) fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(EngineError::DuplicateJob(name));
        }
        debug!(job = %name, "registered job");
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}
