use crate::executor::BoxError;
use crate::resource::Resource;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a step gets to work with.
#[derive(Debug, Clone)]
pub struct StepInput<D> {
    /// Cancelled when the engine gives up on the task.
    pub token: CancellationToken,
    /// The resource as stored before this step.
    pub resource: Resource,
    /// Details produced by the previous steps.
    pub details: D,
    /// The parent instance, if the resource has one.
    pub parent: Option<Resource>,
}

/// A failed step. The details are kept even though the step failed, so
/// whatever it managed to create can still be cleaned up later.
#[derive(Debug)]
pub struct StepFailure<D> {
    pub details: D,
    pub error: BoxError,
}

impl<D> StepFailure<D> {
    pub fn new(details: D, error: impl Into<BoxError>) -> Self {
        Self {
            details,
            error: error.into(),
        }
    }
}

/// One idempotent unit of a chain.
///
/// A step may run more than once after a worker crash, always with the
/// details persisted before its first attempt.
#[async_trait]
pub trait StepHandler<D: Send + 'static>: Send + Sync {
    async fn execute(&self, input: StepInput<D>) -> Result<D, StepFailure<D>>;
}

/// Adapts an async closure into a [`StepHandler`].
pub struct FnStep<F> {
    f: F,
}

#[async_trait]
impl<D, F, Fut> StepHandler<D> for FnStep<F>
where
    D: Send + 'static,
    F: Fn(StepInput<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<D, StepFailure<D>>> + Send + 'static,
{
    async fn execute(&self, input: StepInput<D>) -> Result<D, StepFailure<D>> {
        (self.f)(input).await
    }
}

/// A named step.
pub struct Step<D> {
    name: String,
    handler: Arc<dyn StepHandler<D>>,
}

impl<D: Send + 'static> Step<D> {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler<D>>) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, StepFailure<D>>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnStep { f }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handler(&self) -> &Arc<dyn StepHandler<D>> {
        &self.handler
    }
}

impl<D> Clone for Step<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<D> std::fmt::Debug for Step<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}
