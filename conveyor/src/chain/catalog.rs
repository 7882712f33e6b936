//! The catalog of chains per service.
//!
//! Every service module brings its own detail type, so chains are stored
//! behind [`ErasedChain`], which decodes and encodes details as JSON at the
//! boundary.

use super::error::ChainError;
use super::runner::Operation;
use super::{Chain, StepInput};
use crate::executor::BoxError;
use crate::resource::Resource;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Result of running one step: the details to persist and, if the step
/// failed, why.
pub(crate) struct StepOutcome {
    pub(crate) details: serde_json::Value,
    pub(crate) error: Option<BoxError>,
}

/// A chain with its detail type hidden.
#[async_trait]
pub(crate) trait ErasedChain: Send + Sync {
    fn first(&self) -> Option<&str>;

    fn next(&self, step: &str) -> Option<&str>;

    fn contains(&self, step: &str) -> bool;

    async fn execute(
        &self,
        step: &str,
        token: CancellationToken,
        resource: &Resource,
        parent: Option<Resource>,
    ) -> Result<StepOutcome, ChainError>;
}

#[async_trait]
impl<D> ErasedChain for Chain<D>
where
    D: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    fn first(&self) -> Option<&str> {
        Chain::first(self).map(|s| s.name())
    }

    fn next(&self, step: &str) -> Option<&str> {
        Chain::next(self, step).map(|s| s.name())
    }

    fn contains(&self, step: &str) -> bool {
        self.step(step).is_some()
    }

    async fn execute(
        &self,
        step: &str,
        token: CancellationToken,
        resource: &Resource,
        parent: Option<Resource>,
    ) -> Result<StepOutcome, ChainError> {
        let handler = self
            .step(step)
            .ok_or_else(|| ChainError::UnknownStep {
                step: step.to_string(),
            })?
            .handler()
            .clone();
        let details_error = |source| ChainError::Details {
            step: step.to_string(),
            source,
        };

        let details: D = resource.details_as().map_err(details_error)?;
        let input = StepInput {
            token: token.clone(),
            resource: resource.clone(),
            details,
            parent,
        };

        // A panicking step fails the resource like any other step error.
        let mut running = AbortOnDrop(tokio::spawn(
            async move { handler.execute(input).await }.in_current_span(),
        ));
        let joined = tokio::select! {
            joined = &mut running.0 => joined,
            _ = token.cancelled() => {
                return Err(ChainError::Cancelled {
                    step: step.to_string(),
                });
            }
        };

        let (details, error) = match joined {
            Ok(Ok(details)) => (details, None),
            Ok(Err(failure)) => (failure.details, Some(failure.error)),
            Err(e) => {
                let error: BoxError = format!("step {} panicked: {}", step, e).into();
                return Ok(StepOutcome {
                    details: resource.details.clone(),
                    error: Some(error),
                });
            }
        };
        let details = serde_json::to_value(&details)
            .map_err(|e| details_error(crate::core::CoreError::Serialization(e)))?;
        Ok(StepOutcome { details, error })
    }
}

/// Aborts a step task that is no longer waited for.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Stand-in for a chain a service does not provide.
struct NoSteps;

#[async_trait]
impl ErasedChain for NoSteps {
    fn first(&self) -> Option<&str> {
        None
    }

    fn next(&self, _step: &str) -> Option<&str> {
        None
    }

    fn contains(&self, _step: &str) -> bool {
        false
    }

    async fn execute(
        &self,
        step: &str,
        _token: CancellationToken,
        _resource: &Resource,
        _parent: Option<Resource>,
    ) -> Result<StepOutcome, ChainError> {
        Err(ChainError::UnknownStep {
            step: step.to_string(),
        })
    }
}

/// The chains of one service.
///
/// Services without bindings leave out the binder and unbinder; binding
/// such a service completes immediately.
#[derive(Clone)]
pub struct ServiceChains {
    provisioner: Arc<dyn ErasedChain>,
    updater: Arc<dyn ErasedChain>,
    deprovisioner: Arc<dyn ErasedChain>,
    binder: Option<Arc<dyn ErasedChain>>,
    unbinder: Option<Arc<dyn ErasedChain>>,
}

impl ServiceChains {
    pub fn new<P, U, X>(provisioner: Chain<P>, updater: Chain<U>, deprovisioner: Chain<X>) -> Self
    where
        P: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        U: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
        X: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    {
        Self {
            provisioner: Arc::new(provisioner),
            updater: Arc::new(updater),
            deprovisioner: Arc::new(deprovisioner),
            binder: None,
            unbinder: None,
        }
    }

    pub fn with_binder<B>(mut self, binder: Chain<B>) -> Self
    where
        B: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    {
        self.binder = Some(Arc::new(binder));
        self
    }

    pub fn with_unbinder<B>(mut self, unbinder: Chain<B>) -> Self
    where
        B: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    {
        self.unbinder = Some(Arc::new(unbinder));
        self
    }

    pub(crate) fn chain(&self, operation: Operation) -> Arc<dyn ErasedChain> {
        let chain = match operation {
            Operation::Provision => Some(&self.provisioner),
            Operation::Update => Some(&self.updater),
            Operation::Deprovision => Some(&self.deprovisioner),
            Operation::Bind => self.binder.as_ref(),
            Operation::Unbind => self.unbinder.as_ref(),
        };
        match chain {
            Some(chain) => chain.clone(),
            None => Arc::new(NoSteps),
        }
    }
}

/// Service id to [`ServiceChains`].
#[derive(Clone, Default)]
pub struct Workflows {
    services: HashMap<String, ServiceChains>,
}

impl Workflows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        service_id: impl Into<String>,
        chains: ServiceChains,
    ) -> Result<(), ChainError> {
        let service_id = service_id.into();
        if self.services.contains_key(&service_id) {
            return Err(ChainError::DuplicateService { service_id });
        }
        self.services.insert(service_id, chains);
        Ok(())
    }

    /// Builder form of [`register`](Workflows::register).
    pub fn with_service(
        mut self,
        service_id: impl Into<String>,
        chains: ServiceChains,
    ) -> Result<Self, ChainError> {
        self.register(service_id, chains)?;
        Ok(self)
    }

    pub fn get(&self, service_id: &str) -> Option<&ServiceChains> {
        self.services.get(service_id)
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }
}
