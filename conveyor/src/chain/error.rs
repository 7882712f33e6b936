use crate::core::CoreError;
use crate::executor::EngineError;
use crate::resource::{ResourceId, TransitionError};
use crate::storage::StorageError;
use thiserror::Error;

/// Errors building or executing a chain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChainError {
    /// Two steps of one chain share a name.
    #[error("duplicate step name: {step}")]
    DuplicateStep { step: String },

    /// A task named a step the chain does not have.
    #[error("unknown step: {step}")]
    UnknownStep { step: String },

    /// The step's token was cancelled before it finished.
    #[error("step {step} was cancelled before it finished")]
    Cancelled { step: String },

    /// A service was added to the catalog twice.
    #[error("service already registered: {service_id}")]
    DuplicateService { service_id: String },

    /// The stored details do not fit the chain's detail type, or the step's
    /// details could not be encoded.
    #[error("details of step {step} do not match the chain: {source}")]
    Details {
        step: String,
        #[source]
        source: CoreError,
    },
}

/// Errors of the chain runner's operations and jobs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    #[error("resource already exists: {0}")]
    AlreadyExists(ResourceId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// The parent is missing or in a state that can never satisfy the child.
    #[error("parent {parent} of {id} is unavailable")]
    ParentUnavailable { id: ResourceId, parent: ResourceId },

    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The resource handed to an operation does not fit it.
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
