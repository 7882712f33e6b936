use crate::storage::StorageError;
use thiserror::Error;

/// Engine error type.
///
/// [`Engine::run`](super::Engine::run) always ends with one of these. Each
/// actor that can stop the engine has its own variant, so the caller can
/// tell which failure domain went down.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The cleaner could not sweep dead workers.
    #[error("cleaner stopped: {0}")]
    CleanerStopped(#[source] StorageError),

    /// The heartbeat could not be written.
    #[error("heartbeat stopped: {0}")]
    HeartbeatStopped(#[source] StorageError),

    /// A receiver could not pop from its queue.
    #[error("receiver for {queue} stopped: {source}")]
    ReceiverStopped {
        queue: String,
        #[source]
        source: StorageError,
    },

    /// A dispatcher could not clear a finished task.
    #[error("dispatcher {index} stopped: {source}")]
    DispatcherStopped {
        index: usize,
        #[source]
        source: StorageError,
    },

    /// A watcher could not promote a deferred task.
    #[error("watcher {index} stopped: {source}")]
    WatcherStopped {
        index: usize,
        #[source]
        source: StorageError,
    },

    /// An actor task panicked or was aborted.
    #[error("actor panicked: {0}")]
    ActorPanicked(String),

    /// The engine was cancelled by its caller.
    #[error("engine cancelled")]
    Cancelled,

    /// A job with this name is already registered.
    #[error("job already registered: {0}")]
    DuplicateJob(String),

    /// A store operation outside the actors failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Returns true if the engine stopped because it was asked to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
