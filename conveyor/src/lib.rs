//! Conveyor: crash-recoverable task execution for service provisioning.
//!
//! `conveyor` runs named units of work across a pool of cooperating worker
//! processes that share nothing but a queue store. Every task is executed at
//! least once: a worker that dies mid-task has its work requeued by the
//! others. On top of the engine, step chains drive long-running provisioning,
//! update, deprovisioning and binding operations as sequences of small,
//! independently retryable tasks.
//!
//! # Quick Start
//!
//! ```no_run
//! use conveyor::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let store = Arc::new(InMemoryQueueStore::new());
//!     let mut engine = Engine::new(store, EngineConfig::default());
//!
//!     engine.register_fn("send-welcome", |ctx: JobContext, payload: Vec<u8>| async move {
//!         println!("task {}: {}", ctx.task_id(), String::from_utf8_lossy(&payload));
//!         Ok::<_, BoxError>(())
//!     })?;
//!     engine.submit_task(&Task::new("send-welcome", b"ada".to_vec())).await?;
//!
//!     let token = CancellationToken::new();
//!     let stop = token.clone();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         stop.cancel();
//!     });
//!
//!     let stopped = engine.run(token).await;
//!     println!("engine stopped: {}", stopped);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: the task record and its encoding
//! - [`storage`]: the shared queue store (in memory, or Redis with the
//!   `redis` feature)
//! - [`executor`]: the engine, its actors and job handlers
//! - [`resource`]: resources, their lifecycle state machine and persistence
//! - [`chain`]: step chains and the runner that drives them

pub mod chain;
pub mod core;
pub mod executor;
pub mod resource;
pub mod storage;

pub use core::{CoreError, Task};

pub use executor::{
    BoxError, Engine, EngineConfig, EngineError, FnJob, JobContext, JobHandler, TaskSubmitter,
};

pub use storage::{InMemoryQueueStore, QueueKeys, QueueStore, StorageError};

#[cfg(feature = "redis")]
pub use storage::RedisQueueStore;

pub use resource::{InMemoryResourceStore, Resource, ResourceId, ResourceStore, Status};

#[cfg(feature = "redis")]
pub use resource::RedisResourceStore;

pub use chain::{
    Chain, ChainError, ChainRunner, Operation, RunnerError, ServiceChains, Step, StepFailure,
    StepInput, UpdateRequest, Workflows,
};

// Types that appear in the public API.
pub use serde;
pub use tokio;
pub use tokio_util;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// ```
/// use conveyor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::Task;

    pub use crate::executor::{
        BoxError, Engine, EngineConfig, EngineError, JobContext, JobHandler, TaskSubmitter,
    };

    pub use crate::storage::{InMemoryQueueStore, QueueStore, StorageError};

    #[cfg(feature = "redis")]
    pub use crate::storage::RedisQueueStore;

    pub use crate::resource::{InMemoryResourceStore, Resource, ResourceId, ResourceStore, Status};

    #[cfg(feature = "redis")]
    pub use crate::resource::RedisResourceStore;

    pub use crate::chain::{
        Chain, ChainRunner, ServiceChains, StepFailure, StepInput, UpdateRequest, Workflows,
    };

    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
