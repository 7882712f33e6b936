//! Core types and utilities for the conveyor task engine.
//!
//! # Domain Model
//! - [`Task`]: a durable, queued unit of work with a job name and payload
//!
//! # Serialization
//! - [`serialize_value`]: Convert Rust types to bytes for storage
//! - [`deserialize_value`]: Convert bytes back to Rust types
//!
//! # Error Handling
//! - [`CoreError`]: Core error type with proper error chains
//! - [`Result<T>`]: Type alias for Results using CoreError
//!
//! # Example
//!
//! ```
//! use conveyor::core::Task;
//! use std::time::Duration;
//!
//! let task = Task::new("reports.build", b"{\"report\":42}".to_vec())
//!     .execute_after(Duration::from_secs(30));
//! assert!(!task.is_due(chrono::Utc::now()));
//! ```

mod error;
mod serialization;
mod task;

pub use error::{CoreError, Result};
pub use serialization::{deserialize_value, serialize_value};
pub use task::Task;
