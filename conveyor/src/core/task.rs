//! The durable unit of work.
//!
//! A [`Task`] is what travels through the queues. The queue entry *is* the
//! task: there is no separate record to keep in sync, so a task is always in
//! exactly one queue (pending, deferred, a worker's active queue, or a
//! worker's watched queue) until it is completed or dropped.

use super::error::Result;
use super::serialization::{deserialize_value, serialize_value};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A named unit of work with an opaque payload.
///
/// The payload is handed to the job registered under `job_name` exactly as
/// submitted. When `execute_time` is set and still in the future, the task is
/// deferred until that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: Uuid,
    /// Name of the job that handles this task.
    pub job_name: String,
    /// Opaque payload, base64 encoded inside the queue entry.
    #[serde(with = "payload_encoding")]
    pub payload: Vec<u8>,
    /// Earliest time the task may run. `None` means immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_time: Option<DateTime<Utc>>,
    /// When this task was created.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a task that is eligible to run immediately.
    pub fn new(job_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            payload: payload.into(),
            execute_time: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a task whose payload is the JSON encoding of `payload`.
    pub fn with_json<T: Serialize>(job_name: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(job_name, serialize_value(payload)?))
    }

    /// Defers the task until `at`.
    pub fn execute_at(mut self, at: DateTime<Utc>) -> Self {
        self.execute_time = Some(at);
        self
    }

    /// Defers the task by `delay` from now.
    pub fn execute_after(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.execute_at(at)
    }

    /// Returns true if the task may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execute_time.is_none_or(|at| at <= now)
    }

    /// Time left until the task becomes due, zero if it already is.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.execute_time
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Decodes the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        deserialize_value(&self.payload)
    }

    /// Encodes the task as a queue entry.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serialize_value(self)
    }

    /// Decodes a queue entry.
    pub fn decode(entry: &[u8]) -> Result<Self> {
        deserialize_value(entry)
    }
}

mod payload_encoding {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
