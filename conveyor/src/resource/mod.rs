//! Resources driven by step chains and where they are kept.
//!
//! A [`Resource`] is either a service instance or a binding to one. Its
//! [`Status`] is the only part visible to the outside world; `details` is
//! whatever the chain steps need to remember between tasks.

mod status;
mod store;

#[cfg(feature = "redis")]
mod redis;

pub use status::{ParseStatusError, Status, TransitionError};
pub use store::{InMemoryResourceStore, ResourceStore};

#[cfg(feature = "redis")]
pub use self::redis::RedisResourceStore;

use crate::core::{CoreError, Result as CoreResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a resource, chosen by whoever creates it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    Binding,
}

/// A service instance or binding and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub service_id: String,
    pub plan_id: String,
    /// The instance a binding belongs to, or the parent of a child instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ResourceId>,
    pub status: Status,
    /// Why the resource is in its status. Set on failures and deferrals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Provisioning parameters as requested.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// State produced by chain steps.
    #[serde(default)]
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// A new instance about to be provisioned.
    pub fn instance(
        id: impl Into<ResourceId>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self::new(
            id.into(),
            ResourceKind::Instance,
            service_id.into(),
            plan_id.into(),
            Status::Provisioning,
        )
    }

    /// A new binding to `instance_id` about to be bound.
    pub fn binding(
        id: impl Into<ResourceId>,
        instance_id: impl Into<ResourceId>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        let mut binding = Self::new(
            id.into(),
            ResourceKind::Binding,
            service_id.into(),
            plan_id.into(),
            Status::Binding,
        );
        binding.parent_id = Some(instance_id.into());
        binding
    }

    fn new(
        id: ResourceId,
        kind: ResourceKind,
        service_id: String,
        plan_id: String,
        status: Status,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            service_id,
            plan_id,
            parent_id: None,
            status,
            status_reason: None,
            parameters: serde_json::Value::Null,
            details: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Makes this instance a child of `parent`. Its provisioning waits until
    /// the parent is provisioned.
    pub fn with_parent(mut self, parent: impl Into<ResourceId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Decodes the step details. Absent details decode as `D::default()`.
    pub fn details_as<D: DeserializeOwned + Default>(&self) -> CoreResult<D> {
        if self.details.is_null() {
            return Ok(D::default());
        }
        serde_json::from_value(self.details.clone()).map_err(CoreError::Deserialization)
    }

    /// Replaces the step details.
    pub fn set_details<D: Serialize>(&mut self, details: &D) -> CoreResult<()> {
        self.details = serde_json::to_value(details).map_err(CoreError::Serialization)?;
        self.touch();
        Ok(())
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(
        &mut self,
        next: Status,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        self.status = self.status.transition_to(next)?;
        self.status_reason = reason;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
