//! Externally observable lifecycle of a resource.
//!
//! Instances:
//!
//! ```text
//! PROVISIONING_DEFERRED -> PROVISIONING -> PROVISIONED | PROVISIONING_FAILED
//! PROVISIONING_DEFERRED -> PROVISIONING_FAILED
//! PROVISIONED -> UPDATING -> PROVISIONED | UPDATING_FAILED
//! PROVISIONED | PROVISIONING_FAILED | UPDATING_FAILED | DEPROVISIONING_FAILED
//!     -> DEPROVISIONING_DEFERRED | DEPROVISIONING
//! DEPROVISIONING_DEFERRED -> DEPROVISIONING -> (removed) | DEPROVISIONING_FAILED
//! ```
//!
//! Bindings:
//!
//! ```text
//! BINDING -> BOUND | BINDING_FAILED
//! BOUND | BINDING_FAILED | UNBINDING_FAILED -> UNBINDING -> (removed) | UNBINDING_FAILED
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status of an instance or binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    ProvisioningDeferred,
    Provisioning,
    Provisioned,
    ProvisioningFailed,
    Updating,
    UpdatingFailed,
    DeprovisioningDeferred,
    Deprovisioning,
    DeprovisioningFailed,
    Binding,
    Bound,
    BindingFailed,
    Unbinding,
    UnbindingFailed,
}

/// A status change the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot move from {from} to {to}")]
#[non_exhaustive]
pub struct TransitionError {
    pub from: Status,
    pub to: Status,
}

/// Returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(pub String);

impl Status {
    pub const ALL: [Status; 14] = [
        Status::ProvisioningDeferred,
        Status::Provisioning,
        Status::Provisioned,
        Status::ProvisioningFailed,
        Status::Updating,
        Status::UpdatingFailed,
        Status::DeprovisioningDeferred,
        Status::Deprovisioning,
        Status::DeprovisioningFailed,
        Status::Binding,
        Status::Bound,
        Status::BindingFailed,
        Status::Unbinding,
        Status::UnbindingFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::ProvisioningDeferred => "PROVISIONING_DEFERRED",
            Status::Provisioning => "PROVISIONING",
            Status::Provisioned => "PROVISIONED",
            Status::ProvisioningFailed => "PROVISIONING_FAILED",
            Status::Updating => "UPDATING",
            Status::UpdatingFailed => "UPDATING_FAILED",
            Status::DeprovisioningDeferred => "DEPROVISIONING_DEFERRED",
            Status::Deprovisioning => "DEPROVISIONING",
            Status::DeprovisioningFailed => "DEPROVISIONING_FAILED",
            Status::Binding => "BINDING",
            Status::Bound => "BOUND",
            Status::BindingFailed => "BINDING_FAILED",
            Status::Unbinding => "UNBINDING",
            Status::UnbindingFailed => "UNBINDING_FAILED",
        }
    }

    /// Returns true for the statuses a new resource may be created in.
    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            Status::Provisioning | Status::ProvisioningDeferred | Status::Binding
        )
    }

    /// Returns true while a chain is running for the resource.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Status::Provisioning
                | Status::Updating
                | Status::Deprovisioning
                | Status::Binding
                | Status::Unbinding
        )
    }

    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            Status::ProvisioningDeferred | Status::DeprovisioningDeferred
        )
    }

    /// Returns true for the sticky failure states.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Status::ProvisioningFailed
                | Status::UpdatingFailed
                | Status::DeprovisioningFailed
                | Status::BindingFailed
                | Status::UnbindingFailed
        )
    }

    /// Returns true for binding statuses.
    pub fn is_binding(&self) -> bool {
        matches!(
            self,
            Status::Binding
                | Status::Bound
                | Status::BindingFailed
                | Status::Unbinding
                | Status::UnbindingFailed
        )
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (ProvisioningDeferred, Provisioning | ProvisioningFailed) => true,
            (Provisioning, Provisioned | ProvisioningFailed) => true,
            (Provisioned, Updating) => true,
            (Updating, Provisioned | UpdatingFailed) => true,
            (
                Provisioned | ProvisioningFailed | UpdatingFailed | DeprovisioningFailed,
                DeprovisioningDeferred | Deprovisioning,
            ) => true,
            (DeprovisioningDeferred, Deprovisioning) => true,
            (Deprovisioning, DeprovisioningFailed) => true,
            (Binding, Bound | BindingFailed) => true,
            (Bound | BindingFailed | UnbindingFailed, Unbinding) => true,
            (Unbinding, UnbindingFailed) => true,
            _ => false,
        }
    }

    /// Checks a transition, returning the error to report when it is not
    /// allowed.
    pub fn transition_to(&self, next: Status) -> Result<Status, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_forms_are_stable() {
        for status in Status::ALL {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
        assert_eq!(Status::DeprovisioningDeferred.to_string(), "DEPROVISIONING_DEFERRED");
        assert!("provisioned".parse::<Status>().is_err());
    }

    #[test]
    fn test_provisioning_path() {
        assert!(Status::ProvisioningDeferred.can_transition_to(Status::Provisioning));
        assert!(Status::ProvisioningDeferred.can_transition_to(Status::ProvisioningFailed));
        assert!(Status::Provisioning.can_transition_to(Status::Provisioned));
        assert!(Status::Provisioning.can_transition_to(Status::ProvisioningFailed));
        assert!(!Status::ProvisioningDeferred.can_transition_to(Status::Provisioned));
    }

    #[test]
    fn test_no_skipping_to_unrelated_failure() {
        assert!(!Status::Provisioned.can_transition_to(Status::DeprovisioningFailed));
        assert!(!Status::Provisioned.can_transition_to(Status::ProvisioningFailed));
        assert!(!Status::Updating.can_transition_to(Status::Deprovisioning));

        let err = Status::Provisioned
            .transition_to(Status::DeprovisioningFailed)
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot move from PROVISIONED to DEPROVISIONING_FAILED");
    }

    #[test]
    fn test_failures_are_left_only_by_new_operations() {
        for failed in [
            Status::ProvisioningFailed,
            Status::UpdatingFailed,
            Status::DeprovisioningFailed,
        ] {
            assert!(failed.can_transition_to(Status::Deprovisioning));
            assert!(failed.can_transition_to(Status::DeprovisioningDeferred));
            assert!(!failed.can_transition_to(Status::Provisioned));
        }
        assert!(Status::UnbindingFailed.can_transition_to(Status::Unbinding));
        assert!(!Status::BindingFailed.can_transition_to(Status::Bound));
    }

    #[test]
    fn test_instance_and_binding_paths_do_not_mix() {
        for status in Status::ALL {
            for next in Status::ALL {
                if status.can_transition_to(next) {
                    assert_eq!(status.is_binding(), next.is_binding(), "{status} -> {next}");
                }
            }
        }
    }

    #[test]
    fn test_classification() {
        assert!(Status::Binding.is_initial());
        assert!(!Status::Bound.is_initial());
        assert!(Status::Unbinding.is_in_progress());
        assert!(Status::DeprovisioningDeferred.is_deferred());
        assert!(Status::UnbindingFailed.is_failed());
    }
}
