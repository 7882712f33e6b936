//! Step chains: multi-step operations driven as a sequence of tasks.
//!
//! A [`Chain`] is a static, ordered list of named steps. It holds no
//! execution state; the [`ChainRunner`] submits one task per step and the
//! resource record carries the details between them. A crash at any point
//! only ever re-runs the current step.
//!
//! # Example
//!
//! ```
//! use conveyor::chain::{Chain, Step, StepFailure, StepInput};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct VmDetails {
//!     vm_id: Option<String>,
//! }
//!
//! let provisioner = Chain::builder()
//!     .step_fn("create-vm", |input: StepInput<VmDetails>| async move {
//!         let mut details = input.details;
//!         details.vm_id.get_or_insert_with(|| "vm-42".to_string());
//!         Ok::<_, StepFailure<VmDetails>>(details)
//!     })
//!     .step_fn("wait-for-boot", |input: StepInput<VmDetails>| async move {
//!         Ok::<_, StepFailure<VmDetails>>(input.details)
//!     })
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(provisioner.first().map(|s| s.name()), Some("create-vm"));
//! assert_eq!(provisioner.next("create-vm").map(|s| s.name()), Some("wait-for-boot"));
//! assert!(provisioner.next("wait-for-boot").is_none());
//! ```

mod catalog;
mod error;
mod runner;
mod step;

pub use catalog::{ServiceChains, Workflows};
pub use error::{ChainError, Result, RunnerError};
pub use runner::{ChainRunner, Operation, UpdateRequest, RESOLVE_DEPENDENTS_JOB};
pub use step::{FnStep, Step, StepFailure, StepHandler, StepInput};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// An ordered sequence of uniquely named steps over detail type `D`.
pub struct Chain<D> {
    steps: Vec<Step<D>>,
    positions: HashMap<String, usize>,
}

impl<D: Send + 'static> Chain<D> {
    /// Builds a chain from `steps`, rejecting duplicate names.
    pub fn new(steps: Vec<Step<D>>) -> std::result::Result<Self, ChainError> {
        let mut positions = HashMap::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            if positions.insert(step.name().to_string(), index).is_some() {
                return Err(ChainError::DuplicateStep {
                    step: step.name().to_string(),
                });
            }
        }
        Ok(Self { steps, positions })
    }

    /// A chain with no steps. Running it completes immediately.
    pub fn empty() -> Self {
        Self {
            steps: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn builder() -> ChainBuilder<D> {
        ChainBuilder { steps: Vec::new() }
    }

    pub fn first(&self) -> Option<&Step<D>> {
        self.steps.first()
    }

    pub fn step(&self, name: &str) -> Option<&Step<D>> {
        self.positions.get(name).map(|&index| &self.steps[index])
    }

    /// The step after `name`; `None` for the last step or an unknown name.
    pub fn next(&self, name: &str) -> Option<&Step<D>> {
        self.positions
            .get(name)
            .and_then(|&index| self.steps.get(index + 1))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(Step::name)
    }
}

impl<D> std::fmt::Debug for Chain<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.steps.iter()).finish()
    }
}

/// Collects steps for a [`Chain`].
pub struct ChainBuilder<D> {
    steps: Vec<Step<D>>,
}

impl<D: Send + 'static> ChainBuilder<D> {
    pub fn step(mut self, name: impl Into<String>, handler: Arc<dyn StepHandler<D>>) -> Self {
        self.steps.push(Step::new(name, handler));
        self
    }

    pub fn step_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<D, StepFailure<D>>> + Send + 'static,
    {
        self.steps.push(Step::from_fn(name, f));
        self
    }

    pub fn build(self) -> std::result::Result<Chain<D>, ChainError> {
        Chain::new(self.steps)
    }
}
