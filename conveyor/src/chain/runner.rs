//! Drives chains through the task engine.
//!
//! Every step of every running chain is one task. The payload names the
//! resource and the step; everything else lives in the resource record. A
//! step task that finds its resource no longer in the operation's
//! in-progress status does nothing, which makes redelivery after a crash
//! safe.

use super::catalog::{ErasedChain, ServiceChains, Workflows};
use super::error::{ChainError, Result, RunnerError};
use crate::core::{deserialize_value, Task};
use crate::executor::{BoxError, Engine, JobContext, JobHandler, TaskSubmitter};
use crate::resource::{Resource, ResourceId, ResourceKind, ResourceStore, Status};
use crate::storage::QueueStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Job that promotes resources waiting on the resource in its payload.
pub const RESOLVE_DEPENDENTS_JOB: &str = "conveyor.resolve-dependents";

/// The user-facing operations, each backed by one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Provision,
    Update,
    Deprovision,
    Bind,
    Unbind,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Provision,
        Operation::Update,
        Operation::Deprovision,
        Operation::Bind,
        Operation::Unbind,
    ];

    /// Name of the job running this operation's steps.
    pub fn job_name(&self) -> &'static str {
        match self {
            Operation::Provision => "conveyor.provision-step",
            Operation::Update => "conveyor.update-step",
            Operation::Deprovision => "conveyor.deprovision-step",
            Operation::Bind => "conveyor.bind-step",
            Operation::Unbind => "conveyor.unbind-step",
        }
    }

    /// Status of a resource while this operation's chain runs.
    pub fn in_progress(&self) -> Status {
        match self {
            Operation::Provision => Status::Provisioning,
            Operation::Update => Status::Updating,
            Operation::Deprovision => Status::Deprovisioning,
            Operation::Bind => Status::Binding,
            Operation::Unbind => Status::Unbinding,
        }
    }

    /// Status after the last step succeeded; `None` when the record is
    /// purged instead.
    pub fn succeeded(&self) -> Option<Status> {
        match self {
            Operation::Provision | Operation::Update => Some(Status::Provisioned),
            Operation::Bind => Some(Status::Bound),
            Operation::Deprovision | Operation::Unbind => None,
        }
    }

    pub fn failed(&self) -> Status {
        match self {
            Operation::Provision => Status::ProvisioningFailed,
            Operation::Update => Status::UpdatingFailed,
            Operation::Deprovision => Status::DeprovisioningFailed,
            Operation::Bind => Status::BindingFailed,
            Operation::Unbind => Status::UnbindingFailed,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Provision => "provision",
            Operation::Update => "update",
            Operation::Deprovision => "deprovision",
            Operation::Bind => "bind",
            Operation::Unbind => "unbind",
        };
        f.write_str(name)
    }
}

/// Changes requested by an update. Absent fields stay as they are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepPayload {
    resource_id: ResourceId,
    step: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DependentsPayload {
    resource_id: ResourceId,
}

/// Starts operations on resources and runs their chains.
///
/// Cheap to clone; every clone shares the catalog, the resource store and
/// the submitter.
pub struct ChainRunner<S: QueueStore, R: ResourceStore> {
    workflows: Arc<Workflows>,
    resources: Arc<R>,
    submitter: TaskSubmitter<S>,
}

impl<S: QueueStore, R: ResourceStore> Clone for ChainRunner<S, R> {
    fn clone(&self) -> Self {
        Self {
            workflows: self.workflows.clone(),
            resources: self.resources.clone(),
            submitter: self.submitter.clone(),
        }
    }
}

impl<S, R> ChainRunner<S, R>
where
    S: QueueStore + 'static,
    R: ResourceStore + 'static,
{
    pub fn new(workflows: Workflows, resources: Arc<R>, submitter: TaskSubmitter<S>) -> Self {
        Self {
            workflows: Arc::new(workflows),
            resources,
            submitter,
        }
    }

    /// Registers the step jobs and the dependents job with `engine`.
    pub fn register_jobs(&self, engine: &mut Engine<S>) -> crate::executor::Result<()> {
        for operation in Operation::ALL {
            engine.register_job(
                operation.job_name(),
                Arc::new(StepJob {
                    runner: self.clone(),
                    operation,
                }),
            )?;
        }
        engine.register_job(
            RESOLVE_DEPENDENTS_JOB,
            Arc::new(DependentsJob {
                runner: self.clone(),
            }),
        )
    }

    pub fn resources(&self) -> &Arc<R> {
        &self.resources
    }

    pub async fn get(&self, id: &ResourceId) -> Result<Option<Resource>> {
        Ok(self.resources.load(id).await?)
    }

    /// Creates `instance` and starts provisioning it.
    ///
    /// An instance with a parent that is still provisioning is saved as
    /// `PROVISIONING_DEFERRED` and started once the parent is provisioned.
    pub async fn provision(&self, mut instance: Resource) -> Result<Resource> {
        if instance.kind != ResourceKind::Instance {
            return Err(RunnerError::InvalidResource(format!(
                "{} is not an instance",
                instance.id
            )));
        }
        self.chains(&instance.service_id)?;
        if self.resources.load(&instance.id).await?.is_some() {
            return Err(RunnerError::AlreadyExists(instance.id));
        }

        instance.status_reason = None;
        let parent = match &instance.parent_id {
            Some(parent_id) => Some(self.load_parent(&instance.id, parent_id).await?),
            None => None,
        };

        match parent {
            Some(parent) if waits_for(&parent) => {
                instance.status = Status::ProvisioningDeferred;
                instance.status_reason = Some(format!("waiting for parent {}", parent.id));
                self.resources.save(&instance).await?;
                info!(resource.id = %instance.id, parent = %parent.id, "provisioning deferred");

                // The parent may have settled between the check and the save.
                self.promote_if_parent_settled(&instance.id, &parent.id).await?;
            }
            Some(parent) if !matches!(parent.status, Status::Provisioned | Status::Updating) => {
                return Err(RunnerError::ParentUnavailable {
                    id: instance.id,
                    parent: parent.id,
                });
            }
            _ => {
                instance.status = Status::Provisioning;
                self.resources.save(&instance).await?;
                info!(
                    resource.id = %instance.id,
                    service = %instance.service_id,
                    "provisioning started"
                );
                self.start(Operation::Provision, instance.clone()).await?;
            }
        }

        self.load(&instance.id).await
    }

    /// Starts updating a provisioned instance.
    pub async fn update(&self, id: &ResourceId, request: UpdateRequest) -> Result<Resource> {
        let mut instance = self.load(id).await?;
        self.chains(&instance.service_id)?;
        instance.transition(Status::Updating, None)?;
        if let Some(plan_id) = request.plan_id {
            instance.plan_id = plan_id;
        }
        if let Some(parameters) = request.parameters {
            instance.parameters = parameters;
        }
        self.resources.save(&instance).await?;
        info!(resource.id = %instance.id, "update started");

        self.start(Operation::Update, instance).await?;
        self.load(id).await
    }

    /// Starts deprovisioning an instance.
    ///
    /// Deprovisioning waits in `DEPROVISIONING_DEFERRED` while the instance
    /// still has children (bindings or child instances). Returns `None` if
    /// the instance is already gone, which happens when the deprovisioner
    /// has no steps.
    pub async fn deprovision(&self, id: &ResourceId) -> Result<Option<Resource>> {
        let mut instance = self.load(id).await?;
        if instance.kind != ResourceKind::Instance {
            return Err(RunnerError::InvalidResource(format!("{} is not an instance", id)));
        }
        self.chains(&instance.service_id)?;

        let children = self.resources.children(id).await?.len();
        if children > 0 {
            instance.transition(
                Status::DeprovisioningDeferred,
                Some(format!("waiting for {} children to be removed", children)),
            )?;
            self.resources.save(&instance).await?;
            info!(resource.id = %id, children, "deprovisioning deferred");

            // The last child may have gone between the check and the save.
            self.promote_deferred_deprovision(id).await?;
        } else {
            instance.transition(Status::Deprovisioning, None)?;
            self.resources.save(&instance).await?;
            info!(resource.id = %id, "deprovisioning started");
            self.start(Operation::Deprovision, instance).await?;
        }

        self.get(id).await
    }

    /// Creates `binding` and starts binding it to its instance.
    pub async fn bind(&self, mut binding: Resource) -> Result<Resource> {
        if binding.kind != ResourceKind::Binding {
            return Err(RunnerError::InvalidResource(format!("{} is not a binding", binding.id)));
        }
        let Some(instance_id) = binding.parent_id.clone() else {
            return Err(RunnerError::InvalidResource(format!(
                "binding {} names no instance",
                binding.id
            )));
        };
        self.chains(&binding.service_id)?;
        if self.resources.load(&binding.id).await?.is_some() {
            return Err(RunnerError::AlreadyExists(binding.id));
        }

        let instance = self.load_parent(&binding.id, &instance_id).await?;
        if !matches!(instance.status, Status::Provisioned | Status::Updating) {
            return Err(RunnerError::ParentUnavailable {
                id: binding.id,
                parent: instance_id,
            });
        }

        binding.status = Status::Binding;
        binding.status_reason = None;
        self.resources.save(&binding).await?;
        info!(resource.id = %binding.id, instance = %instance_id, "binding started");

        self.start(Operation::Bind, binding.clone()).await?;
        self.load(&binding.id).await
    }

    /// Starts removing a binding. Returns `None` if the binding is already
    /// gone.
    pub async fn unbind(&self, id: &ResourceId) -> Result<Option<Resource>> {
        let mut binding = self.load(id).await?;
        if binding.kind != ResourceKind::Binding {
            return Err(RunnerError::InvalidResource(format!("{} is not a binding", id)));
        }
        self.chains(&binding.service_id)?;
        binding.transition(Status::Unbinding, None)?;
        self.resources.save(&binding).await?;
        info!(resource.id = %id, "unbinding started");

        self.start(Operation::Unbind, binding).await?;
        self.get(id).await
    }

    /// Runs one step of `operation`'s chain for the resource in `payload`.
    async fn run_step(
        &self,
        operation: Operation,
        ctx: &JobContext,
        payload: StepPayload,
    ) -> Result<()> {
        let StepPayload { resource_id, step } = payload;
        let Some(mut resource) = self.resources.load(&resource_id).await? else {
            warn!(resource.id = %resource_id, step = %step, "resource not found, skipping step");
            return Ok(());
        };

        if resource.status != operation.in_progress() {
            debug!(
                resource.id = %resource_id,
                status = %resource.status,
                step = %step,
                "resource no longer in progress, skipping step"
            );
            // A redelivered last step still makes sure dependents hear about
            // the outcome.
            if resource.status == operation.failed()
                || Some(resource.status) == operation.succeeded()
            {
                self.notify_dependents(&resource).await?;
            }
            return Ok(());
        }

        let chain = match self.chain_for(operation, &resource) {
            Ok(chain) => chain,
            Err(e) => {
                error!(resource.id = %resource_id, error = %e, "resource names an unknown service");
                self.fail(operation, resource, e.to_string()).await?;
                return Err(e);
            }
        };

        if !chain.contains(&step) {
            let e = ChainError::UnknownStep { step };
            error!(resource.id = %resource_id, error = %e, "task names a step the chain lacks");
            self.fail(operation, resource, e.to_string()).await?;
            return Err(e.into());
        }

        let parent = match &resource.parent_id {
            Some(parent_id) => self.resources.load(parent_id).await?,
            None => None,
        };

        let span = info_span!(
            "step",
            resource.id = %resource_id,
            step = %step,
            operation = %operation
        );
        let outcome = chain
            .execute(&step, ctx.cancellation_token().clone(), &resource, parent)
            .instrument(span)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e @ ChainError::Cancelled { .. }) if ctx.is_shutting_down() => {
                warn!(resource.id = %resource_id, step = %step, "step interrupted by shutdown");
                return Err(e.into());
            }
            Err(ChainError::Cancelled { .. }) => {
                let reason = format!("step {} timed out", step);
                warn!(
                    resource.id = %resource_id,
                    step = %step,
                    "step cancelled by the handler timeout"
                );
                self.fail(operation, resource, reason).await?;
                return Err(ChainError::Cancelled { step }.into());
            }
            Err(e) => {
                error!(
                    resource.id = %resource_id,
                    step = %step,
                    error = %e,
                    "step contract violated"
                );
                self.fail(operation, resource, e.to_string()).await?;
                return Err(e.into());
            }
        };

        if outcome.error.is_some() && ctx.is_shutting_down() {
            // The step gave up because of the shutdown; its task is
            // delivered again with the details it started from.
            warn!(resource.id = %resource_id, step = %step, "step interrupted by shutdown");
            return Err(ChainError::Cancelled { step }.into());
        }

        resource.details = outcome.details;
        if let Some(error) = outcome.error {
            warn!(resource.id = %resource_id, step = %step, error = %error, "step failed");
            return self.fail(operation, resource, error.to_string()).await;
        }

        match chain.next(&step) {
            Some(next) => {
                self.resources.save(&resource).await?;
                debug!(resource.id = %resource_id, step = %step, next = %next, "step completed");
                self.submit_step(operation, &resource_id, next).await
            }
            None => self.finish(operation, resource).await,
        }
    }

    /// Promotes or fails whatever waits on the resource in `payload`.
    async fn resolve_dependents(&self, payload: DependentsPayload) -> Result<()> {
        let Some(resource) = self.resources.load(&payload.resource_id).await? else {
            return Ok(());
        };

        match resource.status {
            Status::Provisioned => {
                for child in self.resources.children(&resource.id).await? {
                    if child.status == Status::ProvisioningDeferred {
                        self.start_deferred_provision(child).await?;
                    }
                }
            }
            Status::ProvisioningFailed => {
                for mut child in self.resources.children(&resource.id).await? {
                    if child.status != Status::ProvisioningDeferred {
                        continue;
                    }
                    child.transition(
                        Status::ProvisioningFailed,
                        Some(format!("parent {} failed to provision", resource.id)),
                    )?;
                    if !self
                        .resources
                        .save_if_status(Status::ProvisioningDeferred, &child)
                        .await?
                    {
                        debug!(resource.id = %child.id, "deferred child already resolved");
                        continue;
                    }
                    info!(
                        resource.id = %child.id,
                        parent = %resource.id,
                        "deferred provisioning failed with parent"
                    );
                    self.notify_dependents(&child).await?;
                }
            }
            Status::DeprovisioningDeferred => {
                self.promote_deferred_deprovision(&resource.id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Submits the first step, or finishes at once for a chain without steps.
    async fn start(&self, operation: Operation, resource: Resource) -> Result<()> {
        let chain = self.chain_for(operation, &resource)?;
        match chain.first() {
            Some(first) => self.submit_step(operation, &resource.id, first).await,
            None => self.finish(operation, resource).await,
        }
    }

    /// Promotes a deferred child. Of several concurrent resolvers only the one
    /// whose status swap lands submits the first step.
    async fn start_deferred_provision(&self, mut child: Resource) -> Result<()> {
        child.transition(Status::Provisioning, None)?;
        if !self
            .resources
            .save_if_status(Status::ProvisioningDeferred, &child)
            .await?
        {
            debug!(resource.id = %child.id, "deferred provisioning already started");
            return Ok(());
        }
        info!(resource.id = %child.id, "deferred provisioning started");
        self.start(Operation::Provision, child).await
    }

    async fn promote_if_parent_settled(
        &self,
        id: &ResourceId,
        parent_id: &ResourceId,
    ) -> Result<()> {
        let parent_status = self.resources.load(parent_id).await?.map(|p| p.status);
        if matches!(parent_status, Some(Status::Provisioned | Status::ProvisioningFailed)) {
            self.submit_dependents(parent_id).await?;
        }
        debug!(
            resource.id = %id,
            parent = %parent_id,
            ?parent_status,
            "checked parent after deferral"
        );
        Ok(())
    }

    async fn promote_deferred_deprovision(&self, id: &ResourceId) -> Result<()> {
        let Some(mut instance) = self.resources.load(id).await? else {
            return Ok(());
        };
        if instance.status != Status::DeprovisioningDeferred
            || !self.resources.children(id).await?.is_empty()
        {
            return Ok(());
        }
        instance.transition(Status::Deprovisioning, None)?;
        if !self
            .resources
            .save_if_status(Status::DeprovisioningDeferred, &instance)
            .await?
        {
            debug!(resource.id = %id, "deferred deprovisioning already started");
            return Ok(());
        }
        info!(resource.id = %id, "deferred deprovisioning started");
        self.start(Operation::Deprovision, instance).await
    }

    /// Applies the success outcome of the whole chain.
    async fn finish(&self, operation: Operation, mut resource: Resource) -> Result<()> {
        match operation.succeeded() {
            Some(status) => {
                resource.transition(status, None)?;
                self.resources.save(&resource).await?;
                info!(resource.id = %resource.id, status = %status, "{} completed", operation);
                self.notify_dependents(&resource).await
            }
            None => {
                self.resources.delete(&resource.id).await?;
                info!(resource.id = %resource.id, "{} completed, resource removed", operation);
                match &resource.parent_id {
                    Some(parent_id) => self.notify_parent(parent_id).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Applies a failure outcome, keeping whatever details were saved.
    async fn fail(
        &self,
        operation: Operation,
        mut resource: Resource,
        reason: String,
    ) -> Result<()> {
        let failed = operation.failed();
        if resource.status == failed {
            return Ok(());
        }
        resource.transition(failed, Some(reason))?;
        self.resources.save(&resource).await?;
        info!(resource.id = %resource.id, status = %failed, "{} failed", operation);
        self.notify_dependents(&resource).await
    }

    /// Submits a dependents task if a child waits on `resource`.
    async fn notify_dependents(&self, resource: &Resource) -> Result<()> {
        if !matches!(resource.status, Status::Provisioned | Status::ProvisioningFailed) {
            return Ok(());
        }
        let waiting = self
            .resources
            .children(&resource.id)
            .await?
            .iter()
            .any(|child| child.status == Status::ProvisioningDeferred);
        if waiting {
            self.submit_dependents(&resource.id).await?;
        }
        Ok(())
    }

    /// Submits a dependents task if `parent_id` waits for its children.
    async fn notify_parent(&self, parent_id: &ResourceId) -> Result<()> {
        let waiting = self
            .resources
            .load(parent_id)
            .await?
            .is_some_and(|parent| parent.status == Status::DeprovisioningDeferred);
        if waiting {
            self.submit_dependents(parent_id).await?;
        }
        Ok(())
    }

    async fn submit_step(
        &self,
        operation: Operation,
        resource_id: &ResourceId,
        step: &str,
    ) -> Result<()> {
        let payload = StepPayload {
            resource_id: resource_id.clone(),
            step: step.to_string(),
        };
        let task = Task::with_json(operation.job_name(), &payload)?;
        self.submitter.submit_task(&task).await?;
        debug!(resource.id = %resource_id, step = %step, task.id = %task.id, "submitted step");
        Ok(())
    }

    async fn submit_dependents(&self, resource_id: &ResourceId) -> Result<()> {
        let payload = DependentsPayload {
            resource_id: resource_id.clone(),
        };
        let task = Task::with_json(RESOLVE_DEPENDENTS_JOB, &payload)?;
        self.submitter.submit_task(&task).await?;
        Ok(())
    }

    fn chains(&self, service_id: &str) -> Result<&ServiceChains> {
        self.workflows
            .get(service_id)
            .ok_or_else(|| RunnerError::UnknownService(service_id.to_string()))
    }

    fn chain_for(&self, operation: Operation, resource: &Resource) -> Result<Arc<dyn ErasedChain>> {
        Ok(self.chains(&resource.service_id)?.chain(operation))
    }

    async fn load(&self, id: &ResourceId) -> Result<Resource> {
        self.resources
            .load(id)
            .await?
            .ok_or_else(|| RunnerError::NotFound(id.clone()))
    }

    async fn load_parent(&self, id: &ResourceId, parent_id: &ResourceId) -> Result<Resource> {
        self.resources
            .load(parent_id)
            .await?
            .ok_or_else(|| RunnerError::ParentUnavailable {
                id: id.clone(),
                parent: parent_id.clone(),
            })
    }
}

/// Returns true if a child of `parent` has to wait for it.
fn waits_for(parent: &Resource) -> bool {
    matches!(
        parent.status,
        Status::Provisioning | Status::ProvisioningDeferred
    )
}

struct StepJob<S: QueueStore, R: ResourceStore> {
    runner: ChainRunner<S, R>,
    operation: Operation,
}

#[async_trait]
impl<S, R> JobHandler for StepJob<S, R>
where
    S: QueueStore + 'static,
    R: ResourceStore + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: &[u8]) -> std::result::Result<(), BoxError> {
        let payload: StepPayload = deserialize_value(payload)?;
        self.runner
            .run_step(self.operation, &ctx, payload)
            .await
            .map_err(Into::into)
    }
}

struct DependentsJob<S: QueueStore, R: ResourceStore> {
    runner: ChainRunner<S, R>,
}

#[async_trait]
impl<S, R> JobHandler for DependentsJob<S, R>
where
    S: QueueStore + 'static,
    R: ResourceStore + 'static,
{
    async fn handle(&self, _ctx: JobContext, payload: &[u8]) -> std::result::Result<(), BoxError> {
        let payload: DependentsPayload = deserialize_value(payload)?;
        self.runner.resolve_dependents(payload).await.map_err(Into::into)
    }
}
