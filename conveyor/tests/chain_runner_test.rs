//! Step chains driven end to end through a running engine.

mod common;

use common::{eventually, fast_config, CountingStore, EventLog};
use conveyor::chain::{ChainError, RunnerError, RESOLVE_DEPENDENTS_JOB};
use conveyor::prelude::*;
use conveyor::storage::QueueKeys;
use conveyor::{Operation, Step};
use serde_json::json;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Progress {
    steps: Vec<String>,
}

/// A step that appends its name to the details and to `log`.
fn logging_step(name: &'static str, log: EventLog) -> Step<Progress> {
    Step::from_fn(name, move |input: StepInput<Progress>| {
        let log = log.clone();
        async move {
            log.record(format!("{}:{}", input.resource.id, name));
            let mut details = input.details;
            details.steps.push(name.to_string());
            Ok::<_, StepFailure<Progress>>(details)
        }
    })
}

fn failing_step(name: &'static str, reason: &'static str) -> Step<Progress> {
    Step::from_fn(name, move |input: StepInput<Progress>| async move {
        let mut details = input.details;
        details.steps.push(format!("{name}-attempted"));
        Err(StepFailure::new(details, reason))
    })
}

/// A step that blocks until `gate` is notified.
fn gated_step(name: &'static str, gate: Arc<Notify>) -> Step<Progress> {
    Step::from_fn(name, move |input: StepInput<Progress>| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok::<_, StepFailure<Progress>>(input.details)
        }
    })
}

/// A step that never finishes on its own.
fn hanging_step(name: &'static str) -> Step<Progress> {
    Step::from_fn(name, |input: StepInput<Progress>| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, StepFailure<Progress>>(input.details)
    })
}

async fn crash(_input: StepInput<Progress>) -> Result<Progress, StepFailure<Progress>> {
    panic!("driver crashed")
}

fn chain(steps: Vec<Step<Progress>>) -> Chain<Progress> {
    Chain::new(steps).unwrap()
}

struct Harness {
    store: Arc<CountingStore>,
    resources: Arc<InMemoryResourceStore>,
    runner: ChainRunner<CountingStore, InMemoryResourceStore>,
    token: CancellationToken,
    running: JoinHandle<EngineError>,
}

impl Harness {
    fn start(workflows: Workflows) -> Self {
        Self::start_with(workflows, fast_config("w1"))
    }

    fn start_with(workflows: Workflows, config: EngineConfig) -> Self {
        let store = Arc::new(CountingStore::new());
        let resources = Arc::new(InMemoryResourceStore::new());
        let mut engine = Engine::new(store.clone(), config);
        let runner = ChainRunner::new(workflows, resources.clone(), engine.submitter());
        runner.register_jobs(&mut engine).unwrap();

        let token = CancellationToken::new();
        let running = tokio::spawn(engine.run(token.clone()));
        Self {
            store,
            resources,
            runner,
            token,
            running,
        }
    }

    async fn status(&self, id: &str) -> Option<Status> {
        self.resources
            .load(&ResourceId::new(id))
            .await
            .unwrap()
            .map(|r| r.status)
    }

    async fn reaches(&self, id: &str, status: Status) -> bool {
        eventually(WAIT, || async move { self.status(id).await == Some(status) }).await
    }

    async fn removed(&self, id: &str) -> bool {
        eventually(WAIT, || async move { self.status(id).await.is_none() }).await
    }

    async fn resource(&self, id: &str) -> Resource {
        self.resources.load(&ResourceId::new(id)).await.unwrap().unwrap()
    }

    async fn stop(self) {
        self.token.cancel();
        assert!(self.running.await.unwrap().is_cancelled());
    }
}

fn simple_service(provisioner: Chain<Progress>, log: &EventLog) -> ServiceChains {
    ServiceChains::new(
        provisioner,
        chain(vec![logging_step("resize", log.clone())]),
        chain(vec![logging_step("destroy", log.clone())]),
    )
}

#[tokio::test]
async fn test_failed_second_step_fails_provisioning() {
    let log = EventLog::default();
    let workflows = Workflows::new()
        .with_service(
            "db",
            simple_service(
                chain(vec![
                    logging_step("create", log.clone()),
                    failing_step("configure", "disk full"),
                ]),
                &log,
            ),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    let created = harness
        .runner
        .provision(Resource::instance("db-1", "db", "small"))
        .await
        .unwrap();
    assert_eq!(created.status, Status::Provisioning);

    assert!(harness.reaches("db-1", Status::ProvisioningFailed).await);
    let failed = harness.resource("db-1").await;
    assert!(failed.status_reason.as_ref().unwrap().contains("disk full"));

    // Details survive the failure, including what the failed step recorded.
    let details: Progress = failed.details_as().unwrap();
    assert_eq!(details.steps, vec!["create", "configure-attempted"]);

    // One task per step, nothing more.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.store.pushed(Operation::Provision.job_name()), 2);
    assert_eq!(harness.store.pushed_total(), 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_concurrent_chains_keep_their_own_order() {
    let log = EventLog::default();
    let workflows = Workflows::new()
        .with_service(
            "vm",
            simple_service(
                chain(vec![
                    logging_step("one", log.clone()),
                    logging_step("two", log.clone()),
                    logging_step("three", log.clone()),
                ]),
                &log,
            ),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    harness.runner.provision(Resource::instance("vm-a", "vm", "small")).await.unwrap();
    harness.runner.provision(Resource::instance("vm-b", "vm", "large")).await.unwrap();

    assert!(harness.reaches("vm-a", Status::Provisioned).await);
    assert!(harness.reaches("vm-b", Status::Provisioned).await);

    for id in ["vm-a", "vm-b"] {
        let details: Progress = harness.resource(id).await.details_as().unwrap();
        assert_eq!(details.steps, vec!["one", "two", "three"]);

        let own: Vec<String> = log
            .events()
            .into_iter()
            .filter(|e| e.starts_with(&format!("{id}:")))
            .collect();
        assert_eq!(own, vec![format!("{id}:one"), format!("{id}:two"), format!("{id}:three")]);
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_child_waits_for_parent_then_parent_waits_for_child() {
    let log = EventLog::default();
    let gate = Arc::new(Notify::new());
    let workflows = Workflows::new()
        .with_service(
            "cluster",
            simple_service(chain(vec![gated_step("boot", gate.clone())]), &log),
        )
        .unwrap()
        .with_service(
            "node",
            simple_service(chain(vec![logging_step("join", log.clone())]), &log),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    harness
        .runner
        .provision(Resource::instance("cluster-1", "cluster", "ha"))
        .await
        .unwrap();
    let child = harness
        .runner
        .provision(Resource::instance("node-1", "node", "std").with_parent("cluster-1"))
        .await
        .unwrap();
    assert_eq!(child.status, Status::ProvisioningDeferred);
    assert!(child.status_reason.unwrap().contains("cluster-1"));

    gate.notify_one();
    assert!(harness.reaches("cluster-1", Status::Provisioned).await);
    assert!(harness.reaches("node-1", Status::Provisioned).await);
    assert!(harness.store.pushed(RESOLVE_DEPENDENTS_JOB) >= 1);

    // The parent cannot go while its child exists.
    let parent = harness
        .runner
        .deprovision(&ResourceId::new("cluster-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.status, Status::DeprovisioningDeferred);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.status("cluster-1").await, Some(Status::DeprovisioningDeferred));

    harness.runner.deprovision(&ResourceId::new("node-1")).await.unwrap();
    assert!(harness.removed("node-1").await);
    assert!(harness.removed("cluster-1").await);
    assert!(harness.resources.is_empty());
    assert_eq!(log.count("cluster-1:destroy"), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_parent_failure_fails_deferred_child() {
    let log = EventLog::default();
    let gate = Arc::new(Notify::new());
    let workflows = Workflows::new()
        .with_service(
            "cluster",
            simple_service(
                chain(vec![gated_step("boot", gate.clone()), failing_step("verify", "unhealthy")]),
                &log,
            ),
        )
        .unwrap()
        .with_service(
            "node",
            simple_service(chain(vec![logging_step("join", log.clone())]), &log),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    harness
        .runner
        .provision(Resource::instance("cluster-1", "cluster", "ha"))
        .await
        .unwrap();
    harness
        .runner
        .provision(Resource::instance("node-1", "node", "std").with_parent("cluster-1"))
        .await
        .unwrap();

    gate.notify_one();
    assert!(harness.reaches("cluster-1", Status::ProvisioningFailed).await);
    assert!(harness.reaches("node-1", Status::ProvisioningFailed).await);
    let child = harness.resource("node-1").await;
    assert!(child.status_reason.unwrap().contains("cluster-1"));
    assert_eq!(log.count("node-1:join"), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_mismatched_details_fail_the_resource() {
    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Strict {
        replicas: u32,
    }

    let strict = Chain::new(vec![Step::from_fn("scale", |input: StepInput<Strict>| async move {
        Ok::<_, StepFailure<Strict>>(input.details)
    })])
    .unwrap();
    let workflows = Workflows::new()
        .with_service(
            "cache",
            ServiceChains::new(strict, Chain::<Strict>::empty(), Chain::<Strict>::empty()),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    let mut instance = Resource::instance("cache-1", "cache", "small");
    instance.details = json!({"replicas": "three"});
    harness.runner.provision(instance).await.unwrap();

    assert!(harness.reaches("cache-1", Status::ProvisioningFailed).await);
    let failed = harness.resource("cache-1").await;
    assert!(failed.status_reason.as_ref().unwrap().contains("scale"));

    harness.stop().await;
}

#[tokio::test]
async fn test_update_and_redelivered_step_is_ignored() {
    let log = EventLog::default();
    let workflows = Workflows::new()
        .with_service(
            "db",
            simple_service(chain(vec![logging_step("create", log.clone())]), &log),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    harness.runner.provision(Resource::instance("db-1", "db", "small")).await.unwrap();
    assert!(harness.reaches("db-1", Status::Provisioned).await);

    // A stale copy of the step task arrives after the chain finished.
    let stale = Task::with_json(
        Operation::Provision.job_name(),
        &json!({"resource_id": "db-1", "step": "create"}),
    )
    .unwrap();
    harness.store.push("conveyor:tasks:pending", &stale.encode().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(log.count("db-1:create"), 1);

    let updating = harness
        .runner
        .update(
            &ResourceId::new("db-1"),
            UpdateRequest {
                plan_id: Some("large".into()),
                parameters: Some(json!({"iops": 3000})),
            },
        )
        .await
        .unwrap();
    assert_eq!(updating.status, Status::Updating);
    assert!(harness.reaches("db-1", Status::Provisioned).await);

    let updated = harness.resource("db-1").await;
    assert_eq!(updated.plan_id, "large");
    assert_eq!(updated.parameters, json!({"iops": 3000}));
    assert_eq!(log.count("db-1:resize"), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_service_without_binder_binds_immediately() {
    let log = EventLog::default();
    let workflows = Workflows::new()
        .with_service(
            "db",
            simple_service(chain(vec![logging_step("create", log.clone())]), &log),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    harness.runner.provision(Resource::instance("db-1", "db", "small")).await.unwrap();
    assert!(harness.reaches("db-1", Status::Provisioned).await);

    let bound = harness
        .runner
        .bind(Resource::binding("b-1", "db-1", "db", "small"))
        .await
        .unwrap();
    assert_eq!(bound.status, Status::Bound);

    let unbound = harness.runner.unbind(&ResourceId::new("b-1")).await.unwrap();
    assert!(unbound.is_none());
    assert_eq!(harness.status("b-1").await, None);

    harness.stop().await;
}

#[tokio::test]
async fn test_operations_validate_their_input() {
    let log = EventLog::default();
    let gate = Arc::new(Notify::new());
    let workflows = Workflows::new()
        .with_service(
            "db",
            simple_service(chain(vec![gated_step("create", gate.clone())]), &log),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    let err = harness
        .runner
        .provision(Resource::instance("x-1", "unknown", "small"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::UnknownService(_)));

    harness.runner.provision(Resource::instance("db-1", "db", "small")).await.unwrap();
    let err = harness
        .runner
        .provision(Resource::instance("db-1", "db", "small"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::AlreadyExists(_)));

    // Still provisioning: neither deprovision nor bind may start.
    let err = harness.runner.deprovision(&ResourceId::new("db-1")).await.unwrap_err();
    assert!(matches!(err, RunnerError::InvalidTransition(_)));
    let err = harness
        .runner
        .bind(Resource::binding("b-1", "db-1", "db", "small"))
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::ParentUnavailable { .. }));

    let err = harness
        .runner
        .update(&ResourceId::new("missing"), UpdateRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::NotFound(_)));

    gate.notify_one();
    assert!(harness.reaches("db-1", Status::Provisioned).await);
    harness.stop().await;
}

#[test]
fn test_duplicate_step_names_are_rejected() {
    let log = EventLog::default();
    let err = Chain::new(vec![logging_step("a", log.clone()), logging_step("a", log)]).unwrap_err();
    assert!(matches!(err, ChainError::DuplicateStep { .. }));
}

#[tokio::test]
async fn test_step_past_handler_timeout_fails_provisioning() {
    let log = EventLog::default();
    let workflows = Workflows::new()
        .with_service(
            "db",
            simple_service(
                chain(vec![logging_step("create", log.clone()), hanging_step("configure")]),
                &log,
            ),
        )
        .unwrap();
    let config = fast_config("w1").with_handler_timeout(Duration::from_millis(100));
    let harness = Harness::start_with(workflows, config);
    let keys = QueueKeys::default();

    harness
        .runner
        .provision(Resource::instance("db-1", "db", "small"))
        .await
        .unwrap();

    assert!(harness.reaches("db-1", Status::ProvisioningFailed).await);
    let failed = harness.resource("db-1").await;
    assert!(failed.status_reason.as_ref().unwrap().contains("timed out"));
    let details: Progress = failed.details_as().unwrap();
    assert_eq!(details.steps, vec!["create"]);

    assert!(
        eventually(WAIT, || async {
            harness.store.len(&keys.active("w1")).await.unwrap() == 0
        })
        .await
    );
    assert_eq!(harness.store.len(&keys.pending()).await.unwrap(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_panicking_step_fails_provisioning() {
    let log = EventLog::default();
    let workflows = Workflows::new()
        .with_service(
            "db",
            simple_service(
                chain(vec![
                    logging_step("create", log.clone()),
                    Step::from_fn("configure", crash),
                ]),
                &log,
            ),
        )
        .unwrap();
    let harness = Harness::start(workflows);

    harness
        .runner
        .provision(Resource::instance("db-1", "db", "small"))
        .await
        .unwrap();

    assert!(harness.reaches("db-1", Status::ProvisioningFailed).await);
    let failed = harness.resource("db-1").await;
    assert!(failed.status_reason.as_ref().unwrap().contains("panicked"));

    // The engine keeps serving other resources after the panic.
    harness
        .runner
        .provision(Resource::instance("db-2", "db", "small"))
        .await
        .unwrap();
    assert!(harness.reaches("db-2", Status::ProvisioningFailed).await);
    assert_eq!(log.count("db-2:create"), 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_mid_step_leaves_resource_for_redelivery() {
    let log = EventLog::default();
    let workflows = Workflows::new()
        .with_service(
            "db",
            simple_service(
                chain(vec![logging_step("create", log.clone()), hanging_step("configure")]),
                &log,
            ),
        )
        .unwrap();
    let harness = Harness::start(workflows);
    let keys = QueueKeys::default();

    harness
        .runner
        .provision(Resource::instance("db-1", "db", "small"))
        .await
        .unwrap();
    assert!(eventually(WAIT, || async { log.count("db-1:create") == 1 }).await);
    assert!(
        eventually(WAIT, || async {
            harness.store.len(&keys.active("w1")).await.unwrap() == 1
        })
        .await
    );

    harness.token.cancel();
    assert!(harness.running.await.unwrap().is_cancelled());

    // Neither failed nor advanced; the step task waits for another worker.
    let resource = harness.resources.load(&ResourceId::new("db-1")).await.unwrap().unwrap();
    assert_eq!(resource.status, Status::Provisioning);
    assert_eq!(harness.store.len(&keys.pending()).await.unwrap(), 1);
}
