//! Provisioning a small cluster on a single in-memory engine.
//!
//! A cluster instance is provisioned through a three-step chain. A node
//! created while the cluster is still booting waits in
//! `PROVISIONING_DEFERRED` and starts once its parent is ready. A binding
//! is then attached and removed, and finally both instances are
//! deprovisioned, the cluster waiting until its node is gone.
//!
//! Run with: cargo run --example provision_in_memory

use conveyor::prelude::*;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ClusterDetails {
    network: Option<String>,
    endpoint: Option<String>,
    nodes_ready: u32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct NodeDetails {
    hostname: Option<String>,
}

fn cluster_chains() -> Result<ServiceChains, Box<dyn std::error::Error>> {
    let provisioner = Chain::builder()
        .step_fn("allocate-network", |input: StepInput<ClusterDetails>| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut details = input.details;
            details.network = Some(format!("net-{}", input.resource.id));
            Ok(details)
        })
        .step_fn("start-control-plane", |input: StepInput<ClusterDetails>| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut details = input.details;
            details.endpoint = Some(format!("https://{}.internal:6443", input.resource.id));
            Ok(details)
        })
        .step_fn("health-check", |input: StepInput<ClusterDetails>| async move {
            if input.details.endpoint.is_none() {
                return Err(StepFailure::new(input.details, "control plane has no endpoint"));
            }
            Ok(input.details)
        })
        .build()?;

    let updater = Chain::builder()
        .step_fn("resize", |input: StepInput<ClusterDetails>| async move {
            tracing::info!(plan = %input.resource.plan_id, "resizing cluster");
            Ok(input.details)
        })
        .build()?;

    let deprovisioner = Chain::builder()
        .step_fn("release-network", |input: StepInput<ClusterDetails>| async move {
            tracing::info!(network = ?input.details.network, "releasing network");
            Ok(input.details)
        })
        .build()?;

    Ok(ServiceChains::new(provisioner, updater, deprovisioner))
}

fn node_chains() -> Result<ServiceChains, Box<dyn std::error::Error>> {
    let provisioner = Chain::builder()
        .step_fn("join-cluster", |input: StepInput<NodeDetails>| async move {
            let parent = input.parent.map(|p| p.id.to_string()).unwrap_or_default();
            let mut details = input.details;
            details.hostname = Some(format!("{}.{}", input.resource.id, parent));
            Ok(details)
        })
        .build()?;

    let deprovisioner = Chain::builder()
        .step_fn("drain", |input: StepInput<NodeDetails>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(input.details)
        })
        .build()?;

    Ok(ServiceChains::new(provisioner, Chain::<NodeDetails>::empty(), deprovisioner))
}

async fn wait_for(
    runner: &ChainRunner<InMemoryQueueStore, InMemoryResourceStore>,
    id: &str,
    want: Option<Status>,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = ResourceId::new(id);
    loop {
        let status = runner.get(&id).await?.map(|r| r.status);
        if status == want {
            println!("   {} -> {}", id, want.map_or("removed".to_string(), |s| s.to_string()));
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conveyor=info")),
        )
        .init();

    let store = Arc::new(InMemoryQueueStore::new());
    let resources = Arc::new(InMemoryResourceStore::new());
    let mut engine = Engine::new(store, EngineConfig::default().with_worker_id("demo"));

    let workflows = Workflows::new()
        .with_service("cluster", cluster_chains()?)?
        .with_service("node", node_chains()?)?;
    let runner = ChainRunner::new(workflows, resources, engine.submitter());
    runner.register_jobs(&mut engine)?;

    let token = CancellationToken::new();
    let running = tokio::spawn(engine.run(token.clone()));

    println!("1. Provisioning cluster and node");
    runner
        .provision(Resource::instance("cluster-1", "cluster", "small"))
        .await?;
    let node = runner
        .provision(Resource::instance("node-1", "node", "standard").with_parent("cluster-1"))
        .await?;
    println!("   node-1 starts as {}", node.status);
    wait_for(&runner, "cluster-1", Some(Status::Provisioned)).await?;
    wait_for(&runner, "node-1", Some(Status::Provisioned)).await?;

    println!("2. Binding and unbinding");
    let binding = runner
        .bind(Resource::binding("app-1", "cluster-1", "cluster", "small"))
        .await?;
    println!("   app-1 -> {}", binding.status);
    runner.unbind(&binding.id).await?;
    wait_for(&runner, "app-1", None).await?;

    println!("3. Updating the cluster plan");
    runner
        .update(
            &ResourceId::new("cluster-1"),
            UpdateRequest {
                plan_id: Some("large".to_string()),
                parameters: None,
            },
        )
        .await?;
    wait_for(&runner, "cluster-1", Some(Status::Provisioned)).await?;

    println!("4. Deprovisioning");
    if let Some(cluster) = runner.deprovision(&ResourceId::new("cluster-1")).await? {
        println!("   cluster-1 starts as {}", cluster.status);
    }
    runner.deprovision(&ResourceId::new("node-1")).await?;
    wait_for(&runner, "node-1", None).await?;
    wait_for(&runner, "cluster-1", None).await?;

    token.cancel();
    let stopped = running.await?;
    println!("Engine stopped: {}", stopped);
    Ok(())
}
