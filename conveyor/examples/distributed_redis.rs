//! Redis-backed workers sharing one set of queues.
//!
//! # Setup
//!
//! 1. Start Redis server:
//!    ```bash
//!    docker run -d -p 6379:6379 redis:latest
//!    ```
//!
//! 2. Start workers (any number, on any machine that reaches Redis):
//!    ```bash
//!    cargo run --example distributed_redis --features redis -- --mode worker --id worker-1
//!    cargo run --example distributed_redis --features redis -- --mode worker --id worker-2
//!    ```
//!
//! 3. Submit provisioning requests:
//!    ```bash
//!    cargo run --example distributed_redis --features redis -- --mode submit
//!    ```
//!
//! Kill a worker with Ctrl+C while a step is running: the task is handed back
//! and the other worker picks it up. Kill it with SIGKILL and the survivors
//! recover the task once its heartbeat expires.

use conveyor::prelude::*;
use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseDetails {
    volume: Option<String>,
    primary: Option<String>,
}

fn workflows() -> Result<Workflows, Box<dyn std::error::Error>> {
    let provisioner = Chain::builder()
        .step_fn("create-volume", |input: StepInput<DatabaseDetails>| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let mut details = input.details;
            details.volume = Some(format!("vol-{}", input.resource.id));
            Ok(details)
        })
        .step_fn("start-primary", |input: StepInput<DatabaseDetails>| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(3)) => {}
                _ = input.token.cancelled() => {
                    tracing::warn!(
                        resource.id = %input.resource.id,
                        "interrupted, will resume elsewhere"
                    );
                    return Err(StepFailure::new(
                        input.details,
                        "interrupted before the primary started",
                    ));
                }
            }
            let mut details = input.details;
            details.primary = Some(format!("{}-0", input.resource.id));
            Ok(details)
        })
        .build()?;

    let deprovisioner = Chain::builder()
        .step_fn("delete-volume", |input: StepInput<DatabaseDetails>| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(input.details)
        })
        .build()?;

    let chains = ServiceChains::new(
        provisioner,
        Chain::<DatabaseDetails>::empty(),
        deprovisioner,
    );
    Ok(Workflows::new().with_service("postgres", chains)?)
}

async fn run_submitter(redis_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(RedisQueueStore::new(redis_url).await?);
    let resources = Arc::new(RedisResourceStore::new(redis_url).await?);
    let submitter = TaskSubmitter::new(store, conveyor::QueueKeys::default());
    let runner = ChainRunner::new(workflows()?, resources, submitter);

    for i in 1..=3 {
        let id = format!("pg-{}-{}", i, &Uuid::new_v4().to_string()[..8]);
        let created = runner
            .provision(Resource::instance(id.as_str(), "postgres", "small"))
            .await?;
        println!("Submitted {} ({})", created.id, created.status);
    }
    Ok(())
}

async fn run_worker(redis_url: &str, worker_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(RedisQueueStore::new(redis_url).await?);
    let resources = Arc::new(RedisResourceStore::new(redis_url).await?);

    let config = EngineConfig::default()
        .with_worker_id(worker_id)
        .with_heartbeat_ttl(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_secs(2));
    let mut engine = Engine::new(store, config);
    let runner = ChainRunner::new(workflows()?, resources, engine.submitter());
    runner.register_jobs(&mut engine)?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    println!("Worker {} running (Ctrl+C to stop)", worker_id);
    let stopped = engine.run(token).await;
    if stopped.is_cancelled() {
        println!("Worker {} stopped", worker_id);
        Ok(())
    } else {
        Err(stopped.into())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conveyor=info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let mut mode = "submit";
    let mut worker_id = "worker-1";
    let mut redis_url = "redis://127.0.0.1:6379";

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).map(String::as_str);
        match (args[i].as_str(), value) {
            ("--mode", Some(v)) => mode = v,
            ("--id", Some(v)) => worker_id = v,
            ("--redis", Some(v)) => redis_url = v,
            (flag, _) => {
                eprintln!("Error: unexpected argument '{}'", flag);
                std::process::exit(1);
            }
        }
        i += 2;
    }

    match mode {
        "submit" => run_submitter(redis_url).await,
        "worker" => run_worker(redis_url, worker_id).await,
        _ => {
            eprintln!("Error: invalid mode '{}'. Use 'submit' or 'worker'", mode);
            std::process::exit(1);
        }
    }
}
