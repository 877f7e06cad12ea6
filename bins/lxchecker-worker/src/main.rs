mod archive;
mod engine;
mod pipeline;
mod queue;
mod scheduler;

use engine::{ContainerRuntime, DockerRuntime};
use lxchecker_common::redis as keys;
use lxchecker_common::store::{RedisStore, SubmissionStore};
use lxchecker_common::types::{CompletionEvent, SubmissionJob};
use lxchecker_common::Config;
use pipeline::Outcome;
use queue::{RedisWorkQueue, WorkQueue};
use redis::aio::ConnectionManager;
use scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a submission task needs, shared across tasks
struct Worker<S, R: ContainerRuntime, Q> {
    config: Config,
    store: S,
    scheduler: Scheduler<R>,
    queue: Q,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    init_tracing(config.json_logs);

    info!(worker_id = %config.worker_id, "lxchecker worker booting...");

    let runtime = DockerRuntime::connect(config.registry_credentials())?;
    runtime.ping().await?;
    info!("Connected to Docker engine");

    let client = redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = ConnectionManager::new(client.clone()).await?;
    let claim_conn = ConnectionManager::new(client).await?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    let recovered = keys::requeue_unfinished(&mut redis_conn, &config.worker_id).await?;
    if recovered > 0 {
        warn!(recovered, "Requeued jobs left unfinished by a previous run");
    }

    let worker = Arc::new(Worker {
        store: RedisStore::new(redis_conn.clone()),
        scheduler: Scheduler::new(Arc::new(runtime)),
        queue: RedisWorkQueue::new(
            config.worker_id.clone(),
            config.queue_poll_timeout_secs,
            claim_conn,
            redis_conn,
        ),
        config,
    });

    info!(
        max_concurrent_runs = worker.config.max_concurrent_runs,
        queue = keys::SUBMISSION_QUEUE,
        "Listening for submissions"
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
            return;
        }
        info!("Received shutdown signal, cancelling in-flight runs...");
        trigger.cancel();
    });

    worker_loop(worker, shutdown).await;

    info!("Worker shutdown complete");
    Ok(())
}

/// Claim jobs while admission permits are available
///
/// A permit is taken before a job is claimed, so jobs beyond capacity stay
/// in the shared queue where other workers can pick them up.
async fn worker_loop<S, R, Q>(worker: Arc<Worker<S, R, Q>>, shutdown: CancellationToken)
where
    S: SubmissionStore + 'static,
    R: ContainerRuntime,
    Q: WorkQueue,
{
    let permits = worker.config.max_concurrent_runs;
    let admission = Arc::new(Semaphore::new(permits));

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&admission).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let claimed = tokio::select! {
            _ = shutdown.cancelled() => break,
            claimed = worker.queue.claim() => claimed,
        };

        let payload = match claimed {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error while claiming a job");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let worker = Arc::clone(&worker);
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            run_job(worker, payload, cancel).await;
        });
    }

    // Wait for in-flight runs to observe cancellation and clean up
    let _ = admission.acquire_many(permits as u32).await;
}

/// Task boundary: a panic inside the pipeline is logged here and never
/// reaches the process. The submission keeps whatever status it had.
async fn run_job<S, R, Q>(
    worker: Arc<Worker<S, R, Q>>,
    payload: String,
    cancel: CancellationToken,
) where
    S: SubmissionStore + 'static,
    R: ContainerRuntime,
    Q: WorkQueue,
{
    let job: SubmissionJob = match serde_json::from_str(&payload) {
        Ok(job) => job,
        Err(e) => {
            error!(error = %e, payload = %payload, "Dropping malformed job");
            ack(&worker.queue, &payload).await;
            return;
        }
    };

    let task = {
        let worker = Arc::clone(&worker);
        let job = job.clone();
        tokio::spawn(async move {
            pipeline::process_submission(&worker.store, &worker.scheduler, &job, &cancel).await
        })
    };

    match task.await {
        Ok(Ok(Outcome::Finished {
            status,
            execution_time_ms,
        })) => {
            ack(&worker.queue, &payload).await;
            let event = CompletionEvent {
                submission_id: job.submission_id.clone(),
                assignment_id: job.assignment_id.clone(),
                status,
                execution_time_ms,
            };
            if let Err(e) = worker.queue.publish(&event).await {
                warn!(job = %job, error = %e, "Failed to publish completion event");
            }
        }
        Ok(Ok(Outcome::Skipped)) => ack(&worker.queue, &payload).await,
        Ok(Ok(Outcome::Interrupted)) => {
            debug!(job = %job, "Job left on processing list for the next boot");
        }
        Ok(Err(e)) => {
            // Unexpected persistence failure: surface loudly, keep the job for recovery
            error!(job = %job, error = %e, "Store failure while processing submission");
        }
        Err(e) if e.is_panic() => {
            error!(job = %job, error = %e, "Submission task panicked; submission left as is");
            ack(&worker.queue, &payload).await;
        }
        Err(e) => {
            error!(job = %job, error = %e, "Submission task aborted");
        }
    }
}

async fn ack<Q: WorkQueue>(queue: &Q, payload: &str) {
    if let Err(e) = queue.ack(payload).await {
        error!(error = %e, "Failed to acknowledge job");
    }
}
