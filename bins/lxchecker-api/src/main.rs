mod handlers;
mod jobs;
mod metrics;
mod routes;

use axum::Router;
use futures_util::StreamExt;
use lxchecker_common::redis::COMPLETIONS_CHANNEL;
use lxchecker_common::types::CompletionEvent;
use lxchecker_common::{Config, RedisStore, SubmissionStore};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use jobs::{JobQueue, RedisQueue};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SubmissionStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub start_time: Arc<std::time::Instant>,
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
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    init_tracing(config.json_logs);

    info!("lxchecker API booting...");

    // Initialize metrics
    metrics::init_metrics();
    info!("Metrics registry initialized");

    // Connect to Redis
    let client = redis::Client::open(config.redis_url.as_str())
        .expect("Failed to create Redis client");

    let redis_conn = ConnectionManager::new(client)
        .await
        .expect("Failed to connect to Redis");

    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        store: Arc::new(RedisStore::new(redis_conn.clone())),
        jobs: Arc::new(RedisQueue::new(redis_conn)),
        start_time: Arc::new(std::time::Instant::now()),
    });

    // Start background metrics subscriber
    tokio::spawn(metrics_subscriber(config.redis_url.clone()));

    // Build router
    let app = Router::new().merge(routes::routes()).with_state(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app).await.expect("Server error");
}

/// Background task to subscribe to worker completion events and update metrics
async fn metrics_subscriber(redis_url: String) {
    let client = match redis::Client::open(redis_url.as_str()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to create Redis client for metrics subscriber: {}", e);
            return;
        }
    };

    let mut pubsub = match client.get_async_connection().await {
        Ok(conn) => conn.into_pubsub(),
        Err(e) => {
            tracing::error!("Failed to create pubsub connection: {}", e);
            return;
        }
    };

    if let Err(e) = pubsub.subscribe(COMPLETIONS_CHANNEL).await {
        tracing::error!("Failed to subscribe to completions channel: {}", e);
        return;
    }

    info!("Metrics subscriber started - listening for submission completions");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };

        match serde_json::from_str::<CompletionEvent>(&payload) {
            Ok(event) => {
                metrics::record_submission_completed(
                    &event.status.to_string(),
                    event.execution_time_ms as f64,
                );
                tracing::debug!(
                    submission_id = %event.submission_id,
                    assignment_id = %event.assignment_id,
                    status = %event.status,
                    "Recorded submission completion metrics"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed completion event"),
        }
    }
}
