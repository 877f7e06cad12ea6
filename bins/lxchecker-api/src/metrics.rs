// Prometheus metrics for the lxchecker API

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder};

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Submissions accepted at intake
    pub static ref SUBMISSIONS_CREATED: IntCounter = IntCounter::new(
        "lxchecker_submissions_created_total",
        "Total number of submissions accepted"
    )
    .expect("metric can be created");

    // Terminal writes reported by workers (status label)
    pub static ref SUBMISSIONS_COMPLETED: CounterVec = CounterVec::new(
        Opts::new("lxchecker_submissions_completed_total", "Total number of submissions finished"),
        &["status"]
    )
    .expect("metric can be created");

    // Scheduler run time, pull to logs (in milliseconds)
    pub static ref EXECUTION_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "lxchecker_execution_time_ms",
            "Submission execution time in milliseconds"
        )
        .buckets(vec![500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0, 300000.0]),
    )
    .expect("metric can be created");

    // Intake rejections
    pub static ref SUBMISSIONS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("lxchecker_submissions_rejected_total", "Total submissions rejected at intake"),
        &["reason"]
    )
    .expect("metric can be created");
}

/// Initialize metrics registry
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(SUBMISSIONS_CREATED.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(SUBMISSIONS_COMPLETED.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(EXECUTION_TIME.clone()))
        .expect("collector can be registered");

    REGISTRY
        .register(Box::new(SUBMISSIONS_REJECTED.clone()))
        .expect("collector can be registered");
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_submission_created() {
    SUBMISSIONS_CREATED.inc();
}

pub fn record_submission_rejected(reason: &str) {
    SUBMISSIONS_REJECTED.with_label_values(&[reason]).inc();
}

/// Record a worker's terminal write
pub fn record_submission_completed(status: &str, execution_time_ms: f64) {
    SUBMISSIONS_COMPLETED.with_label_values(&[status]).inc();
    EXECUTION_TIME.observe(execution_time_ms);
}
