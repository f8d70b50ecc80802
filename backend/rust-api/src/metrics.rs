use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Database Metrics (MongoDB)
    pub static ref DB_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "db_operations_total",
        "Total number of database operations",
        &["operation", "collection", "status"]
    )
    .unwrap();

    pub static ref DB_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "db_operation_duration_seconds",
        "Database operation duration in seconds",
        &["operation", "collection"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Cache Metrics (Redis)
    pub static ref CACHE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_operations_total",
        "Total number of cache operations",
        &["operation", "status"]
    )
    .unwrap();

    pub static ref CACHE_HIT_RATIO: CounterVec = register_counter_vec!(
        "cache_hit_ratio",
        "Cache hit/miss ratio",
        &["result"]
    )
    .unwrap();

    // Engagement Metrics
    pub static ref STUDY_SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "study_sessions_total",
        "Study session lifecycle transitions",
        &["outcome"]
    )
    .unwrap();

    pub static ref STUDY_SECONDS_ACCRUED_TOTAL: IntCounter = register_int_counter!(
        "study_seconds_accrued_total",
        "Seconds of study time folded into daily aggregates"
    )
    .unwrap();

    pub static ref QUIZ_SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_sessions_total",
        "Quiz session lifecycle transitions",
        &["outcome"]
    )
    .unwrap();

    pub static ref QUIZ_SIGNALS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quiz_signals_total",
        "Lockdown signals recorded on active quiz sessions",
        &["kind"]
    )
    .unwrap();

    pub static ref STREAK_UPDATES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "streak_updates_total",
        "Streak counter updates",
        &["outcome"]
    )
    .unwrap();

    pub static ref GUARD_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "guard_conflicts_total",
        "Conditional updates that matched no row",
        &["operation"]
    )
    .unwrap();

    // Scheduler Metrics
    pub static ref SCHEDULER_JOB_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "scheduler_job_runs_total",
        "Total number of scheduler job runs",
        &["job", "status"]
    )
    .unwrap();

    pub static ref SCHEDULER_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "scheduler_job_duration_seconds",
        "Scheduler job run duration in seconds",
        &["job"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track database operation with metrics.
/// Accepts driver action builders directly, since they resolve through `IntoFuture`.
pub async fn track_db_operation<F, T, E>(operation: &str, collection: &str, future: F) -> Result<T, E>
where
    F: std::future::IntoFuture<Output = Result<T, E>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    DB_OPERATIONS_TOTAL
        .with_label_values(&[operation, collection, status])
        .inc();

    DB_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, collection])
        .observe(duration);

    result
}

/// Helper: count cache operation outcome
pub fn record_cache_operation(operation: &str, ok: bool) {
    let status = if ok { "success" } else { "error" };
    CACHE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Record cache hit
pub fn record_cache_hit() {
    CACHE_HIT_RATIO.with_label_values(&["hit"]).inc();
}

/// Record cache miss
pub fn record_cache_miss() {
    CACHE_HIT_RATIO.with_label_values(&["miss"]).inc();
}

pub fn record_guard_conflict(operation: &str) {
    GUARD_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
}
