//! Prometheus metrics for benchmark ingestion and background work.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record an ingested result submission.
pub fn result_ingested(created: bool) {
    let outcome = if created { "created" } else { "updated" };
    counter!("bench_results_ingested_total", "outcome" => outcome).increment(1);
}

/// Record a unique-constraint conflict that triggered a retry.
pub fn conflict_retry() {
    counter!("bench_conflict_retries_total").increment(1);
}

/// Record a test job status transition.
pub fn test_job_status_changed(status: &str) {
    counter!("bench_test_jobs_total", "status" => status.to_string()).increment(1);
}

/// Record a scheduled task execution.
pub fn task_executed(kind: &str, outcome: &str, duration_ms: u64) {
    counter!(
        "bench_tasks_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("bench_task_duration_ms", "kind" => kind.to_string()).record(duration_ms as f64);
}

/// Set the number of regressions found by the latest progress digest.
pub fn regressions_found(window: &str, count: usize) {
    gauge!("bench_regressions", "window" => window.to_string()).set(count as f64);
}
