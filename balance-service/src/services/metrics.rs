//! Prometheus metrics for balance-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

/// Ledger operation counter by operation and outcome.
pub static OPERATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "balance_operations_total",
        "Total number of ledger operations",
        &["operation", "status"]  // track, update, check, ... / ok, error
    )
    .expect("Failed to register operations_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "balance_errors_total",
        "Total number of errors by type",
        &["error_type"]
    )
    .expect("Failed to register errors_total")
});

/// Durable store query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "balance_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Deltas submitted to the store writer but not yet settled.
pub static SYNC_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "balance_sync_queue_depth",
        "Deltas waiting for durable persistence"
    )
    .expect("Failed to register sync_queue_depth")
});

/// Store write attempts that failed and were retried.
pub static SYNC_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "balance_sync_retries_total",
        "Total number of retried store writes"
    )
    .expect("Failed to register sync_retries_total")
});

/// Deltas parked for reconciliation after exhausting retries.
pub static SYNC_DEAD_LETTERS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "balance_sync_dead_letters_total",
        "Total number of deltas moved to the dead-letter list"
    )
    .expect("Failed to register sync_dead_letters_total")
});

/// Lost compare-and-set races on the cache.
pub static CAS_CONFLICTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "balance_cas_conflicts_total",
        "Total number of cache compare-and-set conflicts"
    )
    .expect("Failed to register cas_conflicts_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&OPERATIONS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&SYNC_QUEUE_DEPTH);
    Lazy::force(&SYNC_RETRIES_TOTAL);
    Lazy::force(&SYNC_DEAD_LETTERS_TOTAL);
    Lazy::force(&CAS_CONFLICTS_TOTAL);
}

/// Record the outcome of a ledger operation.
pub fn record_operation(operation: &str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
