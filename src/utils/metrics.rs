use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::LazyLock;

// --- Dispatch Metrics ---

/// Total number of requests forwarded to a worker, per routing host.
///
/// Use it to monitor throughput per virtual host.
/// Example Prometheus query: `sum by (host) (rate(dispatch_requests_total[5m]))`.
pub static DISPATCH_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dispatch_requests_total",
        "Total number of requests forwarded to a worker per host",
        &["host"]
    )
    .unwrap()
});

/// Total number of forwards that failed and were answered with a 500.
///
/// Failed workers stay in rotation, so a steady rate here for one host
/// usually means a dead backend.
/// Example query: `rate(dispatch_failed_total{host=\"...\"}[5m])`.
pub static DISPATCH_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "dispatch_failed_total",
        "Total number of failed forwards per host",
        &["host"]
    )
    .unwrap()
});

/// Total number of requests answered with a 404 because no worker was registered.
pub static DISPATCH_NOT_FOUND: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "dispatch_not_found_total",
        "Total number of requests for hosts without registered workers"
    )
    .unwrap()
});

/// Histogram of upstream exchange durations in seconds per host.
///
/// Buckets: `[0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0]`.
/// Example query: `histogram_quantile(0.95, sum(rate(upstream_request_duration_seconds_bucket[5m])) by (le, host))`.
pub static UPSTREAM_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "upstream_request_duration_seconds",
        "Histogram of upstream request duration in seconds per host",
        &["host"],
        vec![0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0]
    )
    .unwrap()
});

/// The number of in-flight dispatches.
pub static ACTIVE_DISPATCHES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!("active_dispatches", "Number of requests currently being forwarded")
        .unwrap()
});

// --- Registry Metrics ---

/// Number of workers registered per host.
///
/// Updated on every add and remove through the registration API.
pub static REGISTERED_WORKERS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!("registered_workers", "Number of registered workers per host", &["host"])
        .unwrap()
});

// --- Sync Pipeline Metrics ---

/// Total number of changes drained by the sync consumer, by kind.
///
/// Example query: `rate(sync_changes_total{kind=\"ADDED\"}[5m])`.
pub static SYNC_CHANGES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "sync_changes_total",
        "Total number of ingress changes consumed per kind",
        &["kind"]
    )
    .unwrap()
});

/// Total number of registration calls that failed.
pub static REGISTRATIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "sync_registrations_failed_total",
        "Total number of failed registration calls"
    )
    .unwrap()
});

/// Total number of ingress status write-backs that failed.
pub static STATUS_UPDATES_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "sync_status_updates_failed_total",
        "Total number of failed ingress status updates"
    )
    .unwrap()
});
