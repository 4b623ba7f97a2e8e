//! Prometheus counters for the indexing loop and query path. Kept in one
//! place, same as the rest of this codebase's per-crate `metrics.rs`
//! convention.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram,
    register_int_counter,
    register_int_counter_vec,
    Histogram,
    IntCounter,
    IntCounterVec,
};

pub static BATCHES_COMMITTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "index_engine_batches_committed_total",
        "Number of indexing batches committed"
    )
    .unwrap()
});

pub static BATCH_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "index_engine_batch_duration_seconds",
        "Wall-clock time to run and commit one indexing batch"
    )
    .unwrap()
});

pub static WRITE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "index_engine_write_errors_total",
        "Full-text write errors observed, labeled by whether they counted toward the error budget",
        &["counted"]
    )
    .unwrap()
});

pub static PRIORITY_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "index_engine_priority_transitions_total",
        "Index priority transitions, labeled by the notification kind raised",
        &["kind"]
    )
    .unwrap()
});

pub static QUERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "index_engine_queries_total",
        "Queries served, labeled by whether the response was stale",
        &["stale"]
    )
    .unwrap()
});

pub fn log_batch_committed(duration: std::time::Duration) {
    BATCHES_COMMITTED_TOTAL.inc();
    BATCH_DURATION_SECONDS.observe(duration.as_secs_f64());
}

pub fn log_write_error(counted: bool) {
    WRITE_ERRORS_TOTAL.with_label_values(&[if counted { "true" } else { "false" }]).inc();
}

pub fn log_priority_transition(kind: &str) {
    PRIORITY_TRANSITIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn log_query(is_stale: bool) {
    QUERIES_TOTAL.with_label_values(&[if is_stale { "true" } else { "false" }]).inc();
}
