//! Central metric definitions.
//!
//! Prometheus collectors for every subsystem, registered lazily on first
//! access. Purely observational: nothing here is consulted on the hot path,
//! and recording a sample never blocks an append.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

// ===== WAL metrics =====

/// Appends by operation and outcome (`ok` or an error code).
pub static WAL_APPEND_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tributary_wal_appends_total",
        "Total WAL append attempts",
        &["operation", "status"]
    )
    .expect("Failed to register WAL append counter")
});

/// Append latency from call to acknowledgement.
pub static WAL_APPEND_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tributary_wal_append_duration_seconds",
        "WAL append duration in seconds",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register WAL append histogram")
});

/// Page flushes by outcome.
pub static WAL_FLUSH_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tributary_wal_flushes_total",
        "Total WAL page flushes",
        &["status"]
    )
    .expect("Failed to register WAL flush counter")
});

/// Entries currently buffered and awaiting a flush.
pub static WAL_BUFFERED_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tributary_wal_buffered_entries",
        "WAL entries buffered in unflushed pages"
    )
    .expect("Failed to register WAL buffer gauge")
});

/// Last assigned LSN.
pub static WAL_CURRENT_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tributary_wal_current_lsn", "Last assigned LSN")
        .expect("Failed to register current LSN gauge")
});

/// Highest LSN known persisted.
pub static WAL_DURABLE_LSN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tributary_wal_durable_lsn", "Highest persisted LSN")
        .expect("Failed to register durable LSN gauge")
});

// ===== Materializer metrics =====

/// Materialization latency by scope (`collection`, `branch`, `document`).
pub static MATERIALIZE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tributary_materialize_duration_seconds",
        "State reconstruction duration in seconds",
        &["scope"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register materialize histogram")
});

/// Snapshot cache hits/misses.
pub static MATERIALIZE_CACHE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tributary_materialize_cache_total",
        "Snapshot cache lookups",
        &["outcome"]
    )
    .expect("Failed to register snapshot cache counter")
});

// ===== Restore metrics =====

/// Restore-service operations by kind and outcome.
pub static RESTORE_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tributary_restore_operations_total",
        "Restore service operations",
        &["operation", "status"]
    )
    .expect("Failed to register restore counter")
});
