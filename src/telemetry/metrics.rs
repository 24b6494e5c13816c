//! Metric instrument factories for flowcoord.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the [`super::INSTRUMENTATION_SCOPE`] meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Bucket bounds for lock waits, in milliseconds. Most acquisitions are
/// uncontended; the tail runs up to the default 60s lock timeout.
pub const LOCK_WAIT_BUCKETS_MS: &[f64] = &[
    0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 30_000.0, 60_000.0,
];

/// Bucket bounds for connector runs, in milliseconds, up to the default
/// 300s connector deadline.
pub const CONNECTOR_DURATION_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0, 60_000.0,
    120_000.0, 300_000.0,
];

/// Returns the shared meter for flowcoord instruments.
fn meter() -> Meter {
    opentelemetry::global::meter(super::INSTRUMENTATION_SCOPE)
}

/// Counter: entity lock acquisition attempts.
/// Labels: `result` ("acquired" | "reentered" | "timeout" | "error").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("flowcoord.lock.acquisitions")
        .with_description("Number of entity lock acquisition attempts")
        .build()
}

/// Histogram: time spent waiting for an entity lock.
/// Labels: `result`.
pub fn lock_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("flowcoord.lock.wait_ms")
        .with_description("Time spent waiting for an entity lock")
        .with_unit("ms")
        .with_boundaries(LOCK_WAIT_BUCKETS_MS.to_vec())
        .build()
}

/// Counter: connector executions.
/// Labels: `connector`, `result` ("ok" | "timeout" | "error").
pub fn connector_executions() -> Counter<u64> {
    meter()
        .u64_counter("flowcoord.connector.executions")
        .with_description("Number of connector executions")
        .build()
}

/// Histogram: connector execution duration in milliseconds.
/// Labels: `connector`.
pub fn connector_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("flowcoord.connector.duration_ms")
        .with_description("Connector execution duration in milliseconds")
        .with_unit("ms")
        .with_boundaries(CONNECTOR_DURATION_BUCKETS_MS.to_vec())
        .build()
}

/// Counter: connector instances moved out of a failed state.
/// Labels: `to`.
pub fn connector_resets() -> Counter<u64> {
    meter()
        .u64_counter("flowcoord.connector.resets")
        .with_description("Number of connector instance state resets")
        .build()
}

/// Counter: abnormal work executions detected by the auditor.
/// Labels: `work_type`, `status` ("too_many_executions" | "too_much_time_elapsed").
pub fn abnormal_executions() -> Counter<u64> {
    meter()
        .u64_counter("flowcoord.work.abnormal_executions")
        .with_description("Work items flagged as abnormal")
        .build()
}

/// Counter: previously abnormal work items that eventually succeeded.
/// Labels: `work_type`.
pub fn recovered_executions() -> Counter<u64> {
    meter()
        .u64_counter("flowcoord.work.recovered_executions")
        .with_description("Abnormal work items that eventually succeeded")
        .build()
}

/// Counter: message correlation outcomes.
/// Labels: `outcome` ("handed_off" | "stored" | "matched_pending" | "timeout").
pub fn correlations() -> Counter<u64> {
    meter()
        .u64_counter("flowcoord.correlation.outcomes")
        .with_description("Number of message correlation outcomes")
        .build()
}
