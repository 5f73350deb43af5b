//! Metric instrument factories for tasktrack-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"tasktrack-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for tasktrack-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("tasktrack-rs")
}

/// Counter: number of tasks created.
pub fn tasks_created() -> Counter<u64> {
    meter()
        .u64_counter("tasktrack.tasks.created")
        .with_description("Number of tasks created")
        .build()
}

/// Counter: task status transitions.
/// Labels: `from`, `to`.
pub fn task_status_transitions() -> Counter<u64> {
    meter()
        .u64_counter("tasktrack.tasks.status_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: queue-level operations (send, read, set_vt, archive, delete).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("tasktrack.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: jobs processed by the worker pool.
/// Labels: `kind`, `outcome` ("success" | "retry").
pub fn jobs_processed() -> Counter<u64> {
    meter()
        .u64_counter("tasktrack.jobs.processed")
        .with_description("Number of jobs processed by the worker pool")
        .build()
}

/// Counter: jobs forwarded to the dead-letter sink.
/// Labels: `kind`.
pub fn jobs_dead_lettered() -> Counter<u64> {
    meter()
        .u64_counter("tasktrack.jobs.dead_lettered")
        .with_description("Number of jobs that exhausted their retry budget")
        .build()
}

/// Counter: cache lookups.
/// Labels: `outcome` ("hit" | "miss" | "expired").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("tasktrack.cache.lookups")
        .with_description("Number of cache lookups")
        .build()
}

/// Counter: jobs enqueued by the overdue scanner.
pub fn overdue_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("tasktrack.scanner.enqueued")
        .with_description("Number of overdue-process jobs enqueued by the scanner")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tasktrack.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
