//! Job execution span helpers.
//!
//! Provides span creation and outcome recording for jobs flowing through
//! the worker pool.

use tracing::Span;

/// Start a span for job processing.
///
/// The `job.outcome` field is declared empty and can be updated via
/// [`record_job_outcome`].
pub fn start_job_span(kind: &str, msg_id: i64) -> Span {
    tracing::info_span!(
        "job.process",
        "job.kind" = kind,
        "job.msg_id" = msg_id,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record the job's outcome on the current span.
///
/// Emits a tracing `info` event scoped to the span it runs under.
pub fn record_job_outcome(outcome: &str) {
    let span = Span::current();
    span.record("job.outcome", outcome);
    tracing::info!(outcome, "job processed");
}
