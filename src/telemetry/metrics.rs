//! Metric instrument factories for the tracker.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workflow-tracker"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workflow-tracker")
}

/// Counter: workflows started.
/// Labels: `workflow` (workflow name).
pub fn workflows_started() -> Counter<u64> {
    meter()
        .u64_counter("tracker.workflows.started")
        .with_description("Number of workflows started")
        .build()
}

/// Counter: terminal status transitions.
/// Labels: `to` ("completed" | "failed"), `result` ("ok" | "noop" | "error").
pub fn workflow_transitions() -> Counter<u64> {
    meter()
        .u64_counter("tracker.workflows.transitions")
        .with_description("Number of workflow status transitions")
        .build()
}

/// Counter: steps accepted into the write buffer.
pub fn steps_buffered() -> Counter<u64> {
    meter()
        .u64_counter("tracker.steps.buffered")
        .with_description("Number of steps accepted into the write buffer")
        .build()
}

/// Counter: steps written by a flush.
pub fn steps_persisted() -> Counter<u64> {
    meter()
        .u64_counter("tracker.steps.persisted")
        .with_description("Number of buffered steps written to storage")
        .build()
}

/// Counter: steps lost to a failed flush.
pub fn steps_dropped() -> Counter<u64> {
    meter()
        .u64_counter("tracker.steps.dropped")
        .with_description("Number of buffered steps lost to failed flushes")
        .build()
}

/// Histogram: flush write duration in milliseconds.
pub fn flush_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("tracker.flush.duration_ms")
        .with_description("Step batch write duration in milliseconds")
        .with_unit("ms")
        .build()
}
