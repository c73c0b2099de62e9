//! Workflow span helpers.
//!
//! Spans for buffered writes and workflow lifecycle calls, so traces show
//! which batch carried which steps and which call ended a workflow.

use tracing::Span;

use crate::model::{Status, WorkflowId};

/// Span for one buffer flush.
pub fn flush_span(batch_size: usize) -> Span {
    tracing::info_span!("tracker.flush", "flush.batch_size" = batch_size)
}

/// Span for a tracker operation on one workflow.
///
/// The `workflow.status` field is declared empty and filled in by
/// [`record_transition`].
pub fn workflow_span(operation: &'static str, id: WorkflowId) -> Span {
    tracing::info_span!(
        "tracker.workflow",
        "tracker.operation" = operation,
        "workflow.id" = %id,
        "workflow.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the span.
pub fn record_transition(span: &Span, from: Status, to: Status) {
    span.record("workflow.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "status_transition");
    });
}
