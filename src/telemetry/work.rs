//! Span helpers for dispatched work and connector calls.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one execution attempt of a work item.
///
/// The `work.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_work_span(work_type: &str, work_id: &Uuid, attempt: u32) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.type" = work_type,
        "work.id" = %work_id,
        "work.attempt" = attempt,
        "work.state" = tracing::field::Empty,
    )
}

/// Start a span around a connector's connect/execute/disconnect sequence.
pub fn start_connector_span(connector: &str, deadline_ms: u64) -> Span {
    tracing::info_span!(
        "connector.execute",
        "connector.name" = connector,
        "connector.deadline_ms" = deadline_ms,
        "connector.result" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
