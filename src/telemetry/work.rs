//! Work processing span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! taken off a queue by a consumer.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for processing one work item.
///
/// The `work.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_work_span(queue: &str, work_id: &WorkId) -> Span {
    tracing::info_span!(
        "work.process",
        "work.queue" = queue,
        "work.id" = %work_id.0,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span and stores the new
/// state in its `work.state` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
