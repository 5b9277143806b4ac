//! Per-message span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::model::{MessageId, MessageState};

/// Start a span covering one message's processing.
///
/// `message.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_message_span(queue: &str, id: &MessageId, correlation_id: &Uuid) -> Span {
    tracing::info_span!(
        "message.process",
        "messaging.destination" = queue,
        "messaging.message.id" = %id,
        "messaging.correlation_id" = %correlation_id,
        "message.outcome" = tracing::field::Empty,
    )
}

/// Emit a state transition event scoped to `span` and count it.
pub fn record_state_transition(span: &Span, from: MessageState, to: MessageState) {
    span.in_scope(|| {
        tracing::debug!(from = %from, to = %to, "state_transition");
    });
    super::metrics::state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.to_string()),
            opentelemetry::KeyValue::new("to", to.to_string()),
        ],
    );
}

pub fn record_outcome(span: &Span, outcome: &'static str) {
    span.record("message.outcome", outcome);
}
