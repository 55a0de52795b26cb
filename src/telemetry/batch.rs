//! Flush span helpers.
//!
//! One span per sink call, carrying the engine id, the batch size and,
//! once known, the outcome.

use tracing::Span;
use uuid::Uuid;

/// Start a span for one flush call.
///
/// The `batch.result` field is declared empty and filled by
/// [`record_flush_result`].
pub fn start_flush_span(engine_id: &Uuid, batch_size: usize, consecutive_failures: u32) -> Span {
    tracing::info_span!(
        "batch.flush",
        "engine.id" = %engine_id,
        "batch.size" = batch_size,
        "batch.consecutive_failures" = consecutive_failures,
        "batch.result" = tracing::field::Empty,
    )
}

/// Record the flush outcome ("ok" or "error") on the span.
pub fn record_flush_result(span: &Span, result: &str) {
    span.record("batch.result", result);
}
