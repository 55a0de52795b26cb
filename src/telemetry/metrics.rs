//! Metric instrument factories for batchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"batchq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for batchq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("batchq")
}

/// Counter: items accepted by `submit`.
pub fn items_submitted() -> Counter<u64> {
    meter()
        .u64_counter("batchq.items.submitted")
        .with_description("Number of items accepted into the queue")
        .build()
}

/// Counter: items that never reached the sink.
/// Labels: `reason` ("queue_full" | "excluded" | "batch_dropped" | "queue_dropped").
pub fn items_dropped() -> Counter<u64> {
    meter()
        .u64_counter("batchq.items.dropped")
        .with_description("Number of items discarded before delivery")
        .build()
}

/// Counter: flush calls.
/// Labels: `result` ("ok" | "error").
pub fn batches_flushed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.batches.flushed")
        .with_description("Number of batches handed to the sink")
        .build()
}

/// Histogram: sink flush duration in milliseconds.
pub fn flush_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchq.flush.duration_ms")
        .with_description("Sink flush duration in milliseconds")
        .with_unit("ms")
        .build()
}
