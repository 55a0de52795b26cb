//! Integration tests for telemetry initialization and span helpers.

use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = batchq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "batchq-test".to_string(),
        default_level: "debug".to_string(),
    };
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    if let Ok(guard) = batchq::telemetry::init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn flush_span_creates_and_records_result() {
    let id = Uuid::new_v4();
    let span = batchq::telemetry::batch::start_flush_span(&id, 50, 0);
    batchq::telemetry::batch::record_flush_result(&span, "ok");

    let span = batchq::telemetry::batch::start_flush_span(&id, 12, 3);
    batchq::telemetry::batch::record_flush_result(&span, "error");
}

#[test]
fn metric_instruments_accept_measurements() {
    use opentelemetry::KeyValue;
    use batchq::telemetry::metrics;

    metrics::items_submitted().add(1, &[]);
    metrics::items_dropped().add(2, &[KeyValue::new("reason", "queue_full")]);
    metrics::batches_flushed().add(1, &[KeyValue::new("result", "ok")]);
    metrics::flush_duration_ms().record(4.2, &[]);
}
