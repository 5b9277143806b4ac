//! Metric instruments for leaseq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("leaseq")
}

/// Counter: messages enqueued.
/// Labels: `queue`, `result` ("ok" | "duplicate_job" | "error").
pub fn messages_sent() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.messages.sent")
        .with_description("Number of messages enqueued")
        .build()
}

/// Counter: dequeue outcomes.
/// Labels: `queue`, `outcome` ("message" | "expired" | "poison").
pub fn messages_received() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.messages.received")
        .with_description("Number of dequeue attempts that returned something")
        .build()
}

/// Counter: how processed messages were finished.
/// Labels: `queue`, `outcome` ("committed" | "requeued" | "delayed" | "errored" | "lost").
pub fn messages_finished() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.messages.finished")
        .with_description("Number of messages finished by consumers")
        .build()
}

/// Counter: message state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.messages.state_transitions")
        .with_description("Number of message state transitions")
        .build()
}

/// Counter: rows affected by background sweeps.
/// Labels: `queue`, `sweep` ("heartbeat" | "delayed" | "expiration" | "errors").
pub fn sweep_rows() -> Counter<u64> {
    meter()
        .u64_counter("leaseq.sweep.rows")
        .with_description("Messages moved or deleted by background sweeps")
        .build()
}

/// Histogram: handler duration in milliseconds.
/// Labels: `queue`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leaseq.handler.duration_ms")
        .with_description("Message handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
