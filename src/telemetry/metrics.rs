//! Metric instrument factories for queuehub.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"queuehub"` meter. Without
//! a configured provider they are no-ops.
//!
//! The engine records through instruments built once, on first use. Install
//! the meter provider (see [`init_telemetry`](super::init_telemetry)) before
//! the first queue is created, or the engine's counters stay no-ops.

use std::sync::LazyLock;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for queuehub instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("queuehub")
}

/// Counter: queue lifecycle events.
/// Labels: `event` ("created" | "deleted" | "expired").
pub fn queue_lifecycle() -> Counter<u64> {
    meter()
        .u64_counter("queuehub.queue.lifecycle")
        .with_description("Number of queue lifecycle events")
        .build()
}

/// Counter: work items admitted to a queue.
/// Labels: `path` ("direct" | "backlog").
pub fn work_admitted() -> Counter<u64> {
    meter()
        .u64_counter("queuehub.work.admitted")
        .with_description("Number of work items admitted")
        .build()
}

/// Counter: work items handed to a consumer.
/// Labels: `source` ("single" | "fan_in").
pub fn work_delivered() -> Counter<u64> {
    meter()
        .u64_counter("queuehub.work.delivered")
        .with_description("Number of work items delivered to consumers")
        .build()
}

static QUEUE_LIFECYCLE: LazyLock<Counter<u64>> = LazyLock::new(queue_lifecycle);
static WORK_ADMITTED: LazyLock<Counter<u64>> = LazyLock::new(work_admitted);
static WORK_DELIVERED: LazyLock<Counter<u64>> = LazyLock::new(work_delivered);

pub(crate) fn record_queue_event(event: &'static str) {
    QUEUE_LIFECYCLE.add(1, &[KeyValue::new("event", event)]);
}

pub(crate) fn record_admitted(path: &'static str) {
    WORK_ADMITTED.add(1, &[KeyValue::new("path", path)]);
}

pub(crate) fn record_delivered(source: &'static str) {
    WORK_DELIVERED.add(1, &[KeyValue::new("source", source)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_reuse_one_instrument_each() {
        let admitted: *const Counter<u64> = &*WORK_ADMITTED;
        let delivered: *const Counter<u64> = &*WORK_DELIVERED;
        for _ in 0..1_000 {
            record_admitted("direct");
            record_delivered("single");
            record_queue_event("created");
        }
        assert!(std::ptr::eq(admitted, &*WORK_ADMITTED));
        assert!(std::ptr::eq(delivered, &*WORK_DELIVERED));
    }
}
