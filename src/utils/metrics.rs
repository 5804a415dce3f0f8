//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).
//! The OTel Collector / Prometheus exporter converts dots to underscores.

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("eventlog"));

// ============================================================================
// Event Store
// ============================================================================

/// Duration of store operations (append, read).
pub static STORE_OPERATION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("eventlog.store.operation.duration")
        .with_description("Event store operation duration")
        .with_unit("s")
        .build()
});

/// Total store operations.
pub static STORE_OPERATION_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventlog.store.operation.total")
        .with_description("Total event store operations")
        .build()
});

/// Total events appended or read.
pub static STORE_EVENTS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventlog.store.events.total")
        .with_description("Total events appended or read")
        .build()
});

/// Version cache lookups.
pub static STORE_CACHE_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventlog.store.cache.total")
        .with_description("Version cache lookups")
        .build()
});

// ============================================================================
// Consumer
// ============================================================================

/// Entries handled by group consumers.
pub static CONSUMER_RECORDS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventlog.consumer.records.total")
        .with_description("Entries handled by group consumers")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create an operation label (append, read, subscribe).
pub fn operation_attr(operation: &str) -> KeyValue {
    KeyValue::new("operation", operation.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}
