//! Operational metrics for the event store and consumers.
//!
//! Counters are lock-free atomics so recording never contends with the hot
//! path. With the `otel` feature the same outcomes are also forwarded to the
//! OpenTelemetry instruments in [`crate::utils::metrics`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

#[cfg(feature = "otel")]
use crate::utils::metrics::{
    operation_attr, outcome_attr, CONSUMER_RECORDS_TOTAL, STORE_CACHE_TOTAL, STORE_EVENTS_TOTAL,
    STORE_OPERATION_DURATION, STORE_OPERATION_TOTAL,
};

/// Minimum spacing between periodic metric reports.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// Started by [`EventStoreMetrics::start_operation`]; consumed when the
/// outcome is recorded.
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct OperationTimer {
    started: Instant,
}

impl OperationTimer {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Consumer-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub polls: u64,
    pub records_processed: u64,
    pub records_acknowledged: u64,
    pub records_claimed: u64,
    pub handler_failures: u64,
    pub decode_failures: u64,
    pub errors: u64,
}

/// Immutable view of the counters at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Percentage of operations that succeeded.
    pub success_rate: f64,
    pub append_operations: u64,
    pub batch_append_operations: u64,
    pub read_operations: u64,
    pub subscription_operations: u64,
    pub concurrency_conflicts: u64,
    pub events_appended: u64,
    pub events_read: u64,
    pub average_operation_time_ms: f64,
    pub max_operation_time_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Percentage of version lookups served from cache.
    pub cache_hit_rate: f64,
    pub consumer: ConsumerSnapshot,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operations={} success_rate={:.1}% appends={} ({} batches) reads={} subscriptions={} \
             events_appended={} events_read={} avg_time={:.1}ms max_time={:.1}ms \
             cache_hit_rate={:.1}% conflicts={} consumer_processed={} consumer_claimed={}",
            self.total_operations,
            self.success_rate,
            self.append_operations,
            self.batch_append_operations,
            self.read_operations,
            self.subscription_operations,
            self.events_appended,
            self.events_read,
            self.average_operation_time_ms,
            self.max_operation_time_ms,
            self.cache_hit_rate,
            self.concurrency_conflicts,
            self.consumer.records_processed,
            self.consumer.records_claimed,
        )
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Metrics sink shared by a store and its consumers.
#[derive(Debug)]
pub struct EventStoreMetrics {
    append_operations: AtomicU64,
    batch_append_operations: AtomicU64,
    read_operations: AtomicU64,
    subscription_operations: AtomicU64,

    successful_operations: AtomicU64,
    failed_operations: AtomicU64,
    concurrency_conflicts: AtomicU64,

    total_operation_us: AtomicU64,
    max_operation_us: AtomicU64,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    events_appended: AtomicU64,
    events_read: AtomicU64,

    polls: AtomicU64,
    records_processed: AtomicU64,
    records_acknowledged: AtomicU64,
    records_claimed: AtomicU64,
    handler_failures: AtomicU64,
    decode_failures: AtomicU64,
    consumer_errors: AtomicU64,

    created: Instant,
    last_report_ms: AtomicU64,
}

impl Default for EventStoreMetrics {
    fn default() -> Self {
        Self {
            append_operations: AtomicU64::new(0),
            batch_append_operations: AtomicU64::new(0),
            read_operations: AtomicU64::new(0),
            subscription_operations: AtomicU64::new(0),
            successful_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            concurrency_conflicts: AtomicU64::new(0),
            total_operation_us: AtomicU64::new(0),
            max_operation_us: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            events_appended: AtomicU64::new(0),
            events_read: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            records_processed: AtomicU64::new(0),
            records_acknowledged: AtomicU64::new(0),
            records_claimed: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            consumer_errors: AtomicU64::new(0),
            created: Instant::now(),
            last_report_ms: AtomicU64::new(0),
        }
    }
}

impl EventStoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_operation(&self) -> OperationTimer {
        OperationTimer {
            started: Instant::now(),
        }
    }

    fn finish(&self, timer: OperationTimer, success: bool, _operation: &'static str) {
        let elapsed = timer.elapsed();
        let micros = elapsed.as_micros() as u64;
        self.total_operation_us.fetch_add(micros, Ordering::Relaxed);
        self.max_operation_us.fetch_max(micros, Ordering::Relaxed);
        if success {
            self.successful_operations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "otel")]
        {
            let attrs = [
                operation_attr(_operation),
                outcome_attr(if success { "success" } else { "failure" }),
            ];
            STORE_OPERATION_DURATION.record(elapsed.as_secs_f64(), &attrs);
            STORE_OPERATION_TOTAL.add(1, &attrs);
        }
    }

    pub fn record_append_success(&self, timer: OperationTimer, event_count: usize, is_batch: bool) {
        self.finish(timer, true, "append");
        self.append_operations.fetch_add(1, Ordering::Relaxed);
        if is_batch {
            self.batch_append_operations.fetch_add(1, Ordering::Relaxed);
        }
        self.events_appended
            .fetch_add(event_count as u64, Ordering::Relaxed);

        #[cfg(feature = "otel")]
        STORE_EVENTS_TOTAL.add(event_count as u64, &[operation_attr("append")]);

        debug!(events = event_count, batch = is_batch, "Append completed");
    }

    pub fn record_append_failure(&self, timer: OperationTimer, concurrency_conflict: bool) {
        self.finish(timer, false, "append");
        if concurrency_conflict {
            self.concurrency_conflicts.fetch_add(1, Ordering::Relaxed);
        }
        debug!(concurrency_conflict, "Append failed");
    }

    pub fn record_read_success(&self, timer: OperationTimer, event_count: usize) {
        self.finish(timer, true, "read");
        self.read_operations.fetch_add(1, Ordering::Relaxed);
        self.events_read
            .fetch_add(event_count as u64, Ordering::Relaxed);

        #[cfg(feature = "otel")]
        STORE_EVENTS_TOTAL.add(event_count as u64, &[operation_attr("read")]);

        debug!(events = event_count, "Read completed");
    }

    pub fn record_read_failure(&self, timer: OperationTimer) {
        self.finish(timer, false, "read");
        debug!("Read failed");
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        STORE_CACHE_TOTAL.add(1, &[outcome_attr("hit")]);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        STORE_CACHE_TOTAL.add(1, &[outcome_attr("miss")]);
    }

    pub fn record_subscription(&self) {
        self.subscription_operations.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        STORE_OPERATION_TOTAL.add(
            1,
            &[operation_attr("subscribe"), outcome_attr("success")],
        );
        debug!("Subscription created");
    }

    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    fn record_consumer(&self, counter: &AtomicU64, count: u64, _outcome: &'static str) {
        counter.fetch_add(count, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        CONSUMER_RECORDS_TOTAL.add(count, &[outcome_attr(_outcome)]);
    }

    pub fn record_processed(&self) {
        self.record_consumer(&self.records_processed, 1, "processed");
    }

    pub fn record_acknowledged(&self, count: u64) {
        self.record_consumer(&self.records_acknowledged, count, "acknowledged");
    }

    pub fn record_claimed(&self, count: u64) {
        self.record_consumer(&self.records_claimed, count, "claimed");
    }

    pub fn record_handler_failures(&self, count: u64) {
        self.record_consumer(&self.handler_failures, count, "handler_failed");
    }

    pub fn record_decode_failure(&self) {
        self.record_consumer(&self.decode_failures, 1, "decode_failed");
    }

    pub fn record_consumer_error(&self) {
        self.consumer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let successful = load(&self.successful_operations);
        let failed = load(&self.failed_operations);
        let total = successful + failed;
        let hits = load(&self.cache_hits);
        let misses = load(&self.cache_misses);
        let average_operation_time_ms = if total == 0 {
            0.0
        } else {
            load(&self.total_operation_us) as f64 / total as f64 / 1000.0
        };

        MetricsSnapshot {
            total_operations: total,
            successful_operations: successful,
            failed_operations: failed,
            success_rate: percentage(successful, total),
            append_operations: load(&self.append_operations),
            batch_append_operations: load(&self.batch_append_operations),
            read_operations: load(&self.read_operations),
            subscription_operations: load(&self.subscription_operations),
            concurrency_conflicts: load(&self.concurrency_conflicts),
            events_appended: load(&self.events_appended),
            events_read: load(&self.events_read),
            average_operation_time_ms,
            max_operation_time_ms: load(&self.max_operation_us) as f64 / 1000.0,
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: percentage(hits, hits + misses),
            consumer: ConsumerSnapshot {
                polls: load(&self.polls),
                records_processed: load(&self.records_processed),
                records_acknowledged: load(&self.records_acknowledged),
                records_claimed: load(&self.records_claimed),
                handler_failures: load(&self.handler_failures),
                decode_failures: load(&self.decode_failures),
                errors: load(&self.consumer_errors),
            },
        }
    }

    /// Log a snapshot if [`REPORT_INTERVAL`] has passed since the last one.
    /// Returns true if this call logged.
    pub fn log_if_due(&self) -> bool {
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.last_report_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < REPORT_INTERVAL.as_millis() as u64 {
            return false;
        }
        if self
            .last_report_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        info!(metrics = %self.snapshot(), "Event store metrics");
        true
    }
}
