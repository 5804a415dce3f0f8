//! Consumer-group catch-up consumer over the global stream.
//!
//! Each consumer polls its group for new entries, dispatches them to the
//! registered handlers and acknowledges them. Entries left pending by a
//! crashed group member are claimed once they have been idle long enough,
//! so every entry is processed at least once.

mod registry;

pub use registry::{HandlerId, HandlerRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, EventCodec, WireRecord};
use crate::config::{ConsumerConfig, StreamConfig};
use crate::handler::{dispatch_to_handlers, DispatchResult, EventHandler};
use crate::metrics::EventStoreMetrics;
use crate::storage::{BackendError, EntryId, StreamBackend, StreamEntry};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A named member of a consumer group on the global stream.
pub struct EventConsumer {
    backend: Arc<dyn StreamBackend>,
    reader: OnceCell<Arc<dyn StreamBackend>>,
    codec: Arc<EventCodec>,
    config: ConsumerConfig,
    stream_key: String,
    handlers: HandlerRegistry,
    metrics: Arc<EventStoreMetrics>,
    running: AtomicBool,
    shutdown: Notify,
}

impl EventConsumer {
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        codec: Arc<EventCodec>,
        streams: &StreamConfig,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            backend,
            reader: OnceCell::new(),
            codec,
            config,
            stream_key: format!("{}{}", streams.stream_prefix, streams.all_events_stream),
            handlers: HandlerRegistry::new(),
            metrics: Arc::new(EventStoreMetrics::new()),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EventStoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<EventStoreMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Key of the stream this consumer reads.
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn register_event_handler(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> HandlerId {
        self.handlers.register(event_type, handler)
    }

    pub fn register_all_events_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        self.handlers.register_all(handler)
    }

    pub fn unregister_event_handler(&self, event_type: &str, id: HandlerId) -> bool {
        self.handlers.unregister(event_type, id)
    }

    pub fn unregister_all_events_handler(&self, id: HandlerId) -> bool {
        self.handlers.unregister_all(id)
    }

    /// Make sure the global stream and the consumer group exist.
    ///
    /// Safe to call repeatedly and from several group members. Failures are
    /// logged; `poll_events` keeps working once the group shows up.
    pub async fn init(&self) {
        if !self.config.create_consumer_group {
            debug!(group = %self.config.consumer_group, "Consumer group creation disabled");
            return;
        }

        if let Err(e) = self.backend.append(&self.stream_key, &WireRecord::sentinel()).await {
            warn!(stream = %self.stream_key, error = %e, "Failed to seed stream");
        }

        match self
            .backend
            .create_group(&self.stream_key, &self.config.consumer_group)
            .await
        {
            Ok(()) => info!(
                stream = %self.stream_key,
                group = %self.config.consumer_group,
                "Created consumer group"
            ),
            Err(BackendError::GroupExists { .. }) => debug!(
                group = %self.config.consumer_group,
                "Consumer group already exists"
            ),
            Err(e) => {
                self.metrics.record_consumer_error();
                error!(
                    stream = %self.stream_key,
                    group = %self.config.consumer_group,
                    error = %e,
                    "Failed to create consumer group"
                );
            }
        }
    }

    async fn read_new(&self) -> Result<Vec<StreamEntry>, BackendError> {
        let reader = self
            .reader
            .get_or_try_init(|| self.backend.dedicated())
            .await?;
        reader
            .read_group(
                &self.stream_key,
                &self.config.consumer_group,
                &self.config.consumer_name,
                self.config.max_batch_size.max(1),
                self.config.poll_timeout(),
            )
            .await
    }

    /// One poll cycle: process new entries, then claim idle pending ones.
    pub async fn poll_events(&self) {
        self.metrics.record_poll();

        match self.read_new().await {
            Ok(entries) => {
                if !entries.is_empty() {
                    debug!(count = entries.len(), "Received entries");
                }
                for entry in &entries {
                    self.process_record(entry).await;
                }
            }
            Err(BackendError::NoGroup { .. }) => {
                debug!(group = %self.config.consumer_group, "Consumer group not created yet");
            }
            Err(e) => {
                self.metrics.record_consumer_error();
                error!(
                    consumer = %self.config.consumer_name,
                    error = %e,
                    "Failed to poll events"
                );
            }
        }

        self.claim_pending_messages().await;
    }

    /// Claim and process pending entries idle longer than the claim timeout.
    ///
    /// Returns the number of entries claimed by this consumer.
    pub async fn claim_pending_messages(&self) -> usize {
        let group = &self.config.consumer_group;

        let pending = match self.backend.pending_count(&self.stream_key, group).await {
            Ok(pending) => pending,
            Err(e) => {
                self.log_claim_error(&e);
                return 0;
            }
        };
        if pending == 0 {
            return 0;
        }

        // Backends compare idle times inclusively at millisecond resolution.
        let min_idle = self.config.claim_idle_timeout() + Duration::from_millis(1);
        let candidates: Vec<EntryId> = match self
            .backend
            .pending_entries(
                &self.stream_key,
                group,
                min_idle,
                self.config.max_batch_size.max(1),
            )
            .await
        {
            Ok(entries) => entries.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                self.log_claim_error(&e);
                return 0;
            }
        };
        if candidates.is_empty() {
            return 0;
        }

        let claimed = match self
            .backend
            .claim(
                &self.stream_key,
                group,
                &self.config.consumer_name,
                min_idle,
                &candidates,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.log_claim_error(&e);
                return 0;
            }
        };
        if claimed.is_empty() {
            return 0;
        }

        info!(
            consumer = %self.config.consumer_name,
            count = claimed.len(),
            "Claimed idle pending entries"
        );
        self.metrics.record_claimed(claimed.len() as u64);

        for entry in &claimed {
            self.process_record(entry).await;
        }
        claimed.len()
    }

    fn log_claim_error(&self, e: &BackendError) {
        if matches!(e, BackendError::NoGroup { .. }) {
            debug!(group = %self.config.consumer_group, "No consumer group to claim from");
        } else {
            self.metrics.record_consumer_error();
            error!(
                consumer = %self.config.consumer_name,
                error = %e,
                "Failed to claim pending entries"
            );
        }
    }

    /// Dispatch one entry and acknowledge it according to the ack policy.
    pub async fn process_record(&self, entry: &StreamEntry) -> DispatchResult {
        let result = self.dispatch(entry).await;
        if result.should_ack(self.config.ack_policy) {
            self.acknowledge(entry.id).await;
        } else {
            debug!(entry_id = %entry.id, "Leaving entry pending for retry");
        }
        result
    }

    async fn dispatch(&self, entry: &StreamEntry) -> DispatchResult {
        if entry.record.is_sentinel() {
            debug!(entry_id = %entry.id, "Skipping sentinel entry");
            return DispatchResult::Sentinel;
        }

        let event = match self.codec.deserialize(&entry.record) {
            Ok(event) => Arc::new(event),
            Err(CodecError::UnknownEventType(event_type)) => {
                self.metrics.record_decode_failure();
                warn!(
                    entry_id = %entry.id,
                    event_type = %event_type,
                    "Event type not registered, leaving entry for other group members"
                );
                return DispatchResult::UnknownEventType;
            }
            Err(e) => {
                self.metrics.record_decode_failure();
                error!(entry_id = %entry.id, error = %e, "Failed to decode entry");
                return DispatchResult::DecodeError;
            }
        };

        let handlers = self.handlers.handlers_for(&event.event_type);
        let failures = dispatch_to_handlers(&handlers, &event).await;
        self.metrics.record_processed();

        if failures > 0 {
            self.metrics.record_handler_failures(failures as u64);
            DispatchResult::HandlerFailed
        } else {
            DispatchResult::Success
        }
    }

    async fn acknowledge(&self, id: EntryId) {
        match self
            .backend
            .ack(&self.stream_key, &self.config.consumer_group, &[id])
            .await
        {
            Ok(count) => self.metrics.record_acknowledged(count),
            Err(e) => {
                self.metrics.record_consumer_error();
                error!(entry_id = %id, error = %e, "Failed to acknowledge entry");
            }
        }
    }

    /// Poll on a fixed interval until `shutdown` is called.
    ///
    /// Returns `None` if the poll loop is already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(consumer = %self.config.consumer_name, "Consumer already running");
            return None;
        }
        let consumer = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!(
                group = %consumer.config.consumer_group,
                consumer = %consumer.config.consumer_name,
                "Consumer started"
            );

            let mut interval =
                tokio::time::interval(consumer.config.poll_interval().max(MIN_POLL_INTERVAL));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while consumer.is_running() {
                tokio::select! {
                    _ = consumer.shutdown.notified() => break,
                    _ = interval.tick() => {
                        consumer.poll_events().await;
                        consumer.metrics.log_if_due();
                    }
                }
            }

            consumer.running.store(false, Ordering::Release);
            info!(consumer = %consumer.config.consumer_name, "Consumer stopped");
        }))
    }

    /// Stop the polling loop after the current cycle.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests;
