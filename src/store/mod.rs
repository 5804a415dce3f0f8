//! Event store.
//!
//! Owns the per-aggregate streams and the global stream. Appends are guarded
//! by optimistic concurrency: the caller states the version it expects the
//! stream to be at, and the write only happens if that still holds when the
//! backend performs it.

mod subscription;

pub use subscription::Subscription;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{CodecError, Event, EventCodec, WireRecord};
use crate::config::StreamConfig;
use crate::handler::EventHandler;
use crate::metrics::EventStoreMetrics;
use crate::storage::{AppendOutcome, BackendError, StreamBackend, StreamEntry};
use subscription::{Listener, StartAt};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Rejected append arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidArgument {
    #[error("All events must belong to the same aggregate: expected {expected}, found {found}")]
    MixedAggregates { expected: Uuid, found: Uuid },

    #[error("Stream ID {stream_id} must match aggregate ID {aggregate_id}")]
    StreamMismatch { stream_id: Uuid, aggregate_id: Uuid },

    #[error("Event {index} has version {actual}, expected {expected} for stream {stream_id}")]
    OutOfSequence {
        stream_id: Uuid,
        index: usize,
        expected: i64,
        actual: i64,
    },
}

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Concurrency conflict on stream {stream_id}: expected version {expected}, actual {actual}")]
    ConcurrencyConflict {
        stream_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] InvalidArgument),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl StoreError {
    /// True if re-reading the stream and retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::Backend(_))
    }
}

/// Append-only event store over a [`StreamBackend`].
pub struct EventStore {
    backend: Arc<dyn StreamBackend>,
    codec: Arc<EventCodec>,
    config: StreamConfig,
    versions: RwLock<HashMap<Uuid, i64>>,
    metrics: Arc<EventStoreMetrics>,
}

impl EventStore {
    pub fn new(backend: Arc<dyn StreamBackend>, codec: Arc<EventCodec>, config: StreamConfig) -> Self {
        Self {
            backend,
            codec,
            config,
            versions: RwLock::new(HashMap::new()),
            metrics: Arc::new(EventStoreMetrics::new()),
        }
    }

    /// Share a metrics sink with other components (e.g. a consumer).
    pub fn with_metrics(mut self, metrics: Arc<EventStoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<EventStoreMetrics> {
        &self.metrics
    }

    pub fn codec(&self) -> &Arc<EventCodec> {
        &self.codec
    }

    /// Key of an aggregate's stream.
    pub fn stream_key(&self, stream_id: Uuid) -> String {
        format!("{}{}", self.config.stream_prefix, stream_id)
    }

    /// Key of the global stream.
    pub fn all_events_key(&self) -> String {
        format!("{}{}", self.config.stream_prefix, self.config.all_events_stream)
    }

    fn invalidate(&self, stream_id: Uuid) {
        self.versions.write().remove(&stream_id);
    }

    /// Append a batch of events to one aggregate stream.
    ///
    /// Event `i` must carry version `expected_version + i + 1`. Returns the
    /// version of the last event written. An empty batch writes nothing and
    /// returns the current version.
    pub async fn append_to_stream(
        &self,
        events: &[Event],
        stream_id: Uuid,
        expected_version: i64,
    ) -> Result<i64> {
        self.append_recorded(events, stream_id, expected_version, true)
            .await
    }

    /// Append a single event.
    pub async fn append_event(
        &self,
        event: &Event,
        stream_id: Uuid,
        expected_version: i64,
    ) -> Result<i64> {
        self.append_recorded(std::slice::from_ref(event), stream_id, expected_version, false)
            .await
    }

    async fn append_recorded(
        &self,
        events: &[Event],
        stream_id: Uuid,
        expected_version: i64,
        is_batch: bool,
    ) -> Result<i64> {
        let timer = self.metrics.start_operation();
        match self.append_inner(events, stream_id, expected_version).await {
            Ok(version) => {
                self.metrics
                    .record_append_success(timer, events.len(), is_batch);
                self.metrics.log_if_due();
                Ok(version)
            }
            Err(e) => {
                let conflict = matches!(e, StoreError::ConcurrencyConflict { .. });
                self.metrics.record_append_failure(timer, conflict);
                Err(e)
            }
        }
    }

    async fn append_inner(
        &self,
        events: &[Event],
        stream_id: Uuid,
        expected_version: i64,
    ) -> Result<i64> {
        let Some(first) = events.first() else {
            debug!(stream_id = %stream_id, "Empty event list, returning current version");
            return self.get_stream_version(stream_id).await;
        };

        let aggregate_id = first.aggregate_id;
        if let Some(other) = events.iter().find(|e| e.aggregate_id != aggregate_id) {
            return Err(InvalidArgument::MixedAggregates {
                expected: aggregate_id,
                found: other.aggregate_id,
            }
            .into());
        }
        if stream_id != aggregate_id {
            return Err(InvalidArgument::StreamMismatch {
                stream_id,
                aggregate_id,
            }
            .into());
        }

        debug!(
            stream_id = %stream_id,
            count = events.len(),
            expected_version,
            "Appending events"
        );

        let current = self.current_version_for(stream_id, expected_version).await?;

        let records = events
            .iter()
            .enumerate()
            .map(|(index, event)| -> Result<WireRecord> {
                let expected = current + index as i64 + 1;
                if event.version != expected {
                    return Err(InvalidArgument::OutOfSequence {
                        stream_id,
                        index,
                        expected,
                        actual: event.version,
                    }
                    .into());
                }
                Ok(self.codec.serialize(event)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let outcome = self
            .backend
            .append_if_version(
                &self.stream_key(stream_id),
                &self.all_events_key(),
                current,
                &records,
            )
            .await;

        match outcome {
            Ok(AppendOutcome::Appended { version }) => {
                self.versions.write().insert(stream_id, version);
                info!(
                    stream_id = %stream_id,
                    count = events.len(),
                    version,
                    "Appended events"
                );
                Ok(version)
            }
            Ok(AppendOutcome::Conflict { actual }) => {
                self.invalidate(stream_id);
                warn!(
                    stream_id = %stream_id,
                    expected = expected_version,
                    actual,
                    "Concurrent append detected"
                );
                Err(StoreError::ConcurrencyConflict {
                    stream_id,
                    expected: expected_version,
                    actual,
                })
            }
            Err(e) => {
                self.invalidate(stream_id);
                error!(stream_id = %stream_id, count = events.len(), error = %e, "Append failed");
                Err(e.into())
            }
        }
    }

    /// Resolve the current version, re-reading storage once if the cached
    /// value disagrees with the caller's expectation.
    async fn current_version_for(&self, stream_id: Uuid, expected_version: i64) -> Result<i64> {
        let current = self.get_stream_version(stream_id).await?;
        if current == expected_version {
            return Ok(current);
        }

        warn!(
            stream_id = %stream_id,
            expected = expected_version,
            current,
            "Version mismatch, re-reading stream"
        );
        self.invalidate(stream_id);
        let actual = self.get_stream_version(stream_id).await?;
        if actual != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                stream_id,
                expected: expected_version,
                actual,
            });
        }
        Ok(actual)
    }

    /// Version of the last event in the stream, or `-1` if there is none.
    pub async fn get_stream_version(&self, stream_id: Uuid) -> Result<i64> {
        let cached = self.versions.read().get(&stream_id).copied();
        if let Some(version) = cached {
            self.metrics.record_cache_hit();
            return Ok(version);
        }
        self.metrics.record_cache_miss();

        let key = self.stream_key(stream_id);
        if !self.backend.exists(&key).await? {
            return Ok(-1);
        }

        let mut version = -1;
        self.for_each_entry(&key, |entry| {
            if entry.record.is_sentinel() {
                return ControlFlow::Continue(());
            }
            match entry.record.version() {
                Ok(v) => version = v,
                Err(e) => {
                    warn!(stream_id = %stream_id, entry_id = %entry.id, error = %e, "Skipping entry without valid version")
                }
            }
            ControlFlow::Continue(())
        })
        .await?;

        self.versions.write().insert(stream_id, version);
        Ok(version)
    }

    /// Page through a stream from the start until `visit` breaks.
    async fn for_each_entry<F>(&self, key: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&StreamEntry) -> ControlFlow<()> + Send,
    {
        let batch = self.config.read_batch_size.max(1);
        let mut after = None;
        loop {
            let page = self.backend.range(key, after, batch).await?;
            for entry in &page {
                if visit(entry).is_break() {
                    return Ok(());
                }
            }
            match page.last() {
                Some(last) if page.len() == batch => after = Some(last.id),
                _ => return Ok(()),
            }
        }
    }

    /// Events of one aggregate with `from_version <= version <= to_version`.
    ///
    /// A missing stream reads as empty. Undecodable entries are logged and
    /// skipped.
    pub async fn read_from_stream(
        &self,
        stream_id: Uuid,
        from_version: i64,
        to_version: Option<i64>,
    ) -> Result<Vec<Event>> {
        let timer = self.metrics.start_operation();
        let result = self
            .read_stream_inner(stream_id, from_version, to_version)
            .await;
        match &result {
            Ok(events) => self.metrics.record_read_success(timer, events.len()),
            Err(_) => self.metrics.record_read_failure(timer),
        }
        result
    }

    async fn read_stream_inner(
        &self,
        stream_id: Uuid,
        from_version: i64,
        to_version: Option<i64>,
    ) -> Result<Vec<Event>> {
        let key = self.stream_key(stream_id);
        if !self.backend.exists(&key).await? {
            return Ok(Vec::new());
        }

        let codec = &self.codec;
        let mut events = Vec::new();
        self.for_each_entry(&key, |entry| {
            if entry.record.is_sentinel() {
                return ControlFlow::Continue(());
            }
            match codec.deserialize(&entry.record) {
                Ok(event) => {
                    if to_version.is_some_and(|to| event.version > to) {
                        return ControlFlow::Break(());
                    }
                    if event.version >= from_version {
                        events.push(event);
                    }
                }
                Err(e) => {
                    error!(stream_id = %stream_id, entry_id = %entry.id, error = %e, "Failed to decode event")
                }
            }
            ControlFlow::Continue(())
        })
        .await?;

        debug!(stream_id = %stream_id, count = events.len(), "Read stream");
        Ok(events)
    }

    /// Events of the global stream from `from_position`.
    ///
    /// `max_count` of `None` or `0` reads to the end.
    pub async fn read_all_events(
        &self,
        from_position: u64,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>> {
        let timer = self.metrics.start_operation();
        let result = self.read_all_inner(from_position, max_count).await;
        match &result {
            Ok(events) => self.metrics.record_read_success(timer, events.len()),
            Err(_) => self.metrics.record_read_failure(timer),
        }
        result
    }

    async fn read_all_inner(
        &self,
        from_position: u64,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>> {
        let limit = max_count.filter(|&n| n > 0);
        let codec = &self.codec;
        let mut position: u64 = 0;
        let mut events = Vec::new();

        self.for_each_entry(&self.all_events_key(), |entry| {
            if entry.record.is_sentinel() {
                return ControlFlow::Continue(());
            }
            let entry_position = position;
            position += 1;
            if entry_position < from_position {
                return ControlFlow::Continue(());
            }

            match codec.deserialize(&entry.record) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(position = entry_position, entry_id = %entry.id, error = %e, "Failed to decode event from global stream")
                }
            }

            if limit.is_some_and(|n| events.len() >= n) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;

        Ok(events)
    }

    fn subscribe(&self, stream_key: String, start_at: StartAt, handler: Arc<dyn EventHandler>) -> Subscription {
        self.metrics.record_subscription();
        Subscription::spawn(Listener {
            backend: Arc::clone(&self.backend),
            codec: Arc::clone(&self.codec),
            stream_key,
            start_at,
            handler,
            batch_size: self.config.read_batch_size.max(1),
            block: self.config.subscription_block(),
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Push every event of one aggregate with version `>= from_version` to
    /// `handler`, including events appended after this call.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, since the listener is
    /// spawned onto the current one.
    pub fn subscribe_to_stream(
        &self,
        stream_id: Uuid,
        from_version: i64,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        info!(stream_id = %stream_id, from_version, "Subscribing to stream");
        self.subscribe(
            self.stream_key(stream_id),
            StartAt::Version(from_version),
            handler,
        )
    }

    /// Push every event of the global stream from `from_position` onward.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn subscribe_to_all(&self, from_position: u64, handler: Arc<dyn EventHandler>) -> Subscription {
        info!(from_position, "Subscribing to all events");
        self.subscribe(self.all_events_key(), StartAt::Position(from_position), handler)
    }
}
