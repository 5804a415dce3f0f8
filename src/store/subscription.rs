//! Push subscriptions.
//!
//! Each subscription owns one background task that tails a stream on a
//! dedicated backend handle and feeds decoded events to its handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::EventCodec;
use crate::handler::{self, EventHandler};
use crate::storage::{EntryId, StreamBackend};

/// Floor for the delay between retries after a failed read.
const MIN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where a listener starts delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartAt {
    /// First event of an aggregate stream with at least this version.
    Version(i64),
    /// First genuine entry of the global stream at or after this position.
    Position(u64),
}

/// Handle to a running push subscription.
///
/// Unsubscribing is idempotent; the listener task is torn down exactly once.
/// Dropping the handle unsubscribes.
pub struct Subscription {
    name: String,
    active: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// # Panics
    ///
    /// Panics outside a tokio runtime.
    pub(crate) fn spawn(listener: Listener) -> Self {
        let name = listener.stream_key.clone();
        let active = Arc::clone(&listener.active);
        let task = tokio::spawn(listener.run());
        Self {
            name,
            active,
            task: Mutex::new(Some(task)),
        }
    }

    /// False once `unsubscribe` has been called.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop the listener. Later calls are no-ops.
    pub fn unsubscribe(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        info!(stream = %self.name, "Unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("stream", &self.name)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Background tail of one stream.
pub(crate) struct Listener {
    pub backend: Arc<dyn StreamBackend>,
    pub codec: Arc<EventCodec>,
    pub stream_key: String,
    pub start_at: StartAt,
    pub handler: Arc<dyn EventHandler>,
    pub batch_size: usize,
    pub block: Duration,
    pub active: Arc<AtomicBool>,
}

impl Listener {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn retry_delay(&self) -> Duration {
        self.block.max(MIN_RETRY_DELAY)
    }

    async fn run(self) {
        let reader = loop {
            match self.backend.dedicated().await {
                Ok(reader) => break reader,
                Err(e) => {
                    warn!(stream = %self.stream_key, error = %e, "Subscription could not open reader, retrying");
                    tokio::time::sleep(self.retry_delay()).await;
                    if !self.is_active() {
                        return;
                    }
                }
            }
        };

        debug!(stream = %self.stream_key, start_at = ?self.start_at, "Subscription listener started");

        let mut last_id = EntryId::ZERO;
        let mut position: u64 = 0;

        while self.is_active() {
            let entries = match reader
                .read_after(&self.stream_key, last_id, self.batch_size, self.block)
                .await
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(stream = %self.stream_key, error = %e, "Subscription read failed, retrying");
                    tokio::time::sleep(self.retry_delay()).await;
                    continue;
                }
            };

            for entry in entries {
                last_id = entry.id;
                if entry.record.is_sentinel() {
                    continue;
                }
                let entry_position = position;
                position += 1;

                if !self.is_active() {
                    return;
                }

                let event = match self.codec.deserialize(&entry.record) {
                    Ok(event) => event,
                    Err(e) => {
                        error!(stream = %self.stream_key, entry_id = %entry.id, error = %e, "Subscription failed to decode event");
                        continue;
                    }
                };

                let wanted = match self.start_at {
                    StartAt::Version(from) => event.version >= from,
                    StartAt::Position(from) => entry_position >= from,
                };
                if !wanted {
                    continue;
                }

                let event_id = event.event_id;
                if let Err(e) = handler::invoke(self.handler.as_ref(), Arc::new(event)).await {
                    error!(stream = %self.stream_key, event_id = %event_id, error = %e, "Subscription handler failed");
                }
            }
        }
    }
}
