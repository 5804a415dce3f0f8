//! In-memory stream log.
//!
//! Mirrors the Redis Streams semantics the store relies on: monotonic
//! `<millis>-<seq>` entry ids, consumer groups created at the stream tail,
//! pending-entry tracking with idle times, and blocking reads woken by appends.
//! Clones share the same log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{
    AppendOutcome, BackendError, EntryId, PendingEntry, Result, StreamBackend, StreamEntry,
};
use crate::codec::WireRecord;

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingState>,
}

#[derive(Default)]
struct Stream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, Group>,
}

impl Stream {
    /// Index of the first entry with an id greater than `after`.
    fn start_after(&self, after: EntryId) -> usize {
        self.entries.partition_point(|e| e.id <= after)
    }

    fn entry(&self, id: EntryId) -> Option<&StreamEntry> {
        self.entries
            .binary_search_by(|e| e.id.cmp(&id))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    fn last_version(&self) -> i64 {
        self.entries
            .iter()
            .rev()
            .filter(|e| !e.record.is_sentinel())
            .find_map(|e| e.record.version().ok())
            .unwrap_or(-1)
    }

    fn group_mut(&mut self, key: &str, group: &str) -> Result<&mut Group> {
        self.groups.get_mut(group).ok_or_else(|| BackendError::NoGroup {
            key: key.to_string(),
            group: group.to_string(),
        })
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    last_id: EntryId,
}

impl State {
    fn next_id(&mut self) -> EntryId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_id = if millis > self.last_id.millis {
            EntryId::new(millis, 0)
        } else {
            EntryId::new(self.last_id.millis, self.last_id.seq + 1)
        };
        self.last_id
    }

    fn push(&mut self, key: &str, record: WireRecord) -> EntryId {
        let id = self.next_id();
        self.streams
            .entry(key.to_string())
            .or_default()
            .entries
            .push(StreamEntry { id, record });
        id
    }

    fn stream_mut(&mut self, key: &str, group: &str) -> Result<&mut Stream> {
        self.streams
            .get_mut(key)
            .ok_or_else(|| BackendError::NoGroup {
                key: key.to_string(),
                group: group.to_string(),
            })
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    appended: Notify,
}

/// In-process stream log shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryStreamBackend {
    inner: Arc<Inner>,
}

impl MemoryStreamBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `poll` until it yields entries or `block` elapses.
    async fn wait_for<F>(&self, block: Duration, mut poll: F) -> Result<Vec<StreamEntry>>
    where
        F: FnMut(&mut State) -> Result<Vec<StreamEntry>> + Send,
    {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = {
                let mut state = self.inner.state.lock();
                poll(&mut state)?
            };
            if !found.is_empty() || block.is_zero() {
                return Ok(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[async_trait]
impl StreamBackend for MemoryStreamBackend {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.state.lock().streams.contains_key(key))
    }

    async fn append(&self, key: &str, record: &WireRecord) -> Result<EntryId> {
        let id = self.inner.state.lock().push(key, record.clone());
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn append_if_version(
        &self,
        stream_key: &str,
        global_key: &str,
        expected_version: i64,
        records: &[WireRecord],
    ) -> Result<AppendOutcome> {
        let outcome = {
            let mut state = self.inner.state.lock();
            let actual = state
                .streams
                .get(stream_key)
                .map(Stream::last_version)
                .unwrap_or(-1);
            if actual != expected_version {
                return Ok(AppendOutcome::Conflict { actual });
            }
            for record in records {
                state.push(stream_key, record.clone());
                state.push(global_key, record.clone());
            }
            AppendOutcome::Appended {
                version: expected_version + records.len() as i64,
            }
        };
        self.inner.appended.notify_waiters();
        Ok(outcome)
    }

    async fn range(
        &self,
        key: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let state = self.inner.state.lock();
        let Some(stream) = state.streams.get(key) else {
            return Ok(Vec::new());
        };
        let start = after.map(|id| stream.start_after(id)).unwrap_or(0);
        Ok(stream.entries[start..].iter().take(count).cloned().collect())
    }

    async fn read_after(
        &self,
        key: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.wait_for(block, |state| {
            Ok(state
                .streams
                .get(key)
                .map(|stream| {
                    let start = stream.start_after(after);
                    stream.entries[start..].iter().take(count).cloned().collect()
                })
                .unwrap_or_default())
        })
        .await
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let stream = state
            .streams
            .get_mut(key)
            .ok_or_else(|| BackendError::NoSuchKey(key.to_string()))?;
        if stream.groups.contains_key(group) {
            return Err(BackendError::GroupExists {
                key: key.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = stream.entries.last().map(|e| e.id).unwrap_or_default();
        stream.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        debug!(key = %key, group = %group, "Created consumer group");
        Ok(())
    }

    async fn destroy_group(&self, key: &str, group: &str) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let removed = state
            .streams
            .get_mut(key)
            .and_then(|stream| stream.groups.remove(group))
            .is_some();
        if removed {
            debug!(key = %key, group = %group, "Destroyed consumer group");
        }
        Ok(removed)
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.wait_for(block, |state| {
            let stream = state.stream_mut(key, group)?;
            let last_delivered = stream.group_mut(key, group)?.last_delivered;
            let start = stream.start_after(last_delivered);
            let delivered: Vec<StreamEntry> =
                stream.entries[start..].iter().take(count).cloned().collect();

            let now = Instant::now();
            let group_state = stream.group_mut(key, group)?;
            for entry in &delivered {
                group_state.last_delivered = entry.id;
                group_state.pending.insert(
                    entry.id,
                    PendingState {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
            }
            Ok(delivered)
        })
        .await
    }

    async fn pending_count(&self, key: &str, group: &str) -> Result<u64> {
        let mut state = self.inner.state.lock();
        let stream = state.stream_mut(key, group)?;
        Ok(stream.group_mut(key, group)?.pending.len() as u64)
    }

    async fn pending_entries(
        &self,
        key: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut state = self.inner.state.lock();
        let stream = state.stream_mut(key, group)?;
        let now = Instant::now();
        Ok(stream
            .group_mut(key, group)?
            .pending
            .iter()
            .map(|(id, p)| PendingEntry {
                id: *id,
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .filter(|p| p.idle >= min_idle)
            .take(count)
            .collect())
    }

    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.inner.state.lock();
        let stream = state.stream_mut(key, group)?;
        let now = Instant::now();

        let mut claimed_ids = Vec::new();
        let group_state = stream.group_mut(key, group)?;
        for id in ids {
            if let Some(pending) = group_state.pending.get_mut(id) {
                if now.saturating_duration_since(pending.delivered_at) >= min_idle {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.delivery_count += 1;
                    claimed_ids.push(*id);
                }
            }
        }

        Ok(claimed_ids
            .into_iter()
            .filter_map(|id| stream.entry(id).cloned())
            .collect())
    }

    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        let mut state = self.inner.state.lock();
        let Some(group_state) = state
            .streams
            .get_mut(key)
            .and_then(|stream| stream.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| group_state.pending.remove(id).is_some())
            .count() as u64)
    }

    async fn dedicated(&self) -> Result<Arc<dyn StreamBackend>> {
        Ok(Arc::new(self.clone()))
    }
}
