//! Stream storage backends.
//!
//! `StreamBackend` is the log primitive the event store and consumer are built
//! on: ordered append, range reads from an offset, tailing reads, and consumer
//! groups with pending-entry claim and acknowledgement.
//!
//! Implementations:
//! - `MemoryStreamBackend`: in-process log (tests, single-process deployments)
//! - `RedisStreamBackend`: Redis Streams (feature `redis`)

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::codec::WireRecord;
use crate::config::{StorageConfig, StorageType};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStreamBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamBackend;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur during backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Stream does not exist: {0}")]
    NoSuchKey(String),

    #[error("Consumer group {group} does not exist on {key}")]
    NoGroup { key: String, group: String },

    #[error("Consumer group {group} already exists on {key}")]
    GroupExists { key: String, group: String },

    #[error("Invalid entry id: {0}")]
    InvalidEntryId(String),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(::redis::RedisError),
}

/// Position of an entry within a stream (`<millis>-<seq>`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// Sorts before every real entry; reading after it starts at the beginning.
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BackendError::InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub record: WireRecord,
}

/// A delivered-but-unacknowledged entry of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Outcome of a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Records were written; `version` is the last version now persisted.
    Appended { version: i64 },
    /// The aggregate stream's last version was not the expected one.
    Conflict { actual: i64 },
}

/// Interface to an append-only stream log with consumer groups.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// True if the stream has been created.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Append one record, creating the stream if needed.
    async fn append(&self, key: &str, record: &WireRecord) -> Result<EntryId>;

    /// Atomically append `records` to both the aggregate stream and the global
    /// stream, provided the last genuine version in `stream_key` equals
    /// `expected_version` (`-1` for a missing or empty stream).
    async fn append_if_version(
        &self,
        stream_key: &str,
        global_key: &str,
        expected_version: i64,
        records: &[WireRecord],
    ) -> Result<AppendOutcome>;

    /// Read up to `count` entries in order, strictly after `after`
    /// (`None` reads from the beginning). Missing streams read as empty.
    async fn range(&self, key: &str, after: Option<EntryId>, count: usize)
        -> Result<Vec<StreamEntry>>;

    /// Read up to `count` entries strictly after `after`, waiting at most
    /// `block` for one to arrive if there are none yet.
    async fn read_after(
        &self,
        key: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Create a consumer group positioned at the current end of the stream.
    ///
    /// Fails with `NoSuchKey` if the stream does not exist and with
    /// `GroupExists` if the group was already created.
    async fn create_group(&self, key: &str, group: &str) -> Result<()>;

    /// Remove a consumer group and its pending entries. Returns false if the
    /// group did not exist.
    async fn destroy_group(&self, key: &str, group: &str) -> Result<bool>;

    /// Deliver up to `count` entries the group has not yet seen to `consumer`,
    /// marking them pending. Waits at most `block` when there are none.
    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Number of pending entries in the group.
    async fn pending_count(&self, key: &str, group: &str) -> Result<u64>;

    /// Up to `count` pending entries of the group idle for at least
    /// `min_idle`, oldest first. Entries idle for less are skipped before
    /// the count applies.
    async fn pending_entries(
        &self,
        key: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer` and
    /// return them. Entries that are not idle long enough are skipped.
    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge entries; returns how many were pending.
    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64>;

    /// A handle for long blocking reads that does not stall other callers.
    async fn dedicated(&self) -> Result<Arc<dyn StreamBackend>>;
}

/// Initialize the stream backend based on configuration.
pub async fn init_backend(config: &StorageConfig) -> Result<Arc<dyn StreamBackend>> {
    match config.storage_type {
        StorageType::Memory => {
            info!("Storage: in-memory stream log");
            Ok(Arc::new(MemoryStreamBackend::new()))
        }
        #[cfg(feature = "redis")]
        StorageType::Redis => {
            let backend = RedisStreamBackend::connect(&config.redis).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "redis"))]
        StorageType::Redis => {
            tracing::error!("Redis storage requested but 'redis' feature is not enabled");
            Err(BackendError::Connection(
                "Redis feature not enabled".to_string(),
            ))
        }
    }
}
