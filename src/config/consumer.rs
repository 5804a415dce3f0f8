//! Stream naming and consumer-group configuration.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

/// Stream key layout and read sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Prefix for every stream key, including the global one.
    pub stream_prefix: String,
    /// Name of the global stream (appended to `stream_prefix`).
    pub all_events_stream: String,
    /// Page size for range reads and subscription polls.
    pub read_batch_size: usize,
    /// How long a subscription read waits for new entries.
    pub subscription_block_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "event-stream:".to_string(),
            all_events_stream: "all-events".to_string(),
            read_batch_size: 100,
            subscription_block_ms: 100,
        }
    }
}

impl StreamConfig {
    pub fn subscription_block(&self) -> Duration {
        Duration::from_millis(self.subscription_block_ms)
    }
}

/// When a consumer acknowledges a dispatched record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge after dispatch, even if a handler failed.
    #[default]
    Always,
    /// Acknowledge only when every handler succeeded; failures stay pending
    /// and are picked up again through idle claiming.
    OnSuccess,
}

/// Consumer-group settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub consumer_group: String,
    pub consumer_name: String,
    /// Pending entries idle longer than this may be claimed.
    pub claim_idle_timeout_ms: u64,
    /// Delay between polls.
    pub poll_interval_ms: u64,
    /// Upper bound on a single blocking group read.
    pub poll_timeout_ms: u64,
    pub max_batch_size: usize,
    /// Seed the global stream and create the group on `init()`.
    pub create_consumer_group: bool,
    pub ack_policy: AckPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "event-processors".to_string(),
            consumer_name: "event-consumer".to_string(),
            claim_idle_timeout_ms: 60_000,
            poll_interval_ms: 100,
            poll_timeout_ms: 100,
            max_batch_size: 100,
            create_consumer_group: true,
            ack_policy: AckPolicy::Always,
        }
    }
}

impl ConsumerConfig {
    pub fn claim_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Settings for a read-only observer of the stream.
    ///
    /// The observer joins a fresh group named after this one, so it sees
    /// every new entry without taking any away from this group's members.
    pub fn observer(&self) -> Self {
        Self {
            consumer_group: format!("{}-tail-{}", self.consumer_group, Uuid::new_v4().simple()),
            create_consumer_group: true,
            ack_policy: AckPolicy::Always,
            ..self.clone()
        }
    }
}
