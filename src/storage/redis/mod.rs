//! Redis Streams backend.
//!
//! Each aggregate stream and the global stream is a Redis stream. Appends
//! with a version check run as a Lua script so the compare and both XADDs
//! happen atomically on the server. Group reads, pending summaries, claims
//! and acknowledgements map directly onto XREADGROUP, XPENDING, XCLAIM and
//! XACK.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::{debug, info, warn};

use super::{
    AppendOutcome, BackendError, EntryId, PendingEntry, Result, StreamBackend, StreamEntry,
};
use crate::codec::WireRecord;
use crate::config::RedisConfig;
use crate::utils::retry::connection_backoff;

/// KEYS[1] aggregate stream, KEYS[2] global stream, ARGV[1] expected version,
/// ARGV[2..] JSON-encoded field maps. Returns `{1, new_version}` or
/// `{0, actual_version}`.
const APPEND_IF_VERSION: &str = r#"
local function last_version(key)
  local cursor = '+'
  while true do
    local entries = redis.call('XREVRANGE', key, cursor, '-', 'COUNT', 32)
    if #entries == 0 then
      return -1
    end
    for _, entry in ipairs(entries) do
      local fields = entry[2]
      for i = 1, #fields, 2 do
        if fields[i] == 'version' then
          local version = tonumber(fields[i + 1])
          if version then
            return version
          end
        end
      end
    end
    cursor = '(' .. entries[#entries][1]
  end
end

local expected = tonumber(ARGV[1])
local actual = last_version(KEYS[1])
if actual ~= expected then
  return {0, actual}
end

for i = 2, #ARGV do
  local record = cjson.decode(ARGV[i])
  local fields = {}
  for field, value in pairs(record) do
    fields[#fields + 1] = field
    fields[#fields + 1] = value
  end
  redis.call('XADD', KEYS[1], '*', unpack(fields))
  redis.call('XADD', KEYS[2], '*', unpack(fields))
end

return {1, expected + #ARGV - 1}
"#;

impl From<RedisError> for BackendError {
    fn from(err: RedisError) -> Self {
        BackendError::Redis(err)
    }
}

/// Map consumer-group error replies onto typed variants.
fn group_error(err: RedisError, key: &str, group: &str) -> BackendError {
    match err.code() {
        Some("NOGROUP") => BackendError::NoGroup {
            key: key.to_string(),
            group: group.to_string(),
        },
        Some("BUSYGROUP") => BackendError::GroupExists {
            key: key.to_string(),
            group: group.to_string(),
        },
        _ if err.to_string().contains("requires the key to exist") => {
            BackendError::NoSuchKey(key.to_string())
        }
        _ => BackendError::Redis(err),
    }
}

fn to_entry(stream_id: StreamId) -> Result<StreamEntry> {
    let id = stream_id.id.parse()?;
    let mut record = WireRecord::new();
    for (field, value) in stream_id.map {
        let value: String = redis::from_redis_value(&value)?;
        record.insert(field, value);
    }
    Ok(StreamEntry { id, record })
}

fn to_entries(ids: Vec<StreamId>) -> Result<Vec<StreamEntry>> {
    ids.into_iter().map(to_entry).collect()
}

fn read_reply_entries(reply: Option<StreamReadReply>) -> Result<Vec<StreamEntry>> {
    let Some(reply) = reply else {
        return Ok(Vec::new());
    };
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(to_entry)
        .collect()
}

/// BLOCK 0 waits forever in Redis; a zero duration means "do not wait".
fn read_options(count: usize, block: Duration) -> StreamReadOptions {
    let options = StreamReadOptions::default().count(count);
    if block.is_zero() {
        options
    } else {
        options.block(block.as_millis() as usize)
    }
}

fn manager_config(config: &RedisConfig) -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_connection_timeout(config.connection_timeout())
        .set_response_timeout(config.read_timeout())
}

/// Redis Streams implementation of [`StreamBackend`].
///
/// Holds a small pool of multiplexed connection managers used round-robin.
/// Blocking reads go through [`StreamBackend::dedicated`] so they never hold
/// up the shared connections.
#[derive(Clone)]
pub struct RedisStreamBackend {
    client: Client,
    pool: Arc<Vec<ConnectionManager>>,
    next: Arc<AtomicUsize>,
    connection_timeout: Duration,
    append_script: Arc<Script>,
}

impl RedisStreamBackend {
    /// Connect using the configured host, credentials and pool sizing.
    ///
    /// `min_pool_size` connections are required and retried with backoff;
    /// the rest up to `max_pool_size` are opened best-effort.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.connection_info())?;
        let (required, size) = if config.use_pooling {
            (config.min_pool_size.max(1), config.max_pool_size.max(1))
        } else {
            (1, 1)
        };

        let mut pool = Vec::with_capacity(size);
        for _ in 0..required {
            let conn = (|| async {
                ConnectionManager::new_with_config(client.clone(), manager_config(config)).await
            })
            .retry(connection_backoff())
            .notify(|err: &RedisError, dur: Duration| {
                warn!(host = %config.host, port = config.port, error = %err, delay = ?dur, "Redis connection failed, retrying");
            })
            .await?;
            pool.push(conn);
        }
        while pool.len() < size {
            match ConnectionManager::new_with_config(client.clone(), manager_config(config)).await
            {
                Ok(conn) => pool.push(conn),
                Err(e) => {
                    warn!(error = %e, pool_size = pool.len(), "Could not fill Redis connection pool");
                    break;
                }
            }
        }

        info!(
            host = %config.host,
            port = config.port,
            database = config.database,
            pool_size = pool.len(),
            "Connected to Redis"
        );

        Ok(Self {
            client,
            pool: Arc::new(pool),
            next: Arc::new(AtomicUsize::new(0)),
            connection_timeout: config.connection_timeout(),
            append_script: Arc::new(Script::new(APPEND_IF_VERSION)),
        })
    }

    fn conn(&self) -> ConnectionManager {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].clone()
    }
}

#[async_trait]
impl StreamBackend for RedisStreamBackend {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    async fn append(&self, key: &str, record: &WireRecord) -> Result<EntryId> {
        let mut conn = self.conn();
        let fields: Vec<(&str, &str)> = record.iter().collect();
        let id: String = conn.xadd(key, "*", &fields).await?;
        id.parse()
    }

    async fn append_if_version(
        &self,
        stream_key: &str,
        global_key: &str,
        expected_version: i64,
        records: &[WireRecord],
    ) -> Result<AppendOutcome> {
        let mut invocation = self.append_script.prepare_invoke();
        invocation.key(stream_key).key(global_key).arg(expected_version);
        for record in records {
            let json = serde_json::to_string(record)
                .map_err(|e| BackendError::MalformedReply(e.to_string()))?;
            invocation.arg(json);
        }

        let mut conn = self.conn();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        match reply.as_slice() {
            [1, version] => Ok(AppendOutcome::Appended { version: *version }),
            [0, actual] => {
                debug!(stream = %stream_key, expected = expected_version, actual = *actual, "Conditional append rejected");
                Ok(AppendOutcome::Conflict { actual: *actual })
            }
            other => Err(BackendError::MalformedReply(format!(
                "append script returned {other:?}"
            ))),
        }
    }

    async fn range(
        &self,
        key: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let start = match after {
            Some(id) => format!("({id}"),
            None => "-".to_string(),
        };
        let mut conn = self.conn();
        let reply: StreamRangeReply = conn.xrange_count(key, start, "+", count).await?;
        to_entries(reply.ids)
    }

    async fn read_after(
        &self,
        key: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[key], &[after.to_string()], &read_options(count, block))
            .await?;
        read_reply_entries(reply)
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .xgroup_create(key, group, "$")
            .await
            .map_err(|e| group_error(e, key, group))?;
        info!(key = %key, group = %group, "Created consumer group");
        Ok(())
    }

    async fn destroy_group(&self, key: &str, group: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: bool = match conn.xgroup_destroy(key, group).await {
            Ok(removed) => removed,
            Err(e) => match group_error(e, key, group) {
                BackendError::NoSuchKey(_) => false,
                e => return Err(e),
            },
        };
        if removed {
            info!(key = %key, group = %group, "Destroyed consumer group");
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
        let options = read_options(count, block).group(group, consumer);
        let mut conn = self.conn();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[key], &[">"], &options)
            .await
            .map_err(|e| group_error(e, key, group))?;
        read_reply_entries(reply)
    }

    async fn pending_count(&self, key: &str, group: &str) -> Result<u64> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = conn
            .xpending(key, group)
            .await
            .map_err(|e| group_error(e, key, group))?;
        Ok(reply.count() as u64)
    }

    async fn pending_entries(
        &self,
        key: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn();
        // IDLE filters server side, before COUNT applies (Redis 6.2+).
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(key)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(e, key, group))?;
        reply
            .ids
            .into_iter()
            .map(|p| {
                Ok(PendingEntry {
                    id: p.id.parse()?,
                    consumer: p.consumer,
                    idle: Duration::from_millis(p.last_delivered_ms as u64),
                    delivery_count: p.times_delivered as u64,
                })
            })
            .collect()
    }

    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut conn = self.conn();
        let reply: StreamClaimReply = conn
            .xclaim(key, group, consumer, min_idle.as_millis() as u64, &ids)
            .await
            .map_err(|e| group_error(e, key, group))?;
        to_entries(reply.ids)
    }

    async fn ack(&self, key: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut conn = self.conn();
        Ok(conn.xack(key, group, &ids).await?)
    }

    async fn dedicated(&self) -> Result<Arc<dyn StreamBackend>> {
        let config = ConnectionManagerConfig::new().set_connection_timeout(self.connection_timeout);
        let conn = ConnectionManager::new_with_config(self.client.clone(), config).await?;
        Ok(Arc::new(Self {
            client: self.client.clone(),
            pool: Arc::new(vec![conn]),
            next: Arc::new(AtomicUsize::new(0)),
            connection_timeout: self.connection_timeout,
            append_script: Arc::clone(&self.append_script),
        }))
    }
}
