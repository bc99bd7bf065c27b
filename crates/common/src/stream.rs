/*!
 * Stream Backend
 *
 * Thin abstraction over the Redis Streams primitives used by the event bus
 * and the task queue. Everything a consumer group needs goes through the
 * [`StreamBackend`] trait:
 *
 * ```text
 * Producer                      Redis                       Consumers
 * ────────                      ─────                       ─────────
 *    │                            │                              │
 *    ├─ append ──────────────────>│  XADD <stream> MAXLEN ~ N *  │
 *    │                            │                              │
 *    │                            │<──────────────── read_group ─┤
 *    │                            │  XREADGROUP GROUP g c        │
 *    │                            │    BLOCK ms COUNT n          │
 *    │                            │    STREAMS <stream> >        │
 *    │                            │                              │
 *    │                            │<────────────────────── ack ──┤
 *    │                            │  XACK <stream> g id          │
 * ```
 *
 * Two implementations exist: [`RedisStreamClient`] for production and
 * [`memory::MemoryStreamClient`] for unit tests and local development.
 *
 * ## Failure semantics
 *
 * Network-level failures are retried here with a short, bounded exponential
 * backoff. This retry is independent of event-delivery retries: once the
 * backend stays unreachable past the last attempt, the call surfaces
 * [`Error::BackendUnavailable`] and the caller decides what to do with the
 * in-flight message (consumers transition to `disconnected`, publishers get
 * the error synchronously).
 */

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamInfoStreamReply, StreamMaxlen,
    StreamPendingCountReply, StreamPendingReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Attempts per backend call before giving up
const MAX_BACKEND_ATTEMPTS: u32 = 3;

/// Base delay between backend retries
const BACKEND_RETRY_BASE: Duration = Duration::from_millis(100);

/// One entry as read from a stream: the backend-assigned id plus the flat
/// field map (the wire form of an envelope or task record).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Everything currently in the stream (`0`)
    Beginning,
    /// Only entries appended after group creation (`$`)
    NewOnly,
}

impl GroupStart {
    fn as_arg(self) -> &'static str {
        match self {
            GroupStart::Beginning => "0",
            GroupStart::NewOnly => "$",
        }
    }
}

/// XPENDING summary for a whole group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub total: usize,
    pub min_id: Option<String>,
    pub max_id: Option<String>,
    pub per_consumer: HashMap<String, usize>,
}

/// One entry of the pending entry list, with delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// XINFO STREAM condensed to what the admin surface exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub name: String,
    pub length: usize,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub groups: usize,
}

/// One row of XINFO GROUPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    pub last_delivered_id: String,
}

/// The stream primitives the bus and the task queue are written against.
///
/// Kept deliberately minimal: no connection details, no envelope knowledge,
/// flat string maps in and out. The in-memory implementation in
/// [`memory`] honors the same consumer-group semantics (PEL, delivery
/// counters, idle clocks) so the dispatch logic can be tested without Redis.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    /// Liveness check against the backend.
    async fn ping(&self) -> Result<()>;

    /// Append an entry, trimming the stream to roughly `maxlen` entries.
    /// Returns the backend-assigned entry id.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String>;

    /// Create the consumer group if it does not exist. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str, start: GroupStart) -> Result<()>;

    /// Blocking group read of new entries (`>`). Returns an empty batch on
    /// block timeout.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;

    /// Re-deliver entries already assigned to `consumer` but not yet ACKed.
    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge entries. Returns how many were actually removed from the
    /// pending entry list.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize>;

    /// Group-wide pending summary (XPENDING without a range).
    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary>;

    /// Per-entry pending detail: owner, idle time, delivery count.
    async fn pending_detail(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Transfer ownership of pending entries idle for at least `min_idle_ms`
    /// to `new_consumer`. Returns the claimed entries with their bodies.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>>;

    /// Approximate MAXLEN trim. Returns the number of evicted entries.
    async fn trim(&self, stream: &str, maxlen: usize) -> Result<usize>;

    /// XINFO STREAM. A missing stream reports zero length, not an error.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo>;

    /// XINFO GROUPS. A missing stream reports no groups.
    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>>;

    /// XRANGE with a count bound. `start`/`end` accept `-` and `+`.
    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// XDEL. Returns how many entries were removed.
    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize>;

    /// XLEN.
    async fn len(&self, stream: &str) -> Result<usize>;
}

/// Production [`StreamBackend`] over a shared auto-reconnecting Redis
/// connection manager.
pub struct RedisStreamClient {
    manager: ConnectionManager,
}

impl RedisStreamClient {
    /// Connect to Redis. Fails fast if the initial connection cannot be
    /// established; reconnects after that are handled by the manager.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis stream backend");

        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;

        info!("✅ Redis stream backend connected");
        Ok(Self { manager })
    }

    /// Run one backend call with bounded retry on transient network errors.
    async fn retrying<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let mut delay = BACKEND_RETRY_BASE;

        for attempt in 1..=MAX_BACKEND_ATTEMPTS {
            match call(self.manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if attempt == MAX_BACKEND_ATTEMPTS {
                        warn!(op, attempts = attempt, error = %e, "Backend unreachable, giving up");
                        return Err(Error::BackendUnavailable(format!("{op}: {e}")));
                    }
                    let jitter = rand::thread_rng().gen_range(0.8..1.2);
                    let sleep_for = delay.mul_f64(jitter);
                    debug!(op, attempt, error = %e, "Transient backend error, retrying in {:?}", sleep_for);
                    tokio::time::sleep(sleep_for).await;
                    delay *= 2;
                }
                Err(e) => return Err(Error::Redis(e)),
            }
        }

        unreachable!("retry loop returns on the last attempt")
    }
}

/// Network-level failures worth retrying; server replies are not.
fn is_transient(e: &RedisError) -> bool {
    e.is_io_error()
        || e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || matches!(e.kind(), ErrorKind::BusyLoadingError | ErrorKind::TryAgain)
}

/// Convert a typed stream reply entry into the flat string map the rest of
/// the system works with. Non-string field values are skipped.
fn entry_from_stream_id(id: &StreamId) -> StreamEntry {
    let mut fields = HashMap::with_capacity(id.map.len());
    for (key, value) in &id.map {
        match value {
            redis::Value::BulkString(bytes) => {
                fields.insert(key.clone(), String::from_utf8_lossy(bytes).into_owned());
            }
            redis::Value::SimpleString(s) => {
                fields.insert(key.clone(), s.clone());
            }
            redis::Value::Int(n) => {
                fields.insert(key.clone(), n.to_string());
            }
            _ => {}
        }
    }
    StreamEntry {
        id: id.id.clone(),
        fields,
    }
}

fn entries_from_read_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
    let mut entries = Vec::new();
    for key in reply.keys {
        for id in &key.ids {
            entries.push(entry_from_stream_id(id));
        }
    }
    entries
}

/// "no such key" style replies for introspection of absent streams
fn is_missing_stream(e: &RedisError) -> bool {
    let text = e.to_string();
    text.contains("no such key") || text.contains("NOGROUP")
}

#[async_trait]
impl StreamBackend for RedisStreamClient {
    async fn ping(&self) -> Result<()> {
        let _pong: String = self
            .retrying("PING", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String> {
        self.retrying("XADD", |mut conn| async move {
            conn.xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", fields)
                .await
        })
        .await
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: GroupStart) -> Result<()> {
        // XGROUP CREATE <stream> <group> <start> MKSTREAM
        let result: Result<String> = self
            .retrying("XGROUP CREATE", |mut conn| async move {
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream)
                    .arg(group)
                    .arg(start.as_arg())
                    .arg("MKSTREAM")
                    .query_async(&mut conn)
                    .await
            })
            .await;

        match result {
            Ok(_) => {
                info!("✅ Created consumer group '{}' for stream '{}'", group, stream);
                Ok(())
            }
            // BUSYGROUP means the group already exists, which is fine
            Err(Error::Redis(e)) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group '{}' already exists for stream '{}'", group, stream);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let reply: Option<StreamReadReply> = self
            .retrying("XREADGROUP", |mut conn| async move {
                let opts = StreamReadOptions::default()
                    .group(group, consumer)
                    .count(count)
                    .block(block_ms as usize);
                conn.xread_options(&[stream], &[">"], &opts).await
            })
            .await?;

        Ok(reply.map(entries_from_read_reply).unwrap_or_default())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        // "0" instead of ">" re-delivers this consumer's PEL
        let reply: Option<StreamReadReply> = self
            .retrying("XREADGROUP(0)", |mut conn| async move {
                let opts = StreamReadOptions::default()
                    .group(group, consumer)
                    .count(count);
                conn.xread_options(&[stream], &["0"], &opts).await
            })
            .await?;

        Ok(reply.map(entries_from_read_reply).unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.retrying("XACK", |mut conn| async move {
            conn.xack(stream, group, ids).await
        })
        .await
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary> {
        let reply: StreamPendingReply = self
            .retrying("XPENDING", |mut conn| async move {
                conn.xpending(stream, group).await
            })
            .await?;

        Ok(match reply {
            StreamPendingReply::Empty => PendingSummary::default(),
            StreamPendingReply::Data(data) => PendingSummary {
                total: data.count,
                min_id: Some(data.start_id),
                max_id: Some(data.end_id),
                per_consumer: data
                    .consumers
                    .into_iter()
                    .map(|c| (c.name, c.pending))
                    .collect(),
            },
        })
    }

    async fn pending_detail(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let reply: StreamPendingCountReply = self
            .retrying("XPENDING(range)", |mut conn| async move {
                conn.xpending_count(stream, group, "-", "+", count).await
            })
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply: StreamClaimReply = self
            .retrying("XCLAIM", |mut conn| async move {
                conn.xclaim(stream, group, new_consumer, min_idle_ms as usize, ids)
                    .await
            })
            .await?;

        Ok(reply.ids.iter().map(entry_from_stream_id).collect())
    }

    async fn trim(&self, stream: &str, maxlen: usize) -> Result<usize> {
        self.retrying("XTRIM", |mut conn| async move {
            conn.xtrim(stream, StreamMaxlen::Approx(maxlen)).await
        })
        .await
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let result: Result<StreamInfoStreamReply> = self
            .retrying("XINFO STREAM", |mut conn| async move {
                conn.xinfo_stream(stream).await
            })
            .await;

        match result {
            Ok(info) => Ok(StreamInfo {
                name: stream.to_string(),
                length: info.length,
                first_id: Some(info.first_entry.id.clone()).filter(|id| !id.is_empty()),
                last_id: Some(info.last_entry.id.clone()).filter(|id| !id.is_empty()),
                groups: info.groups,
            }),
            Err(Error::Redis(e)) if is_missing_stream(&e) => Ok(StreamInfo {
                name: stream.to_string(),
                length: 0,
                first_id: None,
                last_id: None,
                groups: 0,
            }),
            Err(e) => Err(e),
        }
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let result: Result<StreamInfoGroupsReply> = self
            .retrying("XINFO GROUPS", |mut conn| async move {
                conn.xinfo_groups(stream).await
            })
            .await;

        match result {
            Ok(reply) => Ok(reply
                .groups
                .into_iter()
                .map(|g| GroupInfo {
                    name: g.name,
                    consumers: g.consumers,
                    pending: g.pending,
                    last_delivered_id: g.last_delivered_id,
                })
                .collect()),
            Err(Error::Redis(e)) if is_missing_stream(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let reply: StreamRangeReply = self
            .retrying("XRANGE", |mut conn| async move {
                conn.xrange_count(stream, start, end, count).await
            })
            .await?;

        Ok(reply.ids.iter().map(entry_from_stream_id).collect())
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.retrying("XDEL", |mut conn| async move {
            conn.xdel(stream, ids).await
        })
        .await
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        self.retrying("XLEN", |mut conn| async move { conn.xlen(stream).await })
            .await
    }
}

/// Split a stream entry id (`<ms>-<seq>`) into its numeric parts.
/// Returns `None` for special ids like `-`, `+` or `$`.
pub fn parse_entry_id(id: &str) -> Option<(u64, u64)> {
    let (ms, seq) = id.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

/// Milliseconds-since-epoch encoded in an entry id, used to derive entry age.
pub fn entry_timestamp_ms(id: &str) -> Option<u64> {
    parse_entry_id(id).map(|(ms, _)| ms)
}
