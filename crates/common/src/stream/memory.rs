/*!
 * In-memory stream backend
 *
 * A [`StreamBackend`] that lives entirely in process memory while honoring
 * the consumer-group contract of the Redis implementation: pending entry
 * lists per group, per-entry delivery counters, idle clocks and claims.
 *
 * Used by unit tests of the bus and the task queue, and handy for local
 * development without a Redis instance. Not durable, not for production.
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::stream::{
    parse_entry_id, GroupInfo, GroupStart, PendingEntry, PendingSummary, StreamBackend,
    StreamEntry, StreamInfo,
};

#[derive(Debug, Clone)]
struct MemoryEntry {
    id: String,
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct PelItem {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct MemoryGroup {
    last_delivered_id: String,
    pending: HashMap<String, PelItem>,
}

#[derive(Debug, Default)]
struct MemoryStream {
    entries: Vec<MemoryEntry>,
    last_ms: u64,
    last_seq: u64,
    groups: HashMap<String, MemoryGroup>,
}

impl MemoryStream {
    fn next_id(&mut self) -> String {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        if now_ms > self.last_ms {
            self.last_ms = now_ms;
            self.last_seq = 0;
        } else {
            self.last_seq += 1;
        }
        format!("{}-{}", self.last_ms, self.last_seq)
    }

    fn last_entry_id(&self) -> String {
        self.entries
            .last()
            .map(|e| e.id.clone())
            .unwrap_or_else(|| "0-0".to_string())
    }
}

/// Compare two concrete entry ids numerically (`ms` first, then `seq`).
fn id_less_than(a: &str, b: &str) -> bool {
    match (parse_entry_id(a), parse_entry_id(b)) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    }
}

/// Resolve an XRANGE bound into a concrete `(ms, seq)` pair.
fn range_bound(bound: &str, is_start: bool) -> (u64, u64) {
    match bound {
        "-" => (0, 0),
        "+" => (u64::MAX, u64::MAX),
        other => parse_entry_id(other).unwrap_or(if is_start {
            (0, 0)
        } else {
            (u64::MAX, u64::MAX)
        }),
    }
}

/// In-process [`StreamBackend`] with real PEL semantics.
#[derive(Clone, Default)]
pub struct MemoryStreamClient {
    streams: Arc<Mutex<HashMap<String, MemoryStream>>>,
    appended: Arc<Notify>,
}

impl MemoryStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_group<T>(
        &self,
        stream: &str,
        group: &str,
        f: impl FnOnce(&mut MemoryStream, &str) -> T,
    ) -> Result<T> {
        let mut streams = self.streams.lock().expect("stream table poisoned");
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Error::Internal(anyhow!("NOGROUP no such stream '{stream}'")))?;
        if !s.groups.contains_key(group) {
            return Err(Error::Internal(anyhow!(
                "NOGROUP no such consumer group '{group}' for stream '{stream}'"
            )));
        }
        Ok(f(s, group))
    }
}

#[async_trait]
impl StreamBackend for MemoryStreamClient {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        maxlen: usize,
    ) -> Result<String> {
        let id = {
            let mut streams = self.streams.lock().expect("stream table poisoned");
            let s = streams.entry(stream.to_string()).or_default();
            let id = s.next_id();
            s.entries.push(MemoryEntry {
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
            if s.entries.len() > maxlen {
                let excess = s.entries.len() - maxlen;
                s.entries.drain(0..excess);
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: GroupStart) -> Result<()> {
        let mut streams = self.streams.lock().expect("stream table poisoned");
        let s = streams.entry(stream.to_string()).or_default();
        if !s.groups.contains_key(group) {
            let last_delivered_id = match start {
                GroupStart::Beginning => "0-0".to_string(),
                GroupStart::NewOnly => s.last_entry_id(),
            };
            s.groups.insert(
                group.to_string(),
                MemoryGroup {
                    last_delivered_id,
                    pending: HashMap::new(),
                },
            );
        }
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);

        loop {
            let batch = self.with_group(stream, group, |s, group| {
                let g = s.groups.get_mut(group).expect("group checked");
                let mut out = Vec::new();
                for entry in &s.entries {
                    if out.len() >= count {
                        break;
                    }
                    if id_less_than(&g.last_delivered_id, &entry.id) {
                        g.last_delivered_id = entry.id.clone();
                        g.pending.insert(
                            entry.id.clone(),
                            PelItem {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                        out.push(StreamEntry {
                            id: entry.id.clone(),
                            fields: entry.fields.clone(),
                        });
                    }
                }
                out
            })?;

            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Park until something is appended or the block window elapses
            let _ = tokio::time::timeout(deadline - now, self.appended.notified()).await;
        }
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.with_group(stream, group, |s, group| {
            let g = s.groups.get_mut(group).expect("group checked");
            let mut ids: Vec<String> = g
                .pending
                .iter()
                .filter(|(_, item)| item.consumer == consumer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort_by(|a, b| parse_entry_id(a).cmp(&parse_entry_id(b)));
            ids.truncate(count);

            let mut out = Vec::new();
            for id in ids {
                match s.entries.iter().find(|e| e.id == id) {
                    Some(entry) => {
                        let item = g.pending.get_mut(&id).expect("pending checked");
                        item.delivery_count += 1;
                        item.delivered_at = Instant::now();
                        out.push(StreamEntry {
                            id: entry.id.clone(),
                            fields: entry.fields.clone(),
                        });
                    }
                    // Trimmed out from under the PEL
                    None => {
                        g.pending.remove(&id);
                    }
                }
            }
            out
        })
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        self.with_group(stream, group, |s, group| {
            let g = s.groups.get_mut(group).expect("group checked");
            ids.iter().filter(|id| g.pending.remove(*id).is_some()).count()
        })
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> Result<PendingSummary> {
        self.with_group(stream, group, |s, group| {
            let g = &s.groups[group];
            let mut ids: Vec<&String> = g.pending.keys().collect();
            ids.sort_by(|a, b| parse_entry_id(a).cmp(&parse_entry_id(b)));

            let mut per_consumer: HashMap<String, usize> = HashMap::new();
            for item in g.pending.values() {
                *per_consumer.entry(item.consumer.clone()).or_default() += 1;
            }

            PendingSummary {
                total: g.pending.len(),
                min_id: ids.first().map(|id| (*id).clone()),
                max_id: ids.last().map(|id| (*id).clone()),
                per_consumer,
            }
        })
    }

    async fn pending_detail(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        self.with_group(stream, group, |s, group| {
            let g = &s.groups[group];
            let mut out: Vec<PendingEntry> = g
                .pending
                .iter()
                .map(|(id, item)| PendingEntry {
                    id: id.clone(),
                    consumer: item.consumer.clone(),
                    idle_ms: item.delivered_at.elapsed().as_millis() as u64,
                    delivery_count: item.delivery_count,
                })
                .collect();
            out.sort_by(|a, b| parse_entry_id(&a.id).cmp(&parse_entry_id(&b.id)));
            out.truncate(count);
            out
        })
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>> {
        self.with_group(stream, group, |s, group| {
            let g = s.groups.get_mut(group).expect("group checked");
            let mut out = Vec::new();
            for id in ids {
                let Some(item) = g.pending.get_mut(id) else {
                    continue;
                };
                if (item.delivered_at.elapsed().as_millis() as u64) < min_idle_ms {
                    continue;
                }
                match s.entries.iter().find(|e| &e.id == id) {
                    Some(entry) => {
                        item.consumer = new_consumer.to_string();
                        item.delivered_at = Instant::now();
                        item.delivery_count += 1;
                        out.push(StreamEntry {
                            id: entry.id.clone(),
                            fields: entry.fields.clone(),
                        });
                    }
                    // Entry trimmed away; claiming it just clears the PEL slot
                    None => {
                        g.pending.remove(id);
                    }
                }
            }
            out
        })
    }

    async fn trim(&self, stream: &str, maxlen: usize) -> Result<usize> {
        let mut streams = self.streams.lock().expect("stream table poisoned");
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };
        if s.entries.len() <= maxlen {
            return Ok(0);
        }
        let excess = s.entries.len() - maxlen;
        s.entries.drain(0..excess);
        Ok(excess)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let streams = self.streams.lock().expect("stream table poisoned");
        Ok(match streams.get(stream) {
            Some(s) => StreamInfo {
                name: stream.to_string(),
                length: s.entries.len(),
                first_id: s.entries.first().map(|e| e.id.clone()),
                last_id: s.entries.last().map(|e| e.id.clone()),
                groups: s.groups.len(),
            },
            None => StreamInfo {
                name: stream.to_string(),
                length: 0,
                first_id: None,
                last_id: None,
                groups: 0,
            },
        })
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>> {
        let streams = self.streams.lock().expect("stream table poisoned");
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<GroupInfo> = s
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: {
                    let mut consumers: Vec<&str> =
                        g.pending.values().map(|i| i.consumer.as_str()).collect();
                    consumers.sort_unstable();
                    consumers.dedup();
                    consumers.len()
                },
                pending: g.pending.len(),
                last_delivered_id: g.last_delivered_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let streams = self.streams.lock().expect("stream table poisoned");
        let Some(s) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let lo = range_bound(start, true);
        let hi = range_bound(end, false);
        Ok(s.entries
            .iter()
            .filter(|e| {
                parse_entry_id(&e.id)
                    .map(|id| id >= lo && id <= hi)
                    .unwrap_or(false)
            })
            .take(count)
            .map(|e| StreamEntry {
                id: e.id.clone(),
                fields: e.fields.clone(),
            })
            .collect())
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<usize> {
        let mut streams = self.streams.lock().expect("stream table poisoned");
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = s.entries.len();
        s.entries.retain(|e| !ids.contains(&e.id));
        Ok(before - s.entries.len())
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        let streams = self.streams.lock().expect("stream table poisoned");
        Ok(streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }
}
