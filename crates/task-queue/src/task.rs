//! Task model
//!
//! A [`Task`] is an internal unit of work, distinct from the event that
//! triggered it. Its id stays stable across retries; only the worker
//! currently holding a task mutates it. Tasks serialize to JSON so the
//! ready set survives a graceful shutdown via the holding stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Scheduling priority, lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
}

/// Backoff curve shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Per-task retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Final attempt number; a retryable failure on this attempt kills the
    /// task
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiply the delay by a uniform factor in `[0.5, 1.5)`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// An internal unit of work owned by the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable across retries
    pub id: Uuid,

    /// Routes to the registered handler
    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque payload handed to the handler
    pub payload: Map<String, Value>,

    pub priority: TaskPriority,

    /// Current attempt, starting at 1
    pub attempt: u32,

    pub retry: RetryConfig,

    pub enqueued_at: DateTime<Utc>,

    /// Not eligible to run before this instant
    pub not_before: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Suppresses concurrent duplicates of the same logical task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,

    pub state: TaskState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Request to enqueue a task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub dedup_key: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::default(),
            user_id: None,
            dedup_key: None,
            retry: None,
            not_before: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_dedup_key(mut self, dedup_key: impl Into<String>) -> Self {
        self.dedup_key = Some(dedup_key.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    /// Materialize into a fresh [`Task`].
    pub(crate) fn into_task(self, default_retry: &RetryConfig) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            task_type: self.task_type,
            payload: self.payload,
            priority: self.priority,
            attempt: 1,
            retry: self.retry.unwrap_or_else(|| default_retry.clone()),
            enqueued_at: now,
            not_before: self.not_before.unwrap_or(now),
            user_id: self.user_id,
            dedup_key: self.dedup_key,
            state: TaskState::Queued,
            last_error: None,
        }
    }
}

/// Ready-set ordering: priority desc, then `not_before` asc, then
/// `enqueued_at` asc. Wraps a [`Task`] for the max-heap.
#[derive(Debug)]
pub(crate) struct ReadyTask(pub Task);

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ReadyTask {}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.not_before.cmp(&self.0.not_before))
            .then_with(|| other.0.enqueued_at.cmp(&self.0.enqueued_at))
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap-by-`not_before` wrapper for scheduled (delayed) tasks.
#[derive(Debug)]
pub(crate) struct ScheduledTask(pub Task);

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ScheduledTask {}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .0
            .not_before
            .cmp(&self.0.not_before)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BinaryHeap;

    fn spec(task_type: &str) -> TaskSpec {
        let mut payload = Map::new();
        payload.insert("k".to_string(), json!("v"));
        TaskSpec::new(task_type, payload)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_ready_heap_pops_highest_priority_first() {
        let mut heap = BinaryHeap::new();
        heap.push(ReadyTask(spec("a").into_task(&RetryConfig::default())));
        heap.push(ReadyTask(
            spec("b")
                .with_priority(TaskPriority::Critical)
                .into_task(&RetryConfig::default()),
        ));
        heap.push(ReadyTask(
            spec("c")
                .with_priority(TaskPriority::Low)
                .into_task(&RetryConfig::default()),
        ));

        assert_eq!(heap.pop().unwrap().0.task_type, "b");
        assert_eq!(heap.pop().unwrap().0.task_type, "a");
        assert_eq!(heap.pop().unwrap().0.task_type, "c");
    }

    #[test]
    fn test_ready_heap_fifo_within_priority() {
        let first = spec("first").into_task(&RetryConfig::default());
        let mut second = spec("second").into_task(&RetryConfig::default());
        // Force a strictly later enqueue time
        second.enqueued_at = first.enqueued_at + chrono::Duration::milliseconds(5);
        second.not_before = first.not_before;

        let mut heap = BinaryHeap::new();
        heap.push(ReadyTask(second));
        heap.push(ReadyTask(first));

        assert_eq!(heap.pop().unwrap().0.task_type, "first");
        assert_eq!(heap.pop().unwrap().0.task_type, "second");
    }

    #[test]
    fn test_scheduled_heap_pops_earliest_deadline() {
        let soon = spec("soon").into_task(&RetryConfig::default());
        let mut later = spec("later").into_task(&RetryConfig::default());
        later.not_before = soon.not_before + chrono::Duration::seconds(10);

        let mut heap = BinaryHeap::new();
        heap.push(ScheduledTask(later));
        heap.push(ScheduledTask(soon));

        assert_eq!(heap.pop().unwrap().0.task_type, "soon");
    }

    #[test]
    fn test_task_json_round_trip() {
        let task = spec("embed.asset")
            .with_dedup_key("H")
            .with_user_id("u-1")
            .into_task(&RetryConfig::default());

        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, task.id);
        assert_eq!(back.task_type, "embed.asset");
        assert_eq!(back.dedup_key.as_deref(), Some("H"));
        assert_eq!(back.attempt, 1);
        assert_eq!(back.state, TaskState::Queued);
    }
}
