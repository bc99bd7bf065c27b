/*!
 * Task Queue
 *
 * Priority scheduler with a fixed worker pool. Two heaps back the queue:
 * the ready set (priority desc, enqueue order asc) holds tasks eligible to
 * run now; the scheduled set (ordered by `not_before`) holds delayed tasks
 * and retries waiting out their backoff. Workers promote due tasks from
 * scheduled to ready before popping.
 *
 * Both heaps live behind one mutex with O(log n) hold times; handlers never
 * touch it. Bounded concurrency falls out of the pool size: `max_concurrent`
 * workers each run at most one handler.
 *
 * On `stop(grace)` the queue stops accepting work, lets running handlers
 * finish (force-cancelling past the grace period) and appends the remaining
 * ready set to a holding stream; the next `start()` replays it.
 */

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use beacon_common::stream::StreamBackend;
use beacon_common::{Error, Result};

use crate::handler::{TaskHandler, TaskOutcome};
use crate::metrics;
use crate::retry::backoff;
use crate::task::{ReadyTask, RetryConfig, ScheduledTask, Task, TaskSpec, TaskState};

/// Fallback worker park time when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Entries replayed from the holding stream per start
const HOLDING_REPLAY_LIMIT: usize = 10_000;

/// Queue tuning, lifted from the `tasks` config section.
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Worker pool size: the bound on simultaneously running handlers
    pub max_concurrent: usize,
    /// Backpressure bound on queued + running tasks
    pub max_queued: usize,
    /// Retry policy for tasks that do not carry their own
    pub default_retry: RetryConfig,
    /// Handler timeout when the handler has no per-type override
    pub handler_timeout: Duration,
    /// Stats/gauge tick cadence
    pub health_check_interval: Duration,
    /// How long dead tasks stay visible in stats
    pub dead_letter_retention: Duration,
    /// Ready-set spill target on graceful shutdown
    pub holding_stream: String,
    /// Visibility stream for dead tasks
    pub dead_stream: String,
    /// MAXLEN cap for the streams above
    pub stream_max_length: usize,
}

impl TaskQueueConfig {
    pub fn from_config(config: &beacon_config::Config) -> Self {
        Self {
            max_concurrent: config.tasks.max_concurrent,
            max_queued: config.tasks.max_queued,
            default_retry: RetryConfig {
                max_attempts: config.tasks.default_max_attempts,
                base_delay_ms: config.tasks.default_base_delay_ms,
                max_delay_ms: config.tasks.default_max_delay_ms,
                ..RetryConfig::default()
            },
            handler_timeout: Duration::from_millis(config.tasks.handler_timeout_ms),
            health_check_interval: Duration::from_millis(config.tasks.health_check_interval_ms),
            dead_letter_retention: Duration::from_millis(config.tasks.dead_letter_retention_ms),
            holding_stream: config.tasks.holding_stream.clone(),
            dead_stream: format!("{}.dead", config.tasks.holding_stream),
            stream_max_length: config.streams.max_length,
        }
    }
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queued: 100,
            default_retry: RetryConfig::default(),
            handler_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            dead_letter_retention: Duration::from_secs(3_600),
            holding_stream: "beacon.tasks.holding".to_string(),
            dead_stream: "beacon.tasks.holding.dead".to_string(),
            stream_max_length: 100_000,
        }
    }
}

/// Result of [`TaskQueue::queue_task`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueOutcome {
    pub id: Uuid,
    /// True when an unfinished task with the same dedup key already existed;
    /// `id` is that task's id and nothing new was enqueued.
    pub deduplicated: bool,
}

/// Per-type counters exposed in stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

/// Queue-wide statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub running: usize,
    pub queued: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub dead_total: u64,
    pub avg_latency_ms: f64,
    pub per_type: HashMap<String, TypeStats>,
}

#[derive(Default)]
struct StatsCounters {
    completed_total: u64,
    failed_total: u64,
    dead_total: u64,
    total_exec_ms: u64,
    per_type: HashMap<String, TypeStats>,
}

struct Inner {
    ready: BinaryHeap<ReadyTask>,
    scheduled: BinaryHeap<ScheduledTask>,
    /// dedup key -> unfinished task id
    dedup: HashMap<String, Uuid>,
    /// running task id -> task type
    running: HashMap<Uuid, String>,
    /// terminal dead tasks retained for visibility
    dead: VecDeque<(Instant, Task)>,
    accepting: bool,
    stats: StatsCounters,
}

impl Inner {
    fn depth(&self) -> usize {
        self.ready.len() + self.scheduled.len()
    }

    fn release_dedup(&mut self, task: &Task) {
        if let Some(key) = &task.dedup_key {
            if self.dedup.get(key) == Some(&task.id) {
                self.dedup.remove(key);
            }
        }
    }

    fn prune_dead(&mut self, retention: Duration) {
        while let Some((at, _)) = self.dead.front() {
            if at.elapsed() > retention {
                self.dead.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Bounded-concurrency scheduler over typed tasks.
pub struct TaskQueue {
    config: TaskQueueConfig,
    backend: Arc<dyn StreamBackend>,
    handlers: Mutex<HashMap<String, Arc<dyn TaskHandler>>>,
    started: AtomicBool,
    inner: Mutex<Inner>,
    wake: Notify,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn StreamBackend>, config: TaskQueueConfig) -> Self {
        Self {
            config,
            backend,
            handlers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                ready: BinaryHeap::new(),
                scheduled: BinaryHeap::new(),
                dedup: HashMap::new(),
                running: HashMap::new(),
                dead: VecDeque::new(),
                accepting: true,
                stats: StatsCounters::default(),
            }),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Register the handler for one task type. Registration closes when the
    /// queue starts.
    pub fn register_handler(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(Error::Config(
                "handler registration is closed once the queue has started".to_string(),
            ));
        }
        let task_type = task_type.into();
        let mut handlers = self.handlers.lock().expect("handler table poisoned");
        if handlers.contains_key(&task_type) {
            return Err(Error::Config(format!(
                "task type '{task_type}' already has a handler"
            )));
        }
        handlers.insert(task_type, handler);
        Ok(())
    }

    /// Create and enqueue a task. Respects `dedup_key`: while a task with
    /// the same key is queued or running, the existing id comes back with
    /// `deduplicated: true` and nothing new is created.
    pub fn queue_task(&self, spec: TaskSpec) -> Result<QueueOutcome> {
        {
            let handlers = self.handlers.lock().expect("handler table poisoned");
            if !handlers.contains_key(&spec.task_type) {
                return Err(Error::Validation(format!(
                    "no handler registered for task type '{}'",
                    spec.task_type
                )));
            }
        }

        let outcome = {
            let mut inner = self.inner.lock().expect("queue state poisoned");

            if !inner.accepting {
                return Err(Error::Saturated("task queue is shutting down".to_string()));
            }

            if let Some(key) = &spec.dedup_key {
                if let Some(existing) = inner.dedup.get(key) {
                    return Ok(QueueOutcome {
                        id: *existing,
                        deduplicated: true,
                    });
                }
            }

            if inner.depth() + inner.running.len() >= self.config.max_queued {
                return Err(Error::Saturated(format!(
                    "task backlog at capacity ({})",
                    self.config.max_queued
                )));
            }

            let task = spec.into_task(&self.config.default_retry);
            let id = task.id;

            if let Some(key) = &task.dedup_key {
                inner.dedup.insert(key.clone(), id);
            }
            inner
                .stats
                .per_type
                .entry(task.task_type.clone())
                .or_default()
                .enqueued += 1;
            metrics::TASKS_QUEUED_TOTAL
                .with_label_values(&[&task.task_type])
                .inc();

            debug!(
                task_id = %id,
                task_type = %task.task_type,
                priority = ?task.priority,
                "Queued task"
            );

            if task.not_before <= Utc::now() {
                inner.ready.push(ReadyTask(task));
            } else {
                inner.scheduled.push(ScheduledTask(task));
            }
            metrics::QUEUE_DEPTH.set(inner.depth() as i64);

            QueueOutcome {
                id,
                deduplicated: false,
            }
        };

        self.wake.notify_one();
        Ok(outcome)
    }

    /// Replay the holding stream, spawn the worker pool and the stats tick.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Config("task queue already started".to_string()));
        }

        if let Err(e) = self.restore_holding().await {
            warn!(error = %e, "Failed to replay holding stream, continuing");
        }

        let mut workers = self.workers.lock().expect("worker table poisoned");
        for worker_id in 0..self.config.max_concurrent {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }

        let queue = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            queue.stats_tick_loop().await;
        }));

        info!(
            workers = self.config.max_concurrent,
            "✅ Task queue started"
        );
        Ok(())
    }

    /// Stop intake, drain running handlers up to `grace`, force-cancel the
    /// rest, then spill still-queued tasks to the holding stream.
    pub async fn stop(&self, grace: Duration) {
        info!("🛑 Stopping task queue (grace {:?})", grace);

        {
            let mut inner = self.inner.lock().expect("queue state poisoned");
            inner.accepting = false;
        }
        self.cancel.cancel();
        self.wake.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker table poisoned");
            workers.drain(..).collect()
        };

        let deadline = Instant::now() + grace;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                warn!("Worker exceeded drain grace period, force-cancelling");
                handle.abort();
            }
        }

        if let Err(e) = self.persist_holding().await {
            error!(error = %e, "Failed to persist residual tasks to holding stream");
        }

        info!("👋 Task queue stopped");
    }

    /// Queue-wide statistics snapshot.
    pub fn stats(&self) -> QueueStats {
        let mut inner = self.inner.lock().expect("queue state poisoned");
        inner.prune_dead(self.config.dead_letter_retention);

        let completed = inner.stats.completed_total;
        QueueStats {
            running: inner.running.len(),
            queued: inner.depth(),
            completed_total: completed,
            failed_total: inner.stats.failed_total,
            dead_total: inner.stats.dead_total,
            avg_latency_ms: if completed == 0 {
                0.0
            } else {
                inner.stats.total_exec_ms as f64 / completed as f64
            },
            per_type: inner.stats.per_type.clone(),
        }
    }

    /// Dead tasks still inside the retention window, newest last.
    pub fn dead_tasks(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().expect("queue state poisoned");
        inner.prune_dead(self.config.dead_letter_retention);
        inner.dead.iter().map(|(_, task)| task.clone()).collect()
    }

    async fn worker_loop(self: &Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Task worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.pop_due() {
                Some(task) => self.run_task(worker_id, task).await,
                None => {
                    let wait = self.next_wakeup();
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        debug!(worker_id, "Task worker stopped");
    }

    /// Promote due scheduled tasks, then pop the best ready task.
    fn pop_due(&self) -> Option<Task> {
        let mut inner = self.inner.lock().expect("queue state poisoned");
        let now = Utc::now();

        while let Some(head) = inner.scheduled.peek() {
            if head.0.not_before <= now {
                let ScheduledTask(task) = inner.scheduled.pop().expect("peeked entry exists");
                inner.ready.push(ReadyTask(task));
            } else {
                break;
            }
        }

        let ReadyTask(mut task) = inner.ready.pop()?;
        task.state = TaskState::Running;
        inner.running.insert(task.id, task.task_type.clone());
        metrics::QUEUE_DEPTH.set(inner.depth() as i64);
        Some(task)
    }

    /// How long an idle worker may park before re-checking the heaps.
    fn next_wakeup(&self) -> Duration {
        let inner = self.inner.lock().expect("queue state poisoned");
        match inner.scheduled.peek() {
            Some(head) => {
                let delta_ms = (head.0.not_before - Utc::now()).num_milliseconds().max(1);
                Duration::from_millis(delta_ms as u64).min(IDLE_WAIT)
            }
            None => IDLE_WAIT,
        }
    }

    async fn run_task(&self, worker_id: usize, mut task: Task) {
        let handler = {
            let handlers = self.handlers.lock().expect("handler table poisoned");
            handlers.get(&task.task_type).cloned()
        };
        // Replayed holding-stream tasks can reference a type this process no
        // longer handles
        let Some(handler) = handler else {
            self.finish_dead(task, "no handler registered".to_string())
                .await;
            return;
        };

        let timeout = handler.timeout().unwrap_or(self.config.handler_timeout);

        debug!(
            worker_id,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempt,
            "Executing task"
        );

        metrics::TASKS_RUNNING.inc();
        let started = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            handler.execute(&task, self.cancel.child_token()),
        )
        .await;
        let elapsed = started.elapsed();
        metrics::TASKS_RUNNING.dec();
        metrics::TASK_DURATION
            .with_label_values(&[&task.task_type])
            .observe(elapsed.as_secs_f64());

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                metrics::TASK_FAILURES_TOTAL
                    .with_label_values(&[&task.task_type, "timeout"])
                    .inc();
                TaskOutcome::Retry("timeout".to_string())
            }
        };

        match outcome {
            TaskOutcome::Ok => {
                let mut inner = self.inner.lock().expect("queue state poisoned");
                inner.running.remove(&task.id);
                inner.release_dedup(&task);
                inner.stats.completed_total += 1;
                inner.stats.total_exec_ms += elapsed.as_millis() as u64;
                inner
                    .stats
                    .per_type
                    .entry(task.task_type.clone())
                    .or_default()
                    .completed += 1;
                metrics::TASKS_COMPLETED_TOTAL
                    .with_label_values(&[&task.task_type])
                    .inc();
                debug!(task_id = %task.id, task_type = %task.task_type, "Task completed");
            }
            TaskOutcome::Retry(reason) => {
                metrics::TASK_FAILURES_TOTAL
                    .with_label_values(&[&task.task_type, "retry"])
                    .inc();

                if task.attempt >= task.retry.max_attempts {
                    self.finish_dead(task, reason).await;
                } else {
                    task.attempt += 1;
                    task.state = TaskState::Queued;
                    task.last_error = Some(reason.clone());
                    let delay = backoff(&task.retry, task.attempt);
                    task.not_before = Utc::now()
                        + chrono::Duration::milliseconds(delay.as_millis() as i64);

                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        attempt = task.attempt,
                        max_attempts = task.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason,
                        "Task retry scheduled"
                    );

                    let mut inner = self.inner.lock().expect("queue state poisoned");
                    inner.running.remove(&task.id);
                    inner.stats.failed_total += 1;
                    inner
                        .stats
                        .per_type
                        .entry(task.task_type.clone())
                        .or_default()
                        .failed += 1;
                    inner.scheduled.push(ScheduledTask(task));
                    metrics::QUEUE_DEPTH.set(inner.depth() as i64);
                }
            }
            TaskOutcome::Fatal(reason) => {
                metrics::TASK_FAILURES_TOTAL
                    .with_label_values(&[&task.task_type, "fatal"])
                    .inc();
                self.finish_dead(task, reason).await;
            }
        }
    }

    /// Terminal failure: record, retain for visibility, emit to the dead
    /// stream.
    async fn finish_dead(&self, mut task: Task, reason: String) {
        task.state = TaskState::Dead;
        task.last_error = Some(reason.clone());

        {
            let mut inner = self.inner.lock().expect("queue state poisoned");
            inner.running.remove(&task.id);
            inner.release_dedup(&task);
            inner.stats.dead_total += 1;
            inner
                .stats
                .per_type
                .entry(task.task_type.clone())
                .or_default()
                .dead += 1;
            inner.dead.push_back((Instant::now(), task.clone()));
            inner.prune_dead(self.config.dead_letter_retention);
        }
        metrics::TASKS_DEAD_TOTAL
            .with_label_values(&[&task.task_type])
            .inc();

        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempt,
            reason,
            "Task dead"
        );

        match serde_json::to_string(&task) {
            Ok(json) => {
                let fields = vec![
                    ("task".to_string(), json),
                    ("reason".to_string(), reason),
                    ("dead_at".to_string(), Utc::now().to_rfc3339()),
                ];
                if let Err(e) = self
                    .backend
                    .append(&self.config.dead_stream, &fields, self.config.stream_max_length)
                    .await
                {
                    error!(error = %e, "Failed to emit dead task record");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize dead task"),
        }
    }

    /// Replay tasks persisted by a previous process's shutdown.
    async fn restore_holding(self: &Arc<Self>) -> Result<()> {
        let entries = self
            .backend
            .range(&self.config.holding_stream, "-", "+", HOLDING_REPLAY_LIMIT)
            .await?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut restored = 0usize;
        let mut ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            ids.push(entry.id.clone());
            let Some(raw) = entry.fields.get("task") else {
                continue;
            };
            let mut task: Task = match serde_json::from_str(raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "Skipping unreadable holding entry");
                    continue;
                }
            };
            task.state = TaskState::Queued;

            let mut inner = self.inner.lock().expect("queue state poisoned");
            if let Some(key) = &task.dedup_key {
                inner.dedup.insert(key.clone(), task.id);
            }
            if task.not_before <= Utc::now() {
                inner.ready.push(ReadyTask(task));
            } else {
                inner.scheduled.push(ScheduledTask(task));
            }
            metrics::QUEUE_DEPTH.set(inner.depth() as i64);
            restored += 1;
        }

        self.backend
            .delete(&self.config.holding_stream, &ids)
            .await?;

        info!(restored, "Restored tasks from holding stream");
        self.wake.notify_waiters();
        Ok(())
    }

    /// Best-effort spill of the remaining ready set.
    async fn persist_holding(&self) -> Result<()> {
        let residual: Vec<Task> = {
            let mut inner = self.inner.lock().expect("queue state poisoned");
            let mut tasks: Vec<Task> =
                inner.ready.drain().map(|ReadyTask(task)| task).collect();
            tasks.extend(inner.scheduled.drain().map(|ScheduledTask(task)| task));
            inner.dedup.clear();
            metrics::QUEUE_DEPTH.set(0);
            tasks
        };

        if residual.is_empty() {
            return Ok(());
        }

        let count = residual.len();
        for task in residual {
            let json = serde_json::to_string(&task)?;
            let fields = vec![("task".to_string(), json)];
            self.backend
                .append(&self.config.holding_stream, &fields, self.config.stream_max_length)
                .await?;
        }

        info!(count, "Persisted residual tasks to holding stream");
        Ok(())
    }

    async fn stats_tick_loop(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
            }
            let stats = self.stats();
            metrics::QUEUE_DEPTH.set(stats.queued as i64);
            debug!(
                running = stats.running,
                queued = stats.queued,
                completed = stats.completed_total,
                failed = stats.failed_total,
                dead = stats.dead_total,
                "Task queue stats"
            );
        }
    }
}
