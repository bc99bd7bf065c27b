/*!
 * Beacon Task Queue
 *
 * In-process scheduler over typed tasks, fed by task-bearing events from the
 * bus and by direct enqueues from the admin surface.
 *
 * ## Architecture
 *
 * ```text
 * Event Bus                       Task Queue
 * ─────────                       ──────────
 *     │                               │
 *     ├─ embedding.requested ────────>│ TaskBridge: event -> TaskSpec
 *     ├─ content.generation.requested │     │
 *     └─ notification.requested       │     v
 *                                     │ ready set (priority, not_before)
 *        POST /tasks/queue ──────────>│     │
 *                                     │     ├──> Worker 1 ──> typed handler
 *                                     │     ├──> Worker 2 ──> typed handler
 *                                     │     └──> Worker N ──> typed handler
 *                                     │
 *                                     │ retry with backoff + jitter,
 *                                     │ dedup keys, per-type timeouts,
 *                                     │ dead tasks -> beacon.tasks.dead
 * ```
 *
 * Workers are a fixed pool of `max_concurrent` tasks; saturation propagates
 * to the bus as un-ACKed entries (the bridge returns `Retry`), converting
 * throughput pressure into durable queue depth instead of memory.
 */

pub mod bridge;
pub mod handler;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod task;

pub use bridge::{TaskBridge, DEFAULT_ROUTES};
pub use handler::{TaskHandler, TaskOutcome};
pub use queue::{QueueOutcome, QueueStats, TaskQueue, TaskQueueConfig, TypeStats};
pub use task::{RetryConfig, RetryStrategy, Task, TaskPriority, TaskSpec, TaskState};
