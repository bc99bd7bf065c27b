//! Task handler contract
//!
//! One handler per task type, registered before the queue starts. Handlers
//! declare intent through [`TaskOutcome`]; retry scheduling, backoff and
//! dead-task handling belong to the queue. Ad-hoc retry loops inside
//! handlers defeat the accounting and are a bug.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::task::Task;

/// What a handler did with a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Work done; the task becomes `succeeded`.
    Ok,
    /// Transient failure; the queue re-schedules with backoff until
    /// `max_attempts`.
    Retry(String),
    /// Permanent failure; the task goes straight to `dead`.
    Fatal(String),
}

/// Typed executor for one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt. The cancellation token fires on shutdown; handlers
    /// honor it to participate in graceful drain.
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> TaskOutcome;

    /// Per-type timeout override; the queue default applies when `None`.
    /// Exceeding it counts as a retryable failure with reason `timeout`.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        "task-handler"
    }
}
