//! Shared application state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use beacon_bus::EventBus;
use beacon_common::stream::StreamBackend;
use beacon_task_queue::TaskQueue;

/// Everything the admin handlers need, injected by the lifecycle owner.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskQueue>,
    pub backend: Arc<dyn StreamBackend>,
    pub started_at: DateTime<Utc>,
}
