/*!
 * Prometheus Metrics for the Task Queue
 */

use lazy_static::lazy_static;
use prometheus::{
    HistogramVec, IntCounterVec, IntGauge, opts, register_histogram_vec,
    register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    /// Tasks accepted into the ready set
    pub static ref TASKS_QUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_tasks_queued_total", "Tasks accepted into the ready set"),
        &["type"]
    )
    .expect("metric can be created");

    /// Tasks that reached `succeeded`
    pub static ref TASKS_COMPLETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_tasks_completed_total", "Tasks completed successfully"),
        &["type"]
    )
    .expect("metric can be created");

    /// Attempt failures by kind (retry, fatal, timeout)
    pub static ref TASK_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_task_failures_total", "Task attempt failures"),
        &["type", "kind"]
    )
    .expect("metric can be created");

    /// Tasks that reached `dead`
    pub static ref TASKS_DEAD_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("beacon_tasks_dead_total", "Tasks moved to the dead set"),
        &["type"]
    )
    .expect("metric can be created");

    /// Handler execution duration
    pub static ref TASK_DURATION: HistogramVec = register_histogram_vec!(
        "beacon_task_duration_seconds",
        "Task handler execution duration in seconds",
        &["type"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]
    )
    .expect("metric can be created");

    /// Currently running handlers
    pub static ref TASKS_RUNNING: IntGauge = register_int_gauge!(opts!(
        "beacon_tasks_running",
        "Task handlers currently executing"
    ))
    .expect("metric can be created");

    /// Ready + scheduled backlog
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(opts!(
        "beacon_task_queue_depth",
        "Tasks waiting in the ready and scheduled sets"
    ))
    .expect("metric can be created");
}
