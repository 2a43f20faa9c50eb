//! Scheduler events — observers subscribe through `Scheduler::subscribe`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tasks::{Lane, TaskStatus};

/// Side-effect notifications emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskQueued {
        id: String,
        lane: Lane,
        priority: i64,
    },
    StatusChanged {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    RetryScheduled {
        id: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    StaleRecovered {
        id: String,
        idle_secs: i64,
    },
    CascadeFailed {
        id: String,
        parent: String,
    },
    Expired {
        id: String,
    },
}
