//! # TaskGate Scheduler
//!
//! Durable, priority-ordered work queue for an autonomous agent.
//!
//! ## Design Principles
//! - One JSON file, written atomically, survives crashes and restarts
//! - Two lanes: `user` work always preempts `autonomy` work
//! - One active task per session scope, so conversations stay ordered
//! - No retries unless a task opts in; capped exponential backoff when it does
//! - A maintenance sweep for TTL cleanup, stale recovery and dependency cascades
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio::sync::Mutex critical section)
//!   ├── TaskStore: Vec<Task> sorted by priority ── write tmp → rename ── tasks.json
//!   ├── get_next / claim_next(lane) → lanes::select_next
//!   ├── update_status → RetryPolicy (pending again, or terminal + expires_at)
//!   ├── run_maintenance: TTL → stale → cascade/orphans
//!   └── broadcast::Sender<SchedulerEvent> → subscribers
//! ```

pub mod clock;
pub mod engine;
pub mod events;
pub mod lanes;
pub mod retry;
pub mod store;
pub mod tasks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{MaintenanceReport, Scheduler, SchedulerStats};
pub use events::SchedulerEvent;
pub use lanes::LaneStats;
pub use retry::RetryPolicy;
pub use store::TaskStore;
pub use tasks::{Lane, Task, TaskPayload, TaskStatus};
