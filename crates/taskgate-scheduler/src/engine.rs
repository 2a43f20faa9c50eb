//! Scheduler — priority, lane, dependency and session aware work queue.
//!
//! All reads and writes of the task cache happen inside one `tokio::sync::Mutex`
//! critical section, so two workers can never select the same task. Disk
//! writes happen outside that section under a second lock; a flush that finds
//! a newer snapshot already on disk skips its own write.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use taskgate_core::config::SchedulerConfig;
use taskgate_core::error::{Result, TaskGateError};

use crate::clock::{Clock, SystemClock};
use crate::events::SchedulerEvent;
use crate::lanes::{self, LaneStats};
use crate::store::{self, Snapshot, TaskStore};
use crate::tasks::{Lane, Task, TaskStatus};

/// What one maintenance sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Terminal tasks dropped after their TTL.
    pub expired: usize,
    /// Terminal tasks that were missing an `expires_at`.
    pub backfilled: usize,
    /// Stale in-progress tasks put back to pending.
    pub recovered: usize,
    /// Pending tasks failed because their parent failed.
    pub cascaded: usize,
    /// Dependencies on vanished parents that were cleared.
    pub orphans_cleared: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Queue-wide counts.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub total: usize,
    pub lanes: Vec<LaneStats>,
}

/// The durable task scheduler.
pub struct Scheduler {
    state: Mutex<TaskStore>,
    /// Generation of the last snapshot written to disk.
    written: Mutex<u64>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SchedulerEvent>,
    stop: watch::Sender<bool>,
    timers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Open the scheduler on the configured store path.
    pub fn open(config: SchedulerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Open with a custom time source.
    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = TaskStore::open(&config.resolved_store_path())?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (stop, _) = watch::channel(false);
        tracing::info!(
            "📅 Scheduler opened with {} tasks ({})",
            store.len(),
            store.path().display()
        );
        Ok(Self {
            state: Mutex::new(store),
            written: Mutex::new(0),
            config,
            clock,
            events,
            stop,
            timers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Publish events on a caller-owned channel instead of the built-in one.
    pub fn with_event_sender(mut self, events: broadcast::Sender<SchedulerEvent>) -> Self {
        self.events = events;
        self
    }

    /// Receive task-queued and status-changed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn completed_ttl(&self) -> Duration {
        secs(self.config.completed_ttl_secs)
    }

    fn failed_ttl(&self) -> Duration {
        secs(self.config.failed_ttl_secs)
    }

    fn stamp(task: &mut Task, now: DateTime<Utc>) {
        task.status = TaskStatus::Pending;
        task.expires_at = None;
        task.timestamp = now;
        task.updated_at = now;
    }

    /// Queue a task and persist immediately.
    pub async fn push(&self, mut task: Task) -> Result<String> {
        let now = self.clock.now();
        Self::stamp(&mut task, now);
        let id = task.id.clone();
        let (lane, priority) = (task.lane, task.priority);
        {
            let mut store = self.state.lock().await;
            if store.get(&id).is_some() {
                return Err(TaskGateError::TaskExists(id));
            }
            store.insert(task);
        }
        tracing::info!("📥 Task queued: {id} (lane={lane}, priority={priority})");
        self.emit(SchedulerEvent::TaskQueued {
            id: id.clone(),
            lane,
            priority,
        });
        self.flush().await?;
        Ok(id)
    }

    /// Queue `task` so it only runs after `parent_id` completes.
    pub async fn push_after(&self, parent_id: &str, task: Task) -> Result<String> {
        self.push(task.depends_on(parent_id)).await
    }

    /// Queue tasks that must run strictly in the given order.
    pub async fn push_chain(&self, tasks: Vec<Task>) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut ids = Vec::with_capacity(tasks.len());
        let mut queued = Vec::with_capacity(tasks.len());
        {
            let mut store = self.state.lock().await;
            let mut seen = HashSet::new();
            if let Some(dup) = tasks
                .iter()
                .find(|t| store.get(&t.id).is_some() || !seen.insert(t.id.as_str()))
            {
                return Err(TaskGateError::TaskExists(dup.id.clone()));
            }
            drop(seen);
            let mut previous: Option<String> = None;
            for mut task in tasks {
                Self::stamp(&mut task, now);
                if let Some(parent) = previous.take() {
                    task.depends_on = Some(parent);
                }
                previous = Some(task.id.clone());
                ids.push(task.id.clone());
                queued.push((task.id.clone(), task.lane, task.priority));
                store.insert(task);
            }
        }
        tracing::info!("🔗 Task chain queued: {} tasks", ids.len());
        for (id, lane, priority) in queued {
            self.emit(SchedulerEvent::TaskQueued { id, lane, priority });
        }
        self.flush().await?;
        Ok(ids)
    }

    /// Highest-priority eligible task, without claiming it.
    ///
    /// With `lane = None` the user lane is preferred over the autonomy lane.
    pub async fn get_next(&self, lane: Option<Lane>) -> Option<Task> {
        let now = self.clock.now();
        let store = self.state.lock().await;
        lanes::select_next(store.tasks(), lane, now).map(|i| store.tasks()[i].clone())
    }

    /// Select the next eligible task and mark it in-progress atomically.
    pub async fn claim_next(&self, lane: Option<Lane>) -> Result<Option<Task>> {
        let now = self.clock.now();
        let claimed = {
            let mut store = self.state.lock().await;
            let Some(i) = lanes::select_next(store.tasks(), lane, now) else {
                return Ok(None);
            };
            let task = &mut store.tasks_mut()[i];
            task.status = TaskStatus::InProgress;
            task.touch(now);
            task.clone()
        };
        tracing::debug!("🏃 Task claimed: {} (lane={})", claimed.id, claimed.lane);
        self.emit(SchedulerEvent::StatusChanged {
            id: claimed.id.clone(),
            from: TaskStatus::Pending,
            to: TaskStatus::InProgress,
        });
        self.flush().await?;
        Ok(Some(claimed))
    }

    /// Transition a task and persist.
    ///
    /// `failed` consumes a retry when one is left: the task goes back to
    /// `pending` behind a backoff. Otherwise it stays `failed` and expires
    /// after `failed_ttl`. `completed` expires after `completed_ttl`.
    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let updated = {
            let mut store = self.state.lock().await;
            if status.holds_session() {
                let task = store
                    .get(id)
                    .ok_or_else(|| TaskGateError::TaskNotFound(id.to_string()))?;
                if let Some(scope) = task.session_scope()
                    && let Some(holder) = lanes::session_holder(store.tasks(), scope, id)
                {
                    return Err(TaskGateError::SessionBusy {
                        session: scope.to_string(),
                        holder: holder.to_string(),
                    });
                }
            }
            let (completed_ttl, failed_ttl) = (self.completed_ttl(), self.failed_ttl());
            let task = store
                .get_mut(id)
                .ok_or_else(|| TaskGateError::TaskNotFound(id.to_string()))?;
            let from = task.status;
            task.touch(now);

            match status {
                TaskStatus::Completed => {
                    task.status = TaskStatus::Completed;
                    task.expires_at = Some(now + completed_ttl);
                }
                TaskStatus::Failed => match task.retry.record_failure(now) {
                    Some(next_retry_at) => {
                        task.status = TaskStatus::Pending;
                        task.expires_at = None;
                        tracing::info!(
                            "🔁 Task {id} failed, retry {}/{} in {}s",
                            task.retry.attempts,
                            task.retry.max_attempts,
                            (next_retry_at - now).num_seconds()
                        );
                        events.push(SchedulerEvent::RetryScheduled {
                            id: id.to_string(),
                            attempt: task.retry.attempts,
                            next_retry_at,
                        });
                    }
                    None => {
                        task.status = TaskStatus::Failed;
                        task.expires_at = Some(now + failed_ttl);
                        tracing::warn!(
                            "❌ Task {id} failed permanently after {} attempts",
                            task.retry.attempts
                        );
                    }
                },
                other => {
                    task.status = other;
                    task.expires_at = None;
                }
            }
            tracing::debug!("🔄 Task {id}: {from} → {}", task.status);
            events.push(SchedulerEvent::StatusChanged {
                id: id.to_string(),
                from,
                to: task.status,
            });
            task.clone()
        };
        for event in events {
            self.emit(event);
        }
        self.flush().await?;
        Ok(updated)
    }

    /// Shallow-merge `patch` into the task payload.
    ///
    /// A task holding its session cannot be moved into a scope another task
    /// already holds.
    pub async fn update_payload(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        let now = self.clock.now();
        {
            let mut store = self.state.lock().await;
            let task = store
                .get(id)
                .ok_or_else(|| TaskGateError::TaskNotFound(id.to_string()))?;
            if task.status.holds_session()
                && let Some(scope) = task.payload.scope_after(&patch)
                && let Some(holder) = lanes::session_holder(store.tasks(), &scope, id)
            {
                return Err(TaskGateError::SessionBusy {
                    session: scope,
                    holder: holder.to_string(),
                });
            }
            let task = store
                .get_mut(id)
                .ok_or_else(|| TaskGateError::TaskNotFound(id.to_string()))?;
            task.payload.merge(patch);
            task.touch(now);
        }
        self.flush().await
    }

    /// Opt an existing task into (or out of) automatic retry.
    /// Attempts already recorded are kept.
    pub async fn set_retry_policy(
        &self,
        id: &str,
        max_attempts: u32,
        base_delay_secs: u64,
    ) -> Result<()> {
        let now = self.clock.now();
        {
            let mut store = self.state.lock().await;
            let task = store
                .get_mut(id)
                .ok_or_else(|| TaskGateError::TaskNotFound(id.to_string()))?;
            task.retry.max_attempts = max_attempts;
            task.retry.base_delay_secs = base_delay_secs;
            task.touch(now);
        }
        self.flush().await
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.state.lock().await.get(id).cloned()
    }

    /// All tasks in scheduling order.
    pub async fn list(&self) -> Vec<Task> {
        self.state.lock().await.tasks().to_vec()
    }

    pub async fn stats(&self) -> SchedulerStats {
        let now = self.clock.now();
        let store = self.state.lock().await;
        SchedulerStats {
            total: store.len(),
            lanes: lanes::lane_stats(store.tasks(), now),
        }
    }

    /// One maintenance sweep: TTL cleanup, stale recovery, then dependency
    /// cascade and orphan clearing.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = self.clock.now();
        let mut report = MaintenanceReport::default();
        let mut events = Vec::new();
        {
            let mut store = self.state.lock().await;

            // (a) TTL cleanup, plus expiry for terminal tasks persisted without one.
            let missing_expiry: Vec<(String, TaskStatus)> = store
                .tasks()
                .iter()
                .filter(|t| t.status.is_terminal() && t.expires_at.is_none())
                .map(|t| (t.id.clone(), t.status))
                .collect();
            for (id, status) in missing_expiry {
                let ttl = match status {
                    TaskStatus::Completed => self.completed_ttl(),
                    _ => self.failed_ttl(),
                };
                if let Some(task) = store.get_mut(&id) {
                    task.expires_at = Some(now + ttl);
                    report.backfilled += 1;
                }
            }

            let expired = store.remove_where(|t| t.expires_at.is_some_and(|at| at <= now));
            let expired_failed: HashSet<String> = expired
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect();
            if !expired.is_empty() {
                tracing::info!("🧹 Removed {} expired tasks", expired.len());
            }
            report.expired = expired.len();
            events.extend(
                expired
                    .into_iter()
                    .map(|t| SchedulerEvent::Expired { id: t.id }),
            );

            // (b) Stale recovery.
            let stale_after = secs(self.config.stale_timeout_secs);
            let stale: Vec<(String, i64)> = store
                .tasks()
                .iter()
                .filter(|t| t.status == TaskStatus::InProgress && now - t.updated_at > stale_after)
                .map(|t| (t.id.clone(), (now - t.updated_at).num_seconds()))
                .collect();
            for (id, idle_secs) in stale {
                if let Some(task) = store.get_mut(&id) {
                    task.status = TaskStatus::Pending;
                    task.touch(now);
                    tracing::warn!("⏰ Stale task {id} recovered after {idle_secs}s in progress");
                    events.push(SchedulerEvent::StatusChanged {
                        id: id.clone(),
                        from: TaskStatus::InProgress,
                        to: TaskStatus::Pending,
                    });
                    events.push(SchedulerEvent::StaleRecovered { id, idle_secs });
                    report.recovered += 1;
                }
            }

            // (c) Cascade failure to a fixpoint, then orphan clearing.
            loop {
                let failed: HashSet<&str> = store
                    .tasks()
                    .iter()
                    .filter(|t| t.status == TaskStatus::Failed)
                    .map(|t| t.id.as_str())
                    .collect();
                let victims: Vec<(String, String)> = store
                    .tasks()
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .filter_map(|t| {
                        let parent = t.depends_on.as_deref()?;
                        (failed.contains(parent) || expired_failed.contains(parent))
                            .then(|| (t.id.clone(), parent.to_string()))
                    })
                    .collect();
                if victims.is_empty() {
                    break;
                }
                let failed_ttl = self.failed_ttl();
                for (id, parent) in victims {
                    if let Some(task) = store.get_mut(&id) {
                        task.status = TaskStatus::Failed;
                        task.expires_at = Some(now + failed_ttl);
                        task.touch(now);
                        tracing::warn!("⛓️ Task {id} failed: dependency {parent} failed");
                        events.push(SchedulerEvent::StatusChanged {
                            id: id.clone(),
                            from: TaskStatus::Pending,
                            to: TaskStatus::Failed,
                        });
                        events.push(SchedulerEvent::CascadeFailed { id, parent });
                        report.cascaded += 1;
                    }
                }
            }

            let known: HashSet<&str> = store.tasks().iter().map(|t| t.id.as_str()).collect();
            let orphans: Vec<String> = store
                .tasks()
                .iter()
                .filter(|t| !t.status.is_terminal())
                .filter(|t| t.depends_on.as_deref().is_some_and(|p| !known.contains(p)))
                .map(|t| t.id.clone())
                .collect();
            for id in orphans {
                if let Some(task) = store.get_mut(&id) {
                    let parent = task.depends_on.take().unwrap_or_default();
                    task.touch(now);
                    tracing::info!("🪢 Task {id}: dependency {parent} no longer exists, cleared");
                    report.orphans_cleared += 1;
                }
            }
        }

        for event in events {
            self.emit(event);
        }
        if !report.is_empty() {
            tracing::debug!("🛠️ Maintenance: {report:?}");
            self.flush().await?;
        }
        Ok(report)
    }

    /// Write pending changes to disk.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = {
            let mut store = self.state.lock().await;
            store.snapshot()?
        };
        match snapshot {
            Some(snapshot) => self.write_snapshot(snapshot).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Write `snapshot` unless a newer one already reached disk.
    /// Returns whether it was written.
    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let mut written = self.written.lock().await;
        if *written >= snapshot.generation {
            tracing::debug!("⏭️ Skipping stale snapshot gen {}", snapshot.generation);
            return Ok(false);
        }
        let path = self.config.resolved_store_path();
        if let Err(e) = store::write_atomic(&path, snapshot.json.as_bytes()) {
            self.state.lock().await.mark_dirty();
            tracing::warn!("⚠️ Failed to save tasks: {e}");
            return Err(e);
        }
        *written = snapshot.generation;
        tracing::debug!("💾 Saved tasks to {} (gen {})", path.display(), snapshot.generation);
        Ok(true)
    }

    /// Spawn the flush and maintenance timers. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if !timers.is_empty() {
            return;
        }
        tracing::info!(
            "⏰ Scheduler timers started (flush every {}ms, maintenance every {}ms)",
            self.config.flush_interval_ms,
            self.config.maintenance_interval_ms
        );

        let scheduler = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        let every = std::time::Duration::from_millis(self.config.flush_interval_ms.max(1));
        timers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Errors are logged inside flush.
                        let _ = scheduler.flush().await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let scheduler = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        let every = std::time::Duration::from_millis(self.config.maintenance_interval_ms.max(1));
        timers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.run_maintenance().await {
                            tracing::warn!("⚠️ Maintenance failed: {e}");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }));
    }

    /// Stop timers and force a final flush.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop.send_replace(true);
        let timers: Vec<JoinHandle<()>> = {
            let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
            timers.drain(..).collect()
        };
        for timer in timers {
            let _ = timer.await;
        }
        {
            let mut store = self.state.lock().await;
            store.mark_dirty();
        }
        self.flush().await?;
        tracing::info!("👋 Scheduler shut down");
        Ok(())
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000).min(i64::MAX / 1000))
}
