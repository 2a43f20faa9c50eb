//! Lane-aware selection — which pending task runs next.
//!
//! A task is eligible when it is `pending`, its retry backoff has elapsed, its
//! dependency (if any) is `completed`, and no other task with the same session
//! scope is `in-progress` or `waiting`. Within a lane the first eligible task
//! in cache order wins (priority desc, then insertion). Without an explicit
//! lane, the user lane is always tried before the autonomy lane.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tasks::{Lane, Task, TaskStatus};

/// Precomputed view of the cache for eligibility checks.
struct Index<'a> {
    status_by_id: HashMap<&'a str, TaskStatus>,
    busy_sessions: HashSet<&'a str>,
}

impl<'a> Index<'a> {
    fn build(tasks: &'a [Task]) -> Self {
        let mut status_by_id = HashMap::with_capacity(tasks.len());
        let mut busy_sessions = HashSet::new();
        for task in tasks {
            status_by_id.insert(task.id.as_str(), task.status);
            if task.status.holds_session()
                && let Some(scope) = task.session_scope()
            {
                busy_sessions.insert(scope);
            }
        }
        Self {
            status_by_id,
            busy_sessions,
        }
    }

    fn is_eligible(&self, task: &Task, now: DateTime<Utc>) -> bool {
        if task.status != TaskStatus::Pending || task.retry.is_backing_off(now) {
            return false;
        }
        if let Some(parent) = task.depends_on.as_deref()
            && self.status_by_id.get(parent) != Some(&TaskStatus::Completed)
        {
            return false;
        }
        match task.session_scope() {
            Some(scope) => !self.busy_sessions.contains(scope),
            None => true,
        }
    }
}

/// Index of the next task to run, if any.
pub fn select_next(tasks: &[Task], lane: Option<Lane>, now: DateTime<Utc>) -> Option<usize> {
    let index = Index::build(tasks);
    let lanes: &[Lane] = match &lane {
        Some(lane) => std::slice::from_ref(lane),
        None => &Lane::ALL,
    };
    lanes.iter().find_map(|lane| {
        tasks
            .iter()
            .position(|t| t.lane == *lane && index.is_eligible(t, now))
    })
}

/// Id of the task currently holding `scope`, ignoring `except`.
pub fn session_holder<'a>(tasks: &'a [Task], scope: &str, except: &str) -> Option<&'a str> {
    tasks
        .iter()
        .find(|t| t.id != except && t.status.holds_session() && t.session_scope() == Some(scope))
        .map(|t| t.id.as_str())
}

/// Statistics for a single lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub lane: Lane,
    pub pending: usize,
    pub eligible: usize,
    pub waiting: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Per-lane counts over the whole cache.
pub fn lane_stats(tasks: &[Task], now: DateTime<Utc>) -> Vec<LaneStats> {
    let index = Index::build(tasks);
    Lane::ALL
        .iter()
        .map(|lane| {
            let mut stats = LaneStats {
                lane: *lane,
                pending: 0,
                eligible: 0,
                waiting: 0,
                in_progress: 0,
                completed: 0,
                failed: 0,
            };
            for task in tasks.iter().filter(|t| t.lane == *lane) {
                match task.status {
                    TaskStatus::Pending => stats.pending += 1,
                    TaskStatus::Waiting => stats.waiting += 1,
                    TaskStatus::InProgress => stats.in_progress += 1,
                    TaskStatus::Completed => stats.completed += 1,
                    TaskStatus::Failed => stats.failed += 1,
                }
                if index.is_eligible(task, now) {
                    stats.eligible += 1;
                }
            }
            stats
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn task(desc: &str, lane: Lane, priority: i64) -> Task {
        Task::new(desc, lane).priority(priority)
    }

    fn pick<'a>(tasks: &'a [Task], lane: Option<Lane>) -> Option<&'a str> {
        select_next(tasks, lane, Utc::now()).map(|i| tasks[i].payload.description.as_str())
    }

    #[test]
    fn test_user_lane_preempts_autonomy() {
        let tasks = vec![task("bg", Lane::Autonomy, 100), task("fg", Lane::User, 1)];
        assert_eq!(pick(&tasks, None), Some("fg"));
        assert_eq!(pick(&tasks, Some(Lane::Autonomy)), Some("bg"));
    }

    #[test]
    fn test_dependency_gate() {
        let parent = task("parent", Lane::User, 0);
        let child = task("child", Lane::User, 10).depends_on(&parent.id);
        let mut tasks = vec![child, parent];
        assert_eq!(pick(&tasks, None), Some("parent"));

        tasks[1].status = TaskStatus::InProgress;
        assert_eq!(pick(&tasks, None), None);

        tasks[1].status = TaskStatus::Completed;
        assert_eq!(pick(&tasks, None), Some("child"));
    }

    #[test]
    fn test_missing_dependency_is_unsatisfiable() {
        let tasks = vec![task("orphan", Lane::User, 0).depends_on("gone")];
        assert_eq!(pick(&tasks, None), None);
    }

    #[test]
    fn test_session_serialization() {
        let mut busy = task("busy", Lane::User, 0).session("chat-1");
        busy.status = TaskStatus::Waiting;
        let tasks = vec![
            task("same-session", Lane::User, 5).session("chat-1"),
            busy,
            task("other-session", Lane::User, 1).session("chat-2"),
        ];
        assert_eq!(pick(&tasks, None), Some("other-session"));
        assert_eq!(session_holder(&tasks, "chat-1", "x"), Some(tasks[1].id.as_str()));
        assert_eq!(session_holder(&tasks, "chat-1", &tasks[1].id), None);
    }

    #[test]
    fn test_backoff_gate() {
        let now = Utc::now();
        let mut retrying = task("retrying", Lane::User, 9).retry(RetryPolicy::new(2, 30));
        retrying.retry.record_failure(now);
        let tasks = vec![retrying, task("fresh", Lane::User, 1)];
        assert_eq!(
            select_next(&tasks, None, now).map(|i| tasks[i].payload.description.as_str()),
            Some("fresh")
        );
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(select_next(&tasks, None, later), Some(0));
    }

    #[test]
    fn test_lane_stats() {
        let mut done = task("done", Lane::User, 0);
        done.status = TaskStatus::Completed;
        let tasks = vec![done, task("a", Lane::User, 0), task("b", Lane::Autonomy, 0)];
        let stats = lane_stats(&tasks, Utc::now());
        assert_eq!(stats[0].completed, 1);
        assert_eq!(stats[0].eligible, 1);
        assert_eq!(stats[1].lane, Lane::Autonomy);
        assert_eq!(stats[1].pending, 1);
    }
}
