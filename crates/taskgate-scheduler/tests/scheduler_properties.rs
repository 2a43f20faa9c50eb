//! Cross-module properties of the scheduler: persistence round trip,
//! dependency and session guarantees under concurrent workers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use taskgate_core::SchedulerConfig;
use taskgate_scheduler::{Lane, ManualClock, RetryPolicy, Scheduler, Task, TaskStatus};

fn config_in(dir: &tempfile::TempDir) -> SchedulerConfig {
    SchedulerConfig {
        store_path: dir.path().join("tasks.json").to_string_lossy().to_string(),
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn test_round_trip_preserves_active_set() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = config_in(&dir);
    let clock = Arc::new(ManualClock::default());
    let scheduler = Scheduler::with_clock(config.clone(), clock.clone()).unwrap();

    let parent = scheduler
        .push(Task::new("parent", Lane::Autonomy).priority(3))
        .await
        .unwrap();
    scheduler
        .push_after(&parent, Task::new("child", Lane::Autonomy).session("s-1"))
        .await
        .unwrap();
    scheduler
        .push(
            Task::new("flaky", Lane::User)
                .priority(7)
                .retry(RetryPolicy::new(2, 5))
                .meta("chatId", serde_json::json!("c-9")),
        )
        .await
        .unwrap();
    let flaky = scheduler.get_next(Some(Lane::User)).await.unwrap();
    scheduler
        .update_status(&flaky.id, TaskStatus::Failed)
        .await
        .unwrap();
    scheduler.flush().await.unwrap();

    let before = scheduler.list().await;
    drop(scheduler);

    let reopened = Scheduler::with_clock(config, clock).unwrap();
    assert_eq!(reopened.list().await, before);
}

#[tokio::test]
async fn test_corrupt_store_starts_empty_and_keeps_evidence() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = config_in(&dir);
    std::fs::write(dir.path().join("tasks.json"), "{ definitely not an array").unwrap();

    let scheduler = Scheduler::open(config).unwrap();
    assert!(scheduler.list().await.is_empty());
    let quarantined = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().contains(".corrupt."));
    assert!(quarantined);

    scheduler.push(Task::new("fresh", Lane::User)).await.unwrap();
    assert_eq!(scheduler.list().await.len(), 1);
}

#[tokio::test]
async fn test_cascade_failure_scenario() {
    let dir = tempfile::TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = Scheduler::with_clock(config_in(&dir), clock.clone()).unwrap();

    let mut a = Task::new("a", Lane::User).retry(RetryPolicy::new(1, 1));
    a.retry.attempts = 1;
    let a = scheduler.push(a).await.unwrap();
    let b = scheduler.push_after(&a, Task::new("b", Lane::User)).await.unwrap();
    let failed = scheduler.update_status(&a, TaskStatus::Failed).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    scheduler.run_maintenance().await.unwrap();
    let b = scheduler.get(&b).await.unwrap();
    assert_eq!(b.status, TaskStatus::Failed);
    assert!(b.expires_at.is_some());
}

#[tokio::test]
async fn test_terminal_tasks_always_get_expiry() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = config_in(&dir);

    // A store written by something that forgot expires_at.
    let mut done = Task::new("legacy", Lane::User);
    done.status = TaskStatus::Completed;
    std::fs::write(
        dir.path().join("tasks.json"),
        serde_json::to_string(&vec![done.clone()]).unwrap(),
    )
    .unwrap();

    let scheduler = Scheduler::open(config).unwrap();
    let report = scheduler.run_maintenance().await.unwrap();
    assert_eq!(report.backfilled, 1);
    for task in scheduler.list().await {
        if task.status.is_terminal() {
            assert!(task.expires_at.is_some(), "terminal task {} lacks expiry", task.id);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_respect_dependencies_and_sessions() {
    let dir = tempfile::TempDir::new().unwrap();
    let scheduler = Arc::new(Scheduler::open(config_in(&dir)).unwrap());

    let mut chain = Vec::new();
    for i in 0..5 {
        chain.push(Task::new(&format!("step-{i}"), Lane::Autonomy).priority(i));
    }
    let chain_ids = scheduler.push_chain(chain).await.unwrap();
    for i in 0..12 {
        let lane = if i % 2 == 0 { Lane::User } else { Lane::Autonomy };
        scheduler
            .push(Task::new(&format!("msg-{i}"), lane).session(&format!("chat-{}", i % 3)))
            .await
            .unwrap();
    }

    let mut workers = Vec::new();
    for lane in [Some(Lane::User), Some(Lane::Autonomy), None, None] {
        let scheduler = Arc::clone(&scheduler);
        workers.push(tokio::spawn(async move {
            let mut done = Vec::new();
            loop {
                let Some(task) = scheduler.claim_next(lane).await.unwrap() else {
                    if scheduler
                        .list()
                        .await
                        .iter()
                        .all(|t| t.status == TaskStatus::Completed)
                    {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                };

                // While we hold the task, no other task shares its session.
                let snapshot = scheduler.list().await;
                if let Some(scope) = task.session_scope() {
                    let holders = snapshot
                        .iter()
                        .filter(|t| t.session_scope() == Some(scope) && t.status.holds_session())
                        .count();
                    assert_eq!(holders, 1);
                }
                if let Some(parent) = &task.depends_on {
                    let parent = snapshot.iter().find(|t| &t.id == parent).unwrap();
                    assert_eq!(parent.status, TaskStatus::Completed);
                }

                tokio::task::yield_now().await;
                scheduler
                    .update_status(&task.id, TaskStatus::Completed)
                    .await
                    .unwrap();
                done.push(task.id);
            }
            done
        }));
    }

    let mut completed: HashMap<String, usize> = HashMap::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            *completed.entry(id).or_default() += 1;
        }
    }
    assert_eq!(completed.len(), 17);
    assert!(completed.values().all(|&n| n == 1));
    for id in &chain_ids {
        assert!(completed.contains_key(id));
    }
}

#[tokio::test]
async fn test_maintenance_then_expiry_window() {
    let dir = tempfile::TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = Scheduler::with_clock(config_in(&dir), clock.clone()).unwrap();
    let id = scheduler.push(Task::new("doomed", Lane::User)).await.unwrap();
    scheduler.update_status(&id, TaskStatus::Failed).await.unwrap();

    clock.advance(Duration::hours(71));
    scheduler.run_maintenance().await.unwrap();
    assert!(scheduler.get(&id).await.is_some());

    clock.advance(Duration::hours(2));
    let report = scheduler.run_maintenance().await.unwrap();
    assert_eq!(report.expired, 1);
    assert!(scheduler.get(&id).await.is_none());
}
