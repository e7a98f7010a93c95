//! Interval gating and forced runs against a persistent store.

use crate::common::{open_store, open_store_at, recorder, scheduler, seed, t0};
use chrono::Duration;
use std::sync::Arc;
use tempfile::TempDir;
use warden::testing::ExecutionLog;
use warden::{ManualClock, PassRequest, StoredTask, TaskOutcome, TaskStore};

/// Test: a 10 minute task runs at t0, not at t0+5, again at t0+11.
#[tokio::test]
async fn test_interval_respected_across_restarts() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let clock = Arc::new(ManualClock::new(t0()));
    let log = ExecutionLog::new();
    let request = PassRequest::scheduled("main");

    {
        let store = open_store_at(&db, clock.clone()).await;
        seed(
            store.as_ref(),
            vec![StoredTask::new("digest", "digest").with_interval(10)],
        )
        .await;
        let s = scheduler(store.clone(), vec![recorder("digest", &log)]);
        let report = s.run_pass(&request).await.unwrap();
        assert_eq!(report.outcome("digest"), Some(&TaskOutcome::Completed));
        store.close().await;
    }

    // every later pass is a fresh process reading what the first one wrote
    for (advance, expected) in [
        (5, TaskOutcome::NotClaimed),
        (6, TaskOutcome::Completed),
    ] {
        clock.advance(Duration::minutes(advance));
        let store = open_store_at(&db, clock.clone()).await;
        let s = scheduler(store.clone(), vec![recorder("digest", &log)]);
        let report = s.run_pass(&request).await.unwrap();
        assert_eq!(report.outcome("digest"), Some(&expected));
        store.close().await;
    }

    assert_eq!(log.count("digest"), 2);
}

/// Test: force runs a task that is not due and still pushes next_run out.
#[tokio::test]
async fn test_force_bypasses_interval() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = open_store_at(&dir.path().join("warden.db"), clock.clone()).await;
    seed(
        store.as_ref(),
        vec![StoredTask::new("digest", "digest").with_interval(10)],
    )
    .await;
    let log = ExecutionLog::new();
    let s = scheduler(store.clone(), vec![recorder("digest", &log)]);

    s.run_pass(&PassRequest::scheduled("main")).await.unwrap();
    clock.advance(Duration::minutes(1));

    let forced = PassRequest::scheduled("main")
        .with_selector("digest")
        .with_force(true);
    let report = s.run_pass(&forced).await.unwrap();
    assert_eq!(report.outcome("digest"), Some(&TaskOutcome::Completed));
    assert_eq!(log.count("digest"), 2);

    let task = store
        .get_task(&warden::TaskName::new("digest"))
        .await
        .unwrap();
    assert!(!task.running);
    assert_eq!(task.next_run, Some(t0() + Duration::minutes(11)));
}

/// Test: a zero-interval task is left out of scheduled passes entirely.
#[tokio::test]
async fn test_manual_task_needs_force() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir.path().join("warden.db")).await;
    seed(store.as_ref(), vec![StoredTask::new("rebuild", "rebuild")]).await;
    let log = ExecutionLog::new();
    let s = scheduler(store, vec![recorder("rebuild", &log)]);

    let report = s
        .run_pass(&PassRequest::scheduled("main").with_selector("rebuild"))
        .await
        .unwrap();
    assert!(report.tasks.is_empty());

    let report = s
        .run_pass(
            &PassRequest::scheduled("main")
                .with_selector("rebuild")
                .with_force(true),
        )
        .await
        .unwrap();
    assert_eq!(report.outcome("rebuild"), Some(&TaskOutcome::Completed));
    assert_eq!(log.count("rebuild"), 1);
}
