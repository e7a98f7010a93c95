//! Mutual exclusion between processes.
//!
//! Each scheduler below opens its own connection pool on the same database
//! file, which is as close to two cron-launched processes as a test gets.

use crate::common::{open_store, scheduler, seed};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use warden::testing::{ExecutionLog, RecordingHandler};
use warden::{PassRequest, StoredTask, TaskHandler, TaskOutcome};

/// Test: concurrent passes never run the same handler at the same time.
#[tokio::test]
async fn test_concurrent_passes_never_overlap() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let log = ExecutionLog::new();

    let first = open_store(&db).await;
    seed(first.as_ref(), vec![StoredTask::new("sweep", "sweep")]).await;
    let second = open_store(&db).await;

    let handler = || -> Arc<dyn TaskHandler> {
        Arc::new(RecordingHandler::new("sweep", log.clone()).with_delay(Duration::from_millis(40)))
    };
    let a = scheduler(first, vec![handler()]);
    let b = scheduler(second, vec![handler()]);

    // zero interval plus force: the claim is only ever blocked by `running`
    let request = PassRequest::scheduled("main").with_force(true);
    for _ in 0..10 {
        let (ra, rb) = tokio::join!(a.run_pass(&request), b.run_pass(&request));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra.outcome("sweep").is_some());
        assert!(rb.outcome("sweep").is_some());
    }

    assert!(log.count("sweep") >= 10);
    assert!(!log.has_overlap("sweep"));
}

/// Test: only one of two simultaneous claimants runs a due task.
#[tokio::test]
async fn test_due_task_runs_once_across_processes() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let log = ExecutionLog::new();

    let first = open_store(&db).await;
    seed(
        first.as_ref(),
        vec![StoredTask::new("report", "report").with_interval(60)],
    )
    .await;
    let second = open_store(&db).await;

    let handler = || -> Arc<dyn TaskHandler> {
        Arc::new(RecordingHandler::new("report", log.clone()).with_delay(Duration::from_millis(20)))
    };
    let a = scheduler(first, vec![handler()]);
    let b = scheduler(second, vec![handler()]);

    let request = PassRequest::scheduled("main");
    let (ra, rb) = tokio::join!(a.run_pass(&request), b.run_pass(&request));
    let outcomes = [
        ra.unwrap().outcome("report").cloned(),
        rb.unwrap().outcome("report").cloned(),
    ];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, Some(TaskOutcome::Completed)))
        .count();
    assert_eq!(completed, 1, "outcomes: {:?}", outcomes);
    assert_eq!(log.count("report"), 1);
}
