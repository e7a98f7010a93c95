//! Evaluation order and failure isolation.

use crate::common::{open_store, recorder, scheduler, seed};
use std::sync::Arc;
use tempfile::TempDir;
use warden::testing::{ExecutionLog, FailingHandler, PanickingHandler};
use warden::{PassRequest, StoredTask, TaskHandler, TaskOutcome, TaskStore};

/// Test: tasks run in ascending sort_order, the same way every pass.
#[tokio::test]
async fn test_order_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir.path().join("warden.db")).await;
    seed(
        store.as_ref(),
        vec![
            StoredTask::new("c", "c").with_sort_order(30),
            StoredTask::new("a", "a").with_sort_order(10),
            StoredTask::new("b", "b").with_sort_order(20),
        ],
    )
    .await;

    let log = ExecutionLog::new();
    let s = scheduler(
        store,
        vec![
            recorder("a", &log),
            recorder("b", &log),
            recorder("c", &log),
        ],
    );

    let forced = PassRequest::scheduled("main").with_force(true);
    for _ in 0..3 {
        let report = s.run_pass(&forced).await.unwrap();
        let names: Vec<_> = report.executed_tasks().iter().map(|t| t.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
    assert_eq!(log.order(), vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"]);
}

/// Test: a failing or panicking handler does not stop later tasks.
#[tokio::test]
async fn test_failures_are_isolated() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir.path().join("warden.db")).await;
    seed(
        store.as_ref(),
        vec![
            StoredTask::new("broken", "broken")
                .with_interval(5)
                .with_sort_order(1),
            StoredTask::new("explodes", "explodes")
                .with_interval(5)
                .with_sort_order(2),
            StoredTask::new("missing", "not_registered")
                .with_interval(5)
                .with_sort_order(3),
            StoredTask::new("healthy", "healthy")
                .with_interval(5)
                .with_sort_order(4),
        ],
    )
    .await;

    let log = ExecutionLog::new();
    let handlers: Vec<Arc<dyn TaskHandler>> = vec![
        Arc::new(FailingHandler::always("broken", "disk full")),
        Arc::new(PanickingHandler::new("explodes", "boom")),
        recorder("healthy", &log),
    ];
    let s = scheduler(store.clone(), handlers);

    let report = s.run_pass(&PassRequest::scheduled("main")).await.unwrap();

    assert!(matches!(report.outcome("broken"), Some(TaskOutcome::Failed { .. })));
    assert!(matches!(report.outcome("explodes"), Some(TaskOutcome::Failed { error }) if error.contains("boom")));
    assert!(matches!(report.outcome("missing"), Some(TaskOutcome::Unresolved { .. })));
    assert_eq!(report.outcome("healthy"), Some(&TaskOutcome::Completed));
    assert_eq!(log.count("healthy"), 1);

    // every claim was released, whatever the handler did
    for task in store.list_tasks().await.unwrap() {
        assert!(!task.running, "{} left running", task.name);
        assert!(task.next_run.is_some());
    }
}
