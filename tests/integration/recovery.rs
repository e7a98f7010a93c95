//! Recovery scenario integration tests.
//!
//! A pass interrupted inside a handler leaves `running = 1` behind. These
//! tests drop the pass future mid-handler, the way a signal tears down the
//! process, and check that the recovery hook unlocks the task without ever
//! letting two runs of it overlap.

use crate::common::{is_running, open_store, recorder, scheduler, seed, wait_for_condition};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use warden::testing::{
    BlockingHandler, EventRecorder, ExecutionLog, PanickingExtension, RecordingHandler,
};
use warden::{
    Event, HandlerRegistry, PassRequest, Scheduler, StoredTask, TaskHandler, TaskName,
    TaskOutcome, TaskStore,
};

/// Test: dropping a pass mid-handler, then firing the hook, releases the claim.
#[tokio::test]
async fn test_interrupted_pass_is_recovered() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let store = open_store(&db).await;
    seed(
        store.as_ref(),
        vec![StoredTask::new("export", "export").with_interval(5)],
    )
    .await;

    let blocking = Arc::new(BlockingHandler::new("export"));
    let entered = blocking.entered();
    let handler: Arc<dyn TaskHandler> = blocking.clone();
    let s = scheduler(store.clone(), vec![handler]);
    let events = Arc::new(EventRecorder::new());
    s.event_bus().register(events.clone()).await;
    let hook = s.recovery_hook();

    let request = PassRequest::scheduled("main");
    tokio::select! {
        _ = s.run_pass(&request) => panic!("pass finished while the handler was parked"),
        _ = entered.notified() => {}
    }

    assert!(is_running(store.as_ref(), "export").await);
    assert_eq!(s.run_context().current().map(|t| t.to_string()), Some("export".to_string()));

    let recovered = hook.fire().await.unwrap();
    assert_eq!(recovered.map(|t| t.to_string()), Some("export".to_string()));
    assert!(!is_running(store.as_ref(), "export").await);
    assert!(s.run_context().current().is_none());
    assert_eq!(
        events
            .matching(|e| matches!(e, Event::TaskRecovered { .. }))
            .len(),
        1
    );
}

/// Test: a new process can claim the task once the old one recovered.
#[tokio::test]
async fn test_recovered_task_is_claimable_by_next_process() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let store = open_store(&db).await;
    seed(store.as_ref(), vec![StoredTask::new("export", "export")]).await;

    let blocking = Arc::new(BlockingHandler::new("export"));
    let entered = blocking.entered();
    let handler: Arc<dyn TaskHandler> = blocking.clone();
    let forced = PassRequest::scheduled("main").with_force(true);

    {
        let s = scheduler(store.clone(), vec![handler.clone()]);
        tokio::select! {
            _ = s.run_pass(&forced) => panic!("pass finished while the handler was parked"),
            _ = entered.notified() => {}
        }

        // without recovery, another process sees the task locked
        let other = scheduler(open_store(&db).await, vec![handler.clone()]);
        let report = other.run_pass(&forced).await.unwrap();
        assert_eq!(report.outcome("export"), Some(&TaskOutcome::AlreadyRunning));

        s.recovery_hook().fire().await.unwrap();
    }

    let log = ExecutionLog::new();
    let next = scheduler(open_store(&db).await, vec![recorder("export", &log)]);
    let report = tokio::time::timeout(Duration::from_secs(5), next.run_pass(&forced))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome("export"), Some(&TaskOutcome::Completed));
    assert_eq!(log.count("export"), 1);
    assert!(!is_running(store.as_ref(), "export").await);
}

/// Test: after recovery, the next run never overlaps the interrupted one.
#[tokio::test]
async fn test_recovered_run_never_overlaps_interrupted_run() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let store = open_store(&db).await;
    seed(store.as_ref(), vec![StoredTask::new("export", "export")]).await;

    let log = ExecutionLog::new();
    let slow = || -> Arc<dyn TaskHandler> {
        Arc::new(RecordingHandler::new("export", log.clone()).with_delay(Duration::from_millis(300)))
    };
    let forced = PassRequest::scheduled("main").with_force(true);

    let first = scheduler(store.clone(), vec![slow()]);
    tokio::select! {
        _ = first.run_pass(&forced) => panic!("pass finished while the handler slept"),
        _ = wait_for_condition("handler entered", Duration::from_secs(5), || log.in_flight("export") == 1) => {}
    }
    first.recovery_hook().fire().await.unwrap();
    assert_eq!(log.in_flight("export"), 0);

    let second = scheduler(open_store(&db).await, vec![slow()]);
    let report = second.run_pass(&forced).await.unwrap();
    assert_eq!(report.outcome("export"), Some(&TaskOutcome::Completed));

    // long enough for an orphaned first run to have finished too
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(log.max_concurrent("export"), 1);
    assert_eq!(log.count("export"), 1);
    assert!(!is_running(store.as_ref(), "export").await);
}

/// Test: an extension that panics while loading does not leave the task locked.
#[tokio::test]
async fn test_panicking_extension_releases_claim() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir.path().join("warden.db")).await;
    seed(
        store.as_ref(),
        vec![StoredTask::new("t", "t").with_interval(5).with_require("bootstrap")],
    )
    .await;

    let log = ExecutionLog::new();
    let registry = HandlerRegistry::new()
        .with_handler(recorder("t", &log))
        .with_extension(Arc::new(PanickingExtension::new("bootstrap", "bootstrap failed")));
    let s = Arc::new(Scheduler::with_storage(store.clone()).with_registry(registry));

    let pass = tokio::spawn({
        let s = Arc::clone(&s);
        async move { s.run_pass(&PassRequest::scheduled("main")).await }
    });
    let report = pass.await.expect("pass must not panic").unwrap();

    assert!(matches!(
        report.outcome("t"),
        Some(TaskOutcome::Unresolved { error }) if error.contains("bootstrap failed")
    ));
    assert_eq!(log.count("t"), 0);
    assert!(s.run_context().current().is_none());
    assert!(!is_running(store.as_ref(), "t").await);
}

/// Test: firing the hook with nothing claimed is a no-op.
#[tokio::test]
async fn test_hook_without_claim_is_noop() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir.path().join("warden.db")).await;
    seed(store.as_ref(), vec![StoredTask::new("idle", "idle")]).await;
    store
        .try_claim(&TaskName::new("idle"), 5, true)
        .await
        .unwrap();

    let s = scheduler(store.clone(), Vec::new());
    assert_eq!(s.recovery_hook().fire().await.unwrap(), None);

    // a claim held by someone else is not ours to release
    assert!(is_running(store.as_ref(), "idle").await);
}
