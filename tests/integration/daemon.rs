//! Single-instance enforcement and daemon shutdown.

use crate::common::{open_store, recorder, scheduler, seed, wait_for_condition};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use warden::testing::{ExecutionLog, RecordingHandler};
use warden::{
    Daemon, DaemonConfig, DaemonError, DaemonState, StopReason, StoredTask, TaskHandler, TaskName,
    TaskStore,
};

fn config(pid_file: &std::path::Path) -> DaemonConfig {
    DaemonConfig::new(pid_file)
        .with_site("main")
        .with_idle_interval(Duration::from_millis(20))
        .with_max_run_time(None)
}

/// Test: a second daemon refuses to start and leaves descriptors untouched.
#[tokio::test]
async fn test_live_daemon_blocks_second_instance() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let pid_file = dir.path().join("run/warden.pid");
    let store = open_store(&db).await;
    seed(
        store.as_ref(),
        vec![StoredTask::new("tick", "tick").with_interval(60)],
    )
    .await;

    let log = ExecutionLog::new();
    let first = Daemon::new(
        Arc::new(scheduler(store.clone(), vec![recorder("tick", &log)])),
        config(&pid_file),
    );
    let first_handle = first.handle();
    let first_task = tokio::spawn(first.run());
    first_handle.wait_for(DaemonState::Running).await;
    wait_for_condition("first pass", Duration::from_secs(5), || log.count("tick") > 0).await;

    let before = store.get_task(&TaskName::new("tick")).await.unwrap();

    let second_log = ExecutionLog::new();
    let second = Daemon::new(
        Arc::new(scheduler(open_store(&db).await, vec![recorder("tick", &second_log)])),
        config(&pid_file),
    );
    let second_handle = second.handle();
    let result = second.run().await;
    assert!(matches!(result, Err(DaemonError::AlreadyRunning { pid }) if pid == std::process::id()));
    assert_eq!(second_handle.state(), DaemonState::Terminated);
    assert_eq!(second_log.count("tick"), 0);
    assert_eq!(store.get_task(&TaskName::new("tick")).await.unwrap(), before);

    first_handle.stop();
    let summary = first_task.await.unwrap().unwrap();
    assert_eq!(summary.reason, StopReason::Requested);
    assert!(!pid_file.exists());

    // after a clean exit a new daemon starts normally
    let third = Daemon::new(
        Arc::new(scheduler(open_store(&db).await, vec![recorder("tick", &log)])),
        config(&pid_file).with_max_run_time(Some(Duration::from_millis(50))),
    );
    let summary = third.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxRunTime);
    assert!(!pid_file.exists());
}

/// Test: a marker left by a dead process is discarded.
#[tokio::test]
async fn test_stale_marker_is_replaced() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("warden.pid");
    std::fs::write(&pid_file, format!("{}\n", i32::MAX)).unwrap();

    let store = open_store(&dir.path().join("warden.db")).await;
    seed(store.as_ref(), vec![StoredTask::new("tick", "tick").with_interval(60)]).await;

    let log = ExecutionLog::new();
    let daemon = Daemon::new(
        Arc::new(scheduler(store, vec![recorder("tick", &log)])),
        config(&pid_file).with_max_run_time(Some(Duration::from_millis(50))),
    );

    let summary = daemon.run().await.unwrap();
    assert!(summary.passes >= 1);
    assert_eq!(log.count("tick"), 1);
    assert!(!pid_file.exists());
}

/// Test: a stop request lets the pass in flight finish and release its claim.
#[tokio::test]
async fn test_stop_waits_for_in_flight_pass() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("warden.pid");
    let store = open_store(&dir.path().join("warden.db")).await;
    seed(store.as_ref(), vec![StoredTask::new("slow", "slow").with_interval(60)]).await;

    let log = ExecutionLog::new();
    let slow: Arc<dyn TaskHandler> =
        Arc::new(RecordingHandler::new("slow", log.clone()).with_delay(Duration::from_millis(200)));

    let daemon = Daemon::new(
        Arc::new(scheduler(store.clone(), vec![slow])),
        config(&pid_file),
    );
    let handle = daemon.handle();
    let task = tokio::spawn(daemon.run());

    wait_for_condition("daemon running", Duration::from_secs(5), || {
        handle.state() == DaemonState::Running
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();

    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.reason, StopReason::Requested);
    assert_eq!(summary.recovered, None);
    assert_eq!(log.count("slow"), 1);
    assert!(!store.get_task(&TaskName::new("slow")).await.unwrap().running);
}
