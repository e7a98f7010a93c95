//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use warden::testing::{ExecutionLog, RecordingHandler};
use warden::{
    HandlerRegistry, ManualClock, Scheduler, SqliteStorage, StoredTask, TaskHandler, TaskName,
    TaskStore,
};

/// Fixed starting point for manual clocks.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap()
}

/// Open (or create) the store at `path`.
pub async fn open_store(path: &Path) -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(path).await.unwrap())
}

/// Open the store at `path` with claim decisions driven by `clock`.
pub async fn open_store_at(path: &Path, clock: Arc<ManualClock>) -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(path).await.unwrap().with_clock(clock))
}

/// A [`RecordingHandler`] for `name`, logging into `log`.
pub fn recorder(name: &str, log: &ExecutionLog) -> Arc<dyn TaskHandler> {
    Arc::new(RecordingHandler::new(name, log.clone()))
}

/// Upsert each descriptor.
pub async fn seed<S: TaskStore + ?Sized>(store: &S, tasks: Vec<StoredTask>) {
    for task in tasks {
        store.upsert_task(task).await.unwrap();
    }
}

/// A scheduler over `store` with `handlers` registered.
pub fn scheduler<S: TaskStore + 'static>(
    store: Arc<S>,
    handlers: Vec<Arc<dyn TaskHandler>>,
) -> Scheduler<S> {
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register_handler(handler);
    }
    Scheduler::with_storage(store).with_registry(registry)
}

/// Whether the stored descriptor is marked running.
pub async fn is_running<S: TaskStore + ?Sized>(store: &S, task: &str) -> bool {
    store.get_task(&TaskName::new(task)).await.unwrap().running
}

/// Poll `condition` every 10ms until it holds.
///
/// # Panics
///
/// Panics if `timeout` elapses first.
pub async fn wait_for_condition(
    description: &str,
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) {
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("Timeout waiting for {}", description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
