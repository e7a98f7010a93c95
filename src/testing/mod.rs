//! Testing utilities for users of the warden library.
//!
//! This module provides helpers for testing schedulers and handlers:
//!
//! - [`RecordingHandler`]: records entry/exit times into a shared [`ExecutionLog`]
//! - [`FailingHandler`]: fails N times then succeeds
//! - [`PanickingHandler`]: panics on every call
//! - [`PanickingExtension`]: panics while loading
//! - [`BlockingHandler`]: parks inside `execute` until released
//! - [`FailingStore`]: a [`TaskStore`] wrapper with injectable errors and panics
//! - [`EventRecorder`]: an [`EventHandler`] that keeps every event

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::core::task::{Extension, TaskError, TaskHandler};
use crate::core::types::TaskName;
use crate::events::{Event, EventHandler};
use crate::storage::{StorageError, StoredTask, TaskStore};

/// One handler invocation as seen by a [`RecordingHandler`].
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub handler: String,
    pub started: Instant,
    pub finished: Instant,
}

impl ExecutionRecord {
    /// Whether the two invocations were ever inside the handler together.
    pub fn overlaps(&self, other: &ExecutionRecord) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// Current and peak number of invocations inside one handler.
#[derive(Debug, Clone, Copy, Default)]
struct Concurrency {
    current: usize,
    peak: usize,
}

/// Shared, append-only log of handler invocations.
///
/// Also tracks invocations still inside a handler, including ones whose
/// future is later dropped before completing.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
    concurrency: Arc<Mutex<HashMap<String, Concurrency>>>,
}

impl ExecutionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ExecutionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, record: ExecutionRecord) {
        self.entries().push(record);
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<String, Concurrency>> {
        self.concurrency.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, handler: &str) -> InFlight {
        let mut counters = self.counters();
        let entry = counters.entry(handler.to_string()).or_default();
        entry.current += 1;
        entry.peak = entry.peak.max(entry.current);
        InFlight {
            log: self.clone(),
            handler: handler.to_string(),
        }
    }

    /// Invocations of `handler` currently inside `execute`.
    pub fn in_flight(&self, handler: &str) -> usize {
        self.counters().get(handler).map_or(0, |c| c.current)
    }

    /// Most invocations of `handler` ever inside `execute` at once.
    pub fn max_concurrent(&self, handler: &str) -> usize {
        self.counters().get(handler).map_or(0, |c| c.peak)
    }

    /// Every recorded invocation, in completion order.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.entries().clone()
    }

    /// Handler names in order of entry.
    pub fn order(&self) -> Vec<String> {
        let mut records = self.records();
        records.sort_by_key(|r| r.started);
        records.into_iter().map(|r| r.handler).collect()
    }

    /// Number of completed invocations of `handler`.
    pub fn count(&self, handler: &str) -> usize {
        self.entries().iter().filter(|r| r.handler == handler).count()
    }

    /// Whether any two invocations of `handler` overlapped in time.
    pub fn has_overlap(&self, handler: &str) -> bool {
        let records: Vec<_> = self
            .records()
            .into_iter()
            .filter(|r| r.handler == handler)
            .collect();
        records
            .iter()
            .enumerate()
            .any(|(i, a)| records[i + 1..].iter().any(|b| a.overlaps(b)))
    }
}

/// Decrements the in-flight count when an invocation ends or is dropped.
struct InFlight {
    log: ExecutionLog,
    handler: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(entry) = self.log.counters().get_mut(&self.handler) {
            entry.current = entry.current.saturating_sub(1);
        }
    }
}

/// A handler that records when it was entered and left.
pub struct RecordingHandler {
    name: String,
    log: ExecutionLog,
    delay: Duration,
}

impl RecordingHandler {
    /// Create a handler that logs into `log`.
    pub fn new(name: impl Into<String>, log: ExecutionLog) -> Self {
        Self {
            name: name.into(),
            log,
            delay: Duration::ZERO,
        }
    }

    /// Stay inside `execute` for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> Result<(), TaskError> {
        let _in_flight = self.log.enter(&self.name);
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.push(ExecutionRecord {
            handler: self.name.clone(),
            started,
            finished: Instant::now(),
        });
        Ok(())
    }
}

/// A handler that fails a configurable number of times before succeeding.
///
/// # Example
///
/// ```
/// use warden::testing::FailingHandler;
///
/// // Fails 2 times, then succeeds on the 3rd call
/// let handler = FailingHandler::new("flaky", 2);
/// assert_eq!(handler.call_count(), 0);
/// ```
pub struct FailingHandler {
    name: String,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
    error_message: String,
}

impl FailingHandler {
    /// Create a handler that fails `fail_count` times then succeeds.
    pub fn new(name: impl Into<String>, fail_count: u32) -> Self {
        Self::with_error(name, fail_count, "intentional test failure")
    }

    /// Create a handler that always fails with `message`.
    pub fn always(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_error(name, u32::MAX, message)
    }

    /// Create a handler that fails with a custom error message.
    pub fn with_error(
        name: impl Into<String>,
        fail_count: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            failures_remaining: AtomicU32::new(fail_count),
            calls: AtomicU32::new(0),
            error_message: message.into(),
        }
    }

    /// Number of times `execute` was called.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> Result<(), TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(TaskError::ExecutionFailed(self.error_message.clone()))
        } else {
            Ok(())
        }
    }
}

/// A handler that panics every time it runs.
pub struct PanickingHandler {
    name: String,
    message: String,
}

impl PanickingHandler {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for PanickingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> Result<(), TaskError> {
        panic!("{}", self.message);
    }
}

/// An extension whose load panics.
pub struct PanickingExtension {
    name: String,
    message: String,
}

impl PanickingExtension {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Extension for PanickingExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<(), TaskError> {
        panic!("{}", self.message);
    }
}

/// A handler that signals on entry and then waits to be released.
///
/// Lets a test interrupt a pass while a claim is held.
pub struct BlockingHandler {
    name: String,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl BlockingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    /// Notified once `execute` has been entered.
    pub fn entered(&self) -> Arc<Notify> {
        Arc::clone(&self.entered)
    }

    /// Let a parked `execute` return.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl TaskHandler for BlockingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> Result<(), TaskError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Event handler that keeps every event it sees.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Events matching `predicate`.
    pub fn matching(&self, predicate: impl Fn(&Event) -> bool) -> Vec<Event> {
        self.events().into_iter().filter(|e| predicate(e)).collect()
    }
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// A [`TaskStore`] wrapper whose operations can be made to fail.
pub struct FailingStore<S: TaskStore> {
    inner: S,
    fail_list: AtomicBool,
    fail_claim: AtomicBool,
    fail_release: AtomicBool,
    panic_release: AtomicBool,
}

impl<S: TaskStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_list: AtomicBool::new(false),
            fail_claim: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
            panic_release: AtomicBool::new(false),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_claim(&self, fail: bool) {
        self.fail_claim.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Make the next `release` call panic. Later calls behave normally.
    pub fn panic_next_release(&self) {
        self.panic_release.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for FailingStore<S> {
    async fn list_eligible(
        &self,
        filter: Option<&TaskName>,
        force: bool,
    ) -> Result<Vec<StoredTask>, StorageError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StorageError::Other("injected list_eligible error".into()));
        }
        self.inner.list_eligible(filter, force).await
    }

    async fn get_task(&self, name: &TaskName) -> Result<StoredTask, StorageError> {
        self.inner.get_task(name).await
    }

    async fn list_tasks(&self) -> Result<Vec<StoredTask>, StorageError> {
        self.inner.list_tasks().await
    }

    async fn try_claim(
        &self,
        name: &TaskName,
        interval_minutes: u32,
        force: bool,
    ) -> Result<bool, StorageError> {
        if self.fail_claim.load(Ordering::SeqCst) {
            return Err(StorageError::Other("injected try_claim error".into()));
        }
        self.inner.try_claim(name, interval_minutes, force).await
    }

    async fn release(&self, name: &TaskName) -> Result<(), StorageError> {
        if self.panic_release.swap(false, Ordering::SeqCst) {
            panic!("injected release panic");
        }
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(StorageError::Other("injected release error".into()));
        }
        self.inner.release(name).await
    }

    async fn upsert_task(&self, task: StoredTask) -> Result<(), StorageError> {
        self.inner.upsert_task(task).await
    }

    async fn set_active(&self, name: &TaskName, active: bool) -> Result<(), StorageError> {
        self.inner.set_active(name, active).await
    }
}
