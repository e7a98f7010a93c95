//! Crash recovery for abandoned claims.
//!
//! A pass records the task it currently holds in a [`RunContext`]. If the
//! process is torn down before the normal release (a signal, a fatal error),
//! the [`RecoveryHook`] reads that marker and clears `running` so the next
//! invocation is not locked out forever.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::types::TaskName;
use crate::events::{Event, EventBus};
use crate::storage::{StorageError, TaskStore};

/// Per-process execution context holding the current-claim marker.
#[derive(Debug, Default)]
pub struct RunContext {
    current: Mutex<Option<TaskName>>,
}

impl RunContext {
    /// Create a context with no claim held.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<TaskName>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The task currently claimed by this process, if any.
    pub fn current(&self) -> Option<TaskName> {
        self.slot().clone()
    }

    pub(crate) fn mark(&self, task: TaskName) {
        *self.slot() = Some(task);
    }

    pub(crate) fn clear(&self) {
        *self.slot() = None;
    }

    fn take(&self) -> Option<TaskName> {
        self.slot().take()
    }

    fn restore(&self, task: TaskName) {
        let mut slot = self.slot();
        if slot.is_none() {
            *slot = Some(task);
        }
    }
}

/// Releases the claim recorded in a [`RunContext`].
///
/// Cheap to clone; the CLI keeps one around and fires it on every exit path.
pub struct RecoveryHook<S: TaskStore> {
    context: Arc<RunContext>,
    storage: Arc<S>,
    event_bus: Arc<EventBus>,
}

impl<S: TaskStore> Clone for RecoveryHook<S> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            storage: Arc::clone(&self.storage),
            event_bus: Arc::clone(&self.event_bus),
        }
    }
}

impl<S: TaskStore> RecoveryHook<S> {
    pub(crate) fn new(context: Arc<RunContext>, storage: Arc<S>, event_bus: Arc<EventBus>) -> Self {
        Self {
            context,
            storage,
            event_bus,
        }
    }

    /// Release the marked task, if any, and clear the marker.
    ///
    /// Returns the released task. If the release fails the marker is put
    /// back so a later attempt can retry it.
    pub async fn fire(&self) -> Result<Option<TaskName>, StorageError> {
        let Some(task) = self.context.take() else {
            return Ok(None);
        };

        match self.storage.release(&task).await {
            Ok(()) => {
                tracing::warn!(task = %task, "released claim abandoned by an interrupted run");
                self.event_bus.emit(Event::task_recovered(task.clone())).await;
                Ok(Some(task))
            }
            Err(e) => {
                tracing::error!(task = %task, error = %e, "recovery release failed");
                self.event_bus
                    .emit(Event::release_failed(None, task.clone(), e.to_string()))
                    .await;
                self.context.restore(task);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, StoredTask};

    async fn claimed_store() -> Arc<InMemoryStorage> {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .upsert_task(StoredTask::new("t", "h").with_interval(10))
            .await
            .unwrap();
        assert!(
            storage
                .try_claim(&TaskName::new("t"), 10, false)
                .await
                .unwrap()
        );
        storage
    }

    #[tokio::test]
    async fn test_fire_without_marker_is_noop() {
        let storage = claimed_store().await;
        let hook = RecoveryHook::new(
            Arc::new(RunContext::new()),
            storage.clone(),
            Arc::new(EventBus::new()),
        );

        assert_eq!(hook.fire().await.unwrap(), None);
        assert!(storage.get_task(&TaskName::new("t")).await.unwrap().running);
    }

    #[tokio::test]
    async fn test_fire_releases_marked_task() {
        let storage = claimed_store().await;
        let context = Arc::new(RunContext::new());
        context.mark(TaskName::new("t"));
        let hook = RecoveryHook::new(context.clone(), storage.clone(), Arc::new(EventBus::new()));

        assert_eq!(hook.fire().await.unwrap(), Some(TaskName::new("t")));
        assert!(!storage.get_task(&TaskName::new("t")).await.unwrap().running);
        assert!(context.current().is_none());

        // second fire has nothing left to do
        assert_eq!(hook.fire().await.unwrap(), None);
    }

    #[test]
    fn test_marker_roundtrip() {
        let context = RunContext::new();
        assert!(context.current().is_none());
        context.mark(TaskName::new("a"));
        assert_eq!(context.current(), Some(TaskName::new("a")));
        context.clear();
        assert!(context.current().is_none());
    }
}
