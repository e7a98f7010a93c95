//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.
//! Claims are atomic because the check and the write happen under one write
//! lock, which stands in for the row lock a database would take.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{StorageError, StoredTask, TaskStore};
use crate::core::clock::{Clock, SystemClock};
use crate::core::types::TaskName;

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    tasks: RwLock<HashMap<TaskName, StoredTask>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different time source for claim decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut tasks: Vec<StoredTask>) -> Vec<StoredTask> {
    tasks.sort_by(|a, b| {
        a.sort_order
            .cmp(&b.sort_order)
            .then_with(|| a.name.cmp(&b.name))
    });
    tasks
}

#[async_trait]
impl TaskStore for InMemoryStorage {
    async fn list_eligible(
        &self,
        filter: Option<&TaskName>,
        force: bool,
    ) -> Result<Vec<StoredTask>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let result: Vec<_> = tasks
            .values()
            .filter(|t| t.is_eligible(filter, force))
            .cloned()
            .collect();
        Ok(sorted(result))
    }

    async fn get_task(&self, name: &TaskName) -> Result<StoredTask, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        tasks
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", name)))
    }

    async fn list_tasks(&self) -> Result<Vec<StoredTask>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(sorted(tasks.values().cloned().collect()))
    }

    async fn try_claim(
        &self,
        name: &TaskName,
        interval_minutes: u32,
        force: bool,
    ) -> Result<bool, StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let Some(task) = tasks.get_mut(name) else {
            return Ok(false);
        };

        let now = self.clock.now();
        if task.running || !(force || task.is_due(now)) {
            return Ok(false);
        }

        task.running = true;
        task.next_run = Some(now + chrono::Duration::minutes(i64::from(interval_minutes)));
        Ok(true)
    }

    async fn release(&self, name: &TaskName) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(task) = tasks.get_mut(name) {
            task.running = false;
        }
        Ok(())
    }

    async fn upsert_task(&self, task: StoredTask) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        match tasks.get_mut(&task.name) {
            Some(existing) => {
                existing.handler = task.handler;
                existing.require = task.require;
                existing.active = task.active;
                existing.interval_minutes = task.interval_minutes;
                existing.sort_order = task.sort_order;
            }
            None => {
                tasks.insert(task.name.clone(), task);
            }
        }
        Ok(())
    }

    async fn set_active(&self, name: &TaskName, active: bool) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let task = tasks
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", name)))?;
        task.active = active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn storage_at_noon() -> (InMemoryStorage, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
        ));
        let storage = InMemoryStorage::new().with_clock(clock.clone());
        (storage, clock)
    }

    #[tokio::test]
    async fn test_upsert_and_get_task() {
        let (storage, _) = storage_at_noon();
        storage
            .upsert_task(StoredTask::new("prune_logs", "prune_logs").with_interval(60))
            .await
            .unwrap();

        let task = storage.get_task(&TaskName::new("prune_logs")).await.unwrap();
        assert_eq!(task.handler, "prune_logs");
        assert_eq!(task.interval_minutes, 60);
    }

    #[tokio::test]
    async fn test_get_missing_task() {
        let (storage, _) = storage_at_noon();
        let result = storage.get_task(&TaskName::new("nope")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_claim_sets_running_and_next_run() {
        let (storage, clock) = storage_at_noon();
        storage
            .upsert_task(StoredTask::new("t", "h").with_interval(10))
            .await
            .unwrap();

        let claimed = storage.try_claim(&TaskName::new("t"), 10, false).await.unwrap();
        assert!(claimed);

        let task = storage.get_task(&TaskName::new("t")).await.unwrap();
        assert!(task.running);
        assert_eq!(task.next_run, Some(clock.now() + Duration::minutes(10)));
    }

    #[tokio::test]
    async fn test_second_claim_fails_while_running() {
        let (storage, _) = storage_at_noon();
        storage
            .upsert_task(StoredTask::new("t", "h").with_interval(10))
            .await
            .unwrap();
        let name = TaskName::new("t");

        assert!(storage.try_claim(&name, 10, false).await.unwrap());
        assert!(!storage.try_claim(&name, 10, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_of_unknown_task_is_not_acquired() {
        let (storage, _) = storage_at_noon();
        let claimed = storage
            .try_claim(&TaskName::new("ghost"), 10, true)
            .await
            .unwrap();
        assert!(!claimed);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (storage, _) = storage_at_noon();
        storage.upsert_task(StoredTask::new("t", "h")).await.unwrap();
        let name = TaskName::new("t");

        assert!(storage.try_claim(&name, 0, true).await.unwrap());
        storage.release(&name).await.unwrap();
        storage.release(&name).await.unwrap();
        storage.release(&TaskName::new("ghost")).await.unwrap();

        assert!(!storage.get_task(&name).await.unwrap().running);
    }

    #[tokio::test]
    async fn test_upsert_preserves_claim_state() {
        let (storage, _) = storage_at_noon();
        storage
            .upsert_task(StoredTask::new("t", "h").with_interval(10))
            .await
            .unwrap();
        let name = TaskName::new("t");
        assert!(storage.try_claim(&name, 10, false).await.unwrap());
        let before = storage.get_task(&name).await.unwrap();

        storage
            .upsert_task(StoredTask::new("t", "other").with_interval(30).with_sort_order(4))
            .await
            .unwrap();

        let after = storage.get_task(&name).await.unwrap();
        assert_eq!(after.handler, "other");
        assert_eq!(after.sort_order, 4);
        assert!(after.running);
        assert_eq!(after.next_run, before.next_run);
    }

    #[tokio::test]
    async fn test_list_eligible_orders_by_sort_order() {
        let (storage, _) = storage_at_noon();
        storage
            .upsert_task(StoredTask::new("c", "h").with_interval(1).with_sort_order(3))
            .await
            .unwrap();
        storage
            .upsert_task(StoredTask::new("a", "h").with_interval(1).with_sort_order(1))
            .await
            .unwrap();
        storage
            .upsert_task(StoredTask::new("b", "h").with_interval(1).with_sort_order(2))
            .await
            .unwrap();
        storage
            .upsert_task(StoredTask::new("manual", "h").with_sort_order(0))
            .await
            .unwrap();

        let names: Vec<String> = storage
            .list_eligible(None, false)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let forced = storage.list_eligible(None, true).await.unwrap();
        assert_eq!(forced.len(), 4);
        assert_eq!(forced[0].name.as_str(), "manual");
    }

    #[tokio::test]
    async fn test_set_active() {
        let (storage, _) = storage_at_noon();
        storage
            .upsert_task(StoredTask::new("t", "h").with_interval(5))
            .await
            .unwrap();
        let name = TaskName::new("t");

        storage.set_active(&name, false).await.unwrap();

        assert!(!storage.get_task(&name).await.unwrap().active);
        assert!(storage.list_eligible(None, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_grant_exactly_one() {
        let (storage, _) = storage_at_noon();
        storage
            .upsert_task(StoredTask::new("t", "h").with_interval(10))
            .await
            .unwrap();
        let storage = Arc::new(storage);

        let mut handles = vec![];
        for _ in 0..16 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                storage.try_claim(&TaskName::new("t"), 10, false).await
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }
}
