//! Task registry storage and the claim protocol.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite). Besides plain reads, every
//! backend implements the two mutations the scheduler relies on for mutual
//! exclusion: a conditional claim and an unconditional release.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::TaskName;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested task was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Stored task descriptor.
///
/// `running` and `next_run` belong to the scheduler; every other field is
/// administrative and only changes through [`TaskStore::upsert_task`] or a
/// handler disabling itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTask {
    /// Unique task name.
    pub name: TaskName,
    /// Reference to the handler that implements the task.
    pub handler: String,
    /// Extension unit to load before the handler, if any.
    pub require: Option<String>,
    /// Inactive tasks are never considered.
    pub active: bool,
    /// Minimum minutes between claims; 0 means "only when forced".
    pub interval_minutes: u32,
    /// Evaluation order within a pass, ascending.
    pub sort_order: i64,
    /// Whether a process currently holds the claim.
    pub running: bool,
    /// Earliest time a non-forced claim may succeed.
    pub next_run: Option<DateTime<Utc>>,
}

impl StoredTask {
    /// Create a new active, idle task that is due immediately.
    pub fn new(name: impl Into<TaskName>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            require: None,
            active: true,
            interval_minutes: 0,
            sort_order: 0,
            running: false,
            next_run: None,
        }
    }

    /// Set the claim interval in minutes.
    pub fn with_interval(mut self, minutes: u32) -> Self {
        self.interval_minutes = minutes;
        self
    }

    /// Set the sort order.
    pub fn with_sort_order(mut self, order: i64) -> Self {
        self.sort_order = order;
        self
    }

    /// Set the extension to load before the handler.
    pub fn with_require(mut self, require: impl Into<String>) -> Self {
        self.require = Some(require.into());
        self
    }

    /// Set active status.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Whether the task is claimable without force.
    pub fn is_scheduled(&self) -> bool {
        self.interval_minutes > 0
    }

    /// Whether a non-forced claim would pass the time gate at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_none_or(|next| now > next)
    }

    /// The claim interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes))
    }

    /// Whether this descriptor belongs in a pass with the given filter.
    pub(crate) fn is_eligible(&self, filter: Option<&TaskName>, force: bool) -> bool {
        if !self.active {
            return false;
        }
        if !force && !self.is_scheduled() {
            return false;
        }
        filter.is_none_or(|name| &self.name == name)
    }
}

/// Storage trait for the task registry.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // Registry reads

    /// Snapshot of the descriptors a pass should consider, in `sort_order`.
    ///
    /// With a name filter, returns at most that one descriptor. Without
    /// `force`, tasks with a zero interval are left out. Inactive tasks are
    /// never returned. No rows are locked.
    async fn list_eligible(
        &self,
        filter: Option<&TaskName>,
        force: bool,
    ) -> Result<Vec<StoredTask>, StorageError>;

    /// Get a task by name.
    async fn get_task(&self, name: &TaskName) -> Result<StoredTask, StorageError>;

    /// List every task, in `sort_order`.
    async fn list_tasks(&self) -> Result<Vec<StoredTask>, StorageError>;

    // Claim protocol

    /// Atomically claim a task.
    ///
    /// Sets `running` and advances `next_run` to `now + interval`, but only if
    /// no one holds the claim and either `force` is set or the task is due.
    /// Returns `false`, not an error, when the claim was not acquired.
    async fn try_claim(
        &self,
        name: &TaskName,
        interval_minutes: u32,
        force: bool,
    ) -> Result<bool, StorageError>;

    /// Clear `running`. Unconditional and idempotent.
    async fn release(&self, name: &TaskName) -> Result<(), StorageError>;

    // Administrative writes

    /// Insert a task, or update the administrative fields of an existing one.
    ///
    /// `running` and `next_run` of an existing row are left untouched.
    async fn upsert_task(&self, task: StoredTask) -> Result<(), StorageError>;

    /// Enable or disable a task.
    async fn set_active(&self, name: &TaskName, active: bool) -> Result<(), StorageError>;
}
