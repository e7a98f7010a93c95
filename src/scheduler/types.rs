//! Scheduler type definitions.
//!
//! Error type, the trigger parameter object, and the per-pass report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::core::types::{PassId, SiteId, TaskName};
use crate::events::SkipReason;
use crate::storage::StorageError;

/// Selector meaning "every eligible task" on the trigger surface.
pub const ALL_TASKS: &str = "all";

/// Errors that abort a pass.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Reading the registry failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A claim could not be released; the task is left marked for recovery.
    #[error("failed to release task {task}: {source}")]
    ReleaseFailed {
        task: TaskName,
        #[source]
        source: StorageError,
    },
}

/// Inputs of a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRequest {
    /// Opaque site selector, used to pick the store.
    pub site: SiteId,
    /// Run only the named task.
    pub task_filter: Option<TaskName>,
    /// Bypass the interval gate and the interval-zero filter.
    pub force: bool,
}

impl PassRequest {
    /// A plain scheduled pass over every due task of `site`.
    pub fn scheduled(site: impl Into<SiteId>) -> Self {
        Self {
            site: site.into(),
            task_filter: None,
            force: false,
        }
    }

    /// Restrict the pass to one task.
    pub fn with_task(mut self, task: impl Into<TaskName>) -> Self {
        self.task_filter = Some(task.into());
        self
    }

    /// Apply a trigger selector: a task name, or `all` (or empty) for no filter.
    pub fn with_selector(mut self, selector: &str) -> Self {
        let selector = selector.trim();
        self.task_filter = if selector.is_empty() || selector == ALL_TASKS {
            None
        } else {
            Some(TaskName::new(selector))
        };
        self
    }

    /// Set the force flag.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

impl Default for PassRequest {
    fn default() -> Self {
        Self::scheduled(SiteId::default())
    }
}

/// What happened to one descriptor during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The handler ran and returned successfully.
    Completed,
    /// The handler ran and returned an error or panicked.
    Failed { error: String },
    /// The claim was taken but the handler could not be resolved.
    Unresolved { error: String },
    /// Skipped: disabled in the snapshot.
    Inactive,
    /// Skipped: another process held the claim in the snapshot.
    AlreadyRunning,
    /// Skipped: the conditional update touched no row.
    NotClaimed,
    /// Skipped: the claim update raised a storage error.
    ClaimError { error: String },
}

impl TaskOutcome {
    /// Whether the claim was acquired (and therefore released) for this task.
    pub fn was_claimed(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Completed | TaskOutcome::Failed { .. } | TaskOutcome::Unresolved { .. }
        )
    }

    pub(crate) fn skipped(reason: SkipReason) -> Self {
        match reason {
            SkipReason::Inactive => TaskOutcome::Inactive,
            SkipReason::AlreadyRunning => TaskOutcome::AlreadyRunning,
            SkipReason::NotClaimed => TaskOutcome::NotClaimed,
        }
    }
}

/// Outcome of one task within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task: TaskName,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// Summary of a completed pass, in evaluation order.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: PassId,
    pub site: SiteId,
    pub started_at: DateTime<Utc>,
    pub tasks: Vec<TaskReport>,
}

impl PassReport {
    pub(crate) fn new(pass_id: PassId, site: SiteId, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id,
            site,
            started_at,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, task: TaskName, outcome: TaskOutcome) {
        self.tasks.push(TaskReport { task, outcome });
    }

    /// Outcome recorded for `task`, if it was part of the pass.
    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.tasks
            .iter()
            .find(|r| r.task.as_str() == task)
            .map(|r| &r.outcome)
    }

    /// Number of tasks whose handler was invoked or attempted.
    pub fn executed(&self) -> usize {
        self.tasks.iter().filter(|r| r.outcome.was_claimed()).count()
    }

    /// Number of tasks passed over.
    pub fn skipped(&self) -> usize {
        self.tasks.len() - self.executed()
    }

    /// Names of the tasks whose handler was invoked or attempted, in order.
    pub fn executed_tasks(&self) -> Vec<&TaskName> {
        self.tasks
            .iter()
            .filter(|r| r.outcome.was_claimed())
            .map(|r| &r.task)
            .collect()
    }
}
