//! Lifecycle events and event handling.
//!
//! Every decision the scheduler takes, and every error path it survives, is
//! published as an [`Event`] on an [`EventBus`]. The binary subscribes a
//! logging handler; tests subscribe recorders.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::task::panic_message;
use crate::core::types::{PassId, SiteId, TaskName};
use crate::daemon::StopReason;

/// Why a task was passed over without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The snapshot showed the task disabled.
    Inactive,
    /// The snapshot showed another process holding the claim.
    AlreadyRunning,
    /// The conditional update touched no row: contention, or not yet due.
    NotClaimed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::Inactive => "inactive",
            SkipReason::AlreadyRunning => "already running",
            SkipReason::NotClaimed => "not claimed",
        };
        f.write_str(reason)
    }
}

/// Lifecycle events emitted by passes, recovery and the daemon.
#[derive(Debug, Clone)]
pub enum Event {
    /// A pass has begun reading the registry.
    PassStarted {
        pass_id: PassId,
        site: SiteId,
        task_filter: Option<TaskName>,
        force: bool,
        timestamp: Instant,
    },

    /// A pass walked every eligible task.
    PassCompleted {
        pass_id: PassId,
        executed: usize,
        skipped: usize,
        duration: Duration,
        timestamp: Instant,
    },

    /// The claim for a task was acquired.
    TaskClaimed {
        pass_id: PassId,
        task: TaskName,
        timestamp: Instant,
    },

    /// A task was passed over.
    TaskSkipped {
        pass_id: PassId,
        task: TaskName,
        reason: SkipReason,
        timestamp: Instant,
    },

    /// A handler returned successfully.
    TaskCompleted {
        pass_id: PassId,
        task: TaskName,
        duration: Duration,
        timestamp: Instant,
    },

    /// A handler returned an error or panicked.
    TaskFailed {
        pass_id: PassId,
        task: TaskName,
        error: String,
        duration: Duration,
        timestamp: Instant,
    },

    /// The handler (or its extension) could not be resolved.
    HandlerUnresolved {
        pass_id: PassId,
        task: TaskName,
        error: String,
        timestamp: Instant,
    },

    /// The claim update itself failed.
    ClaimFailed {
        pass_id: PassId,
        task: TaskName,
        error: String,
        timestamp: Instant,
    },

    /// Clearing `running` failed. The task stays marked in the run context.
    ReleaseFailed {
        pass_id: Option<PassId>,
        task: TaskName,
        error: String,
        timestamp: Instant,
    },

    /// The recovery hook released a claim abandoned mid-execution.
    TaskRecovered { task: TaskName, timestamp: Instant },

    /// The daemon acquired its instance marker and entered its loop.
    DaemonStarted { pid: u32, timestamp: Instant },

    /// The daemon left its loop.
    DaemonStopped {
        passes: u64,
        reason: StopReason,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::PassStarted { timestamp, .. }
            | Event::PassCompleted { timestamp, .. }
            | Event::TaskClaimed { timestamp, .. }
            | Event::TaskSkipped { timestamp, .. }
            | Event::TaskCompleted { timestamp, .. }
            | Event::TaskFailed { timestamp, .. }
            | Event::HandlerUnresolved { timestamp, .. }
            | Event::ClaimFailed { timestamp, .. }
            | Event::ReleaseFailed { timestamp, .. }
            | Event::TaskRecovered { timestamp, .. }
            | Event::DaemonStarted { timestamp, .. }
            | Event::DaemonStopped { timestamp, .. } => *timestamp,
        }
    }

    /// The pass this event belongs to, if any.
    pub fn pass_id(&self) -> Option<&PassId> {
        match self {
            Event::PassStarted { pass_id, .. }
            | Event::PassCompleted { pass_id, .. }
            | Event::TaskClaimed { pass_id, .. }
            | Event::TaskSkipped { pass_id, .. }
            | Event::TaskCompleted { pass_id, .. }
            | Event::TaskFailed { pass_id, .. }
            | Event::HandlerUnresolved { pass_id, .. }
            | Event::ClaimFailed { pass_id, .. } => Some(pass_id),
            Event::ReleaseFailed { pass_id, .. } => pass_id.as_ref(),
            Event::TaskRecovered { .. }
            | Event::DaemonStarted { .. }
            | Event::DaemonStopped { .. } => None,
        }
    }

    /// The task this event concerns, if any.
    pub fn task(&self) -> Option<&TaskName> {
        match self {
            Event::TaskClaimed { task, .. }
            | Event::TaskSkipped { task, .. }
            | Event::TaskCompleted { task, .. }
            | Event::TaskFailed { task, .. }
            | Event::HandlerUnresolved { task, .. }
            | Event::ClaimFailed { task, .. }
            | Event::ReleaseFailed { task, .. }
            | Event::TaskRecovered { task, .. } => Some(task),
            Event::PassStarted { task_filter, .. } => task_filter.as_ref(),
            Event::PassCompleted { .. }
            | Event::DaemonStarted { .. }
            | Event::DaemonStopped { .. } => None,
        }
    }

    /// Create a PassStarted event.
    pub fn pass_started(
        pass_id: PassId,
        site: SiteId,
        task_filter: Option<TaskName>,
        force: bool,
    ) -> Self {
        Event::PassStarted {
            pass_id,
            site,
            task_filter,
            force,
            timestamp: Instant::now(),
        }
    }

    /// Create a PassCompleted event.
    pub fn pass_completed(
        pass_id: PassId,
        executed: usize,
        skipped: usize,
        duration: Duration,
    ) -> Self {
        Event::PassCompleted {
            pass_id,
            executed,
            skipped,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskClaimed event.
    pub fn task_claimed(pass_id: PassId, task: TaskName) -> Self {
        Event::TaskClaimed {
            pass_id,
            task,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskSkipped event.
    pub fn task_skipped(pass_id: PassId, task: TaskName, reason: SkipReason) -> Self {
        Event::TaskSkipped {
            pass_id,
            task,
            reason,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskCompleted event.
    pub fn task_completed(pass_id: PassId, task: TaskName, duration: Duration) -> Self {
        Event::TaskCompleted {
            pass_id,
            task,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskFailed event.
    pub fn task_failed(pass_id: PassId, task: TaskName, error: String, duration: Duration) -> Self {
        Event::TaskFailed {
            pass_id,
            task,
            error,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a HandlerUnresolved event.
    pub fn handler_unresolved(pass_id: PassId, task: TaskName, error: String) -> Self {
        Event::HandlerUnresolved {
            pass_id,
            task,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a ClaimFailed event.
    pub fn claim_failed(pass_id: PassId, task: TaskName, error: String) -> Self {
        Event::ClaimFailed {
            pass_id,
            task,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a ReleaseFailed event.
    pub fn release_failed(pass_id: Option<PassId>, task: TaskName, error: String) -> Self {
        Event::ReleaseFailed {
            pass_id,
            task,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a TaskRecovered event.
    pub fn task_recovered(task: TaskName) -> Self {
        Event::TaskRecovered {
            task,
            timestamp: Instant::now(),
        }
    }

    /// Create a DaemonStarted event.
    pub fn daemon_started(pid: u32) -> Self {
        Event::DaemonStarted {
            pid,
            timestamp: Instant::now(),
        }
    }

    /// Create a DaemonStopped event.
    pub fn daemon_stopped(passes: u64, reason: StopReason) -> Self {
        Event::DaemonStopped {
            passes,
            reason,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    ///
    /// A handler that panics is logged and skipped; the rest still see the event.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            if let Err(payload) = AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                tracing::error!(error = %panic_message(payload), "event handler panicked");
            }
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
