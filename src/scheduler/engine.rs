//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Reading the eligible tasks in `sort_order`
//! - Gating each one through the claim protocol
//! - Resolving and invoking the handler
//! - Releasing the claim on every path
//! - Event emission
//!
//! Handlers run inline on the pass's own future. Dropping a pass therefore
//! drops the handler with it, so once the recovery hook has released a claim
//! nothing of the abandoned run is still executing.

use chrono::Utc;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use super::recovery::{RecoveryHook, RunContext};
use super::types::{PassReport, PassRequest, SchedulerError, TaskOutcome};
use crate::core::task::{TaskError, panic_message};
use crate::core::types::{PassId, TaskName};
use crate::events::{Event, EventBus, SkipReason};
use crate::registry::HandlerRegistry;
use crate::storage::{StoredTask, TaskStore};

/// Runs passes over the task registry.
pub struct Scheduler<S: TaskStore> {
    /// Storage backend.
    storage: Arc<S>,
    /// Handler lookup.
    registry: Arc<HandlerRegistry>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Current-claim marker shared with the recovery hook.
    context: Arc<RunContext>,
}

impl<S: TaskStore + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            storage,
            registry: Arc::new(HandlerRegistry::new()),
            event_bus: Arc::new(EventBus::new()),
            context: Arc::new(RunContext::new()),
        }
    }

    /// Set the handler registry.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Get the storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Get the handler registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// The execution context holding the current-claim marker.
    pub fn run_context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// A hook that releases whatever claim this scheduler holds.
    pub fn recovery_hook(&self) -> RecoveryHook<S> {
        RecoveryHook::new(
            Arc::clone(&self.context),
            Arc::clone(&self.storage),
            Arc::clone(&self.event_bus),
        )
    }

    /// Run one pass over every eligible task.
    ///
    /// Tasks are visited strictly one after another. Contention, handler
    /// failures and unresolvable handlers are recorded in the report and the
    /// pass moves on. Only a failed registry read or a failed release aborts.
    pub async fn run_pass(&self, request: &PassRequest) -> Result<PassReport, SchedulerError> {
        let pass_id = PassId::new();
        let started = Instant::now();

        tracing::debug!(
            pass_id = %pass_id,
            site = %request.site,
            task = ?request.task_filter.as_ref().map(TaskName::as_str),
            force = request.force,
            "pass started"
        );
        self.event_bus
            .emit(Event::pass_started(
                pass_id.clone(),
                request.site.clone(),
                request.task_filter.clone(),
                request.force,
            ))
            .await;

        let tasks = self
            .storage
            .list_eligible(request.task_filter.as_ref(), request.force)
            .await
            .inspect_err(|e| tracing::error!(pass_id = %pass_id, error = %e, "failed to read task registry"))?;

        let mut report = PassReport::new(pass_id.clone(), request.site.clone(), Utc::now());
        for task in tasks {
            let outcome = self.run_task(&pass_id, &task, request.force).await?;
            report.push(task.name, outcome);
        }

        let duration = started.elapsed();
        tracing::debug!(
            pass_id = %pass_id,
            executed = report.executed(),
            skipped = report.skipped(),
            duration_ms = duration.as_millis() as u64,
            "pass completed"
        );
        self.event_bus
            .emit(Event::pass_completed(
                pass_id,
                report.executed(),
                report.skipped(),
                duration,
            ))
            .await;

        Ok(report)
    }

    /// Claim, execute and release a single task.
    async fn run_task(
        &self,
        pass_id: &PassId,
        task: &StoredTask,
        force: bool,
    ) -> Result<TaskOutcome, SchedulerError> {
        // The snapshot may be stale; the claim below re-checks under the row lock.
        if !task.active {
            return Ok(self.skip(pass_id, task, SkipReason::Inactive).await);
        }
        if task.running {
            return Ok(self.skip(pass_id, task, SkipReason::AlreadyRunning).await);
        }

        match self
            .storage
            .try_claim(&task.name, task.interval_minutes, force)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(self.skip(pass_id, task, SkipReason::NotClaimed).await),
            Err(e) => {
                tracing::warn!(pass_id = %pass_id, task = %task.name, error = %e, "claim failed");
                self.event_bus
                    .emit(Event::claim_failed(
                        pass_id.clone(),
                        task.name.clone(),
                        e.to_string(),
                    ))
                    .await;
                return Ok(TaskOutcome::ClaimError {
                    error: e.to_string(),
                });
            }
        }

        self.context.mark(task.name.clone());
        tracing::info!(pass_id = %pass_id, task = %task.name, handler = %task.handler, "task claimed");

        // Nothing between claim and release may unwind past the release.
        let claimed = async {
            self.event_bus
                .emit(Event::task_claimed(pass_id.clone(), task.name.clone()))
                .await;
            self.execute(pass_id, task).await
        };
        let outcome = match AssertUnwindSafe(claimed).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let error = TaskError::Panicked(panic_message(payload));
                tracing::error!(pass_id = %pass_id, task = %task.name, error = %error, "task aborted");
                TaskOutcome::Failed {
                    error: error.to_string(),
                }
            }
        };
        self.release(pass_id, &task.name).await?;
        Ok(outcome)
    }

    async fn skip(&self, pass_id: &PassId, task: &StoredTask, reason: SkipReason) -> TaskOutcome {
        tracing::debug!(pass_id = %pass_id, task = %task.name, reason = %reason, "task skipped");
        self.event_bus
            .emit(Event::task_skipped(
                pass_id.clone(),
                task.name.clone(),
                reason,
            ))
            .await;
        TaskOutcome::skipped(reason)
    }

    /// Resolve and invoke the handler. Never fails; failures become outcomes.
    async fn execute(&self, pass_id: &PassId, task: &StoredTask) -> TaskOutcome {
        let handler = match self.registry.resolve(task).await {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(pass_id = %pass_id, task = %task.name, error = %e, "handler unresolved");
                self.event_bus
                    .emit(Event::handler_unresolved(
                        pass_id.clone(),
                        task.name.clone(),
                        e.to_string(),
                    ))
                    .await;
                return TaskOutcome::Unresolved {
                    error: e.to_string(),
                };
            }
        };

        let started = Instant::now();
        let result = match AssertUnwindSafe(handler.execute()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
        };
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                tracing::info!(
                    pass_id = %pass_id,
                    task = %task.name,
                    duration_ms = duration.as_millis() as u64,
                    "task completed"
                );
                self.event_bus
                    .emit(Event::task_completed(
                        pass_id.clone(),
                        task.name.clone(),
                        duration,
                    ))
                    .await;
                TaskOutcome::Completed
            }
            Err(e) => {
                tracing::error!(pass_id = %pass_id, task = %task.name, error = %e, "task failed");
                self.event_bus
                    .emit(Event::task_failed(
                        pass_id.clone(),
                        task.name.clone(),
                        e.to_string(),
                        duration,
                    ))
                    .await;
                TaskOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Clear `running`, then the marker. On failure the marker stays set.
    async fn release(&self, pass_id: &PassId, name: &TaskName) -> Result<(), SchedulerError> {
        match self.storage.release(name).await {
            Ok(()) => {
                self.context.clear();
                Ok(())
            }
            Err(e) => {
                tracing::error!(pass_id = %pass_id, task = %name, error = %e, "release failed");
                self.event_bus
                    .emit(Event::release_failed(
                        Some(pass_id.clone()),
                        name.clone(),
                        e.to_string(),
                    ))
                    .await;
                Err(SchedulerError::ReleaseFailed {
                    task: name.clone(),
                    source: e,
                })
            }
        }
    }
}
