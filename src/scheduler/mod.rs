//! Execution loop and crash recovery.
//!
//! A [`Scheduler`] runs passes: it reads the eligible tasks, claims each one
//! through the store, invokes its handler and releases it again. The
//! [`RecoveryHook`] covers the case where a pass never gets to that release.

mod engine;
mod recovery;
mod types;

pub use engine::Scheduler;
pub use recovery::{RecoveryHook, RunContext};
pub use types::{ALL_TASKS, PassReport, PassRequest, SchedulerError, TaskOutcome, TaskReport};
