//! warden - background maintenance tasks with database-backed mutual exclusion.

pub mod builtins;
pub mod config;
pub mod core;
pub mod daemon;
pub mod events;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::task::{Extension, TaskError, TaskHandler};
pub use core::types::{PassId, SiteId, TaskName};

pub use config::{ConfigError, ServiceConfig, StorageConfig, TaskSeed, YamlLoader, seed_tasks};
pub use daemon::{
    Daemon, DaemonConfig, DaemonError, DaemonHandle, DaemonState, DaemonSummary, InstanceMarker,
    StopReason,
};
pub use events::{Event, EventBus, EventHandler, SkipReason};
pub use registry::{HandlerRegistry, ResolveError};
pub use scheduler::{
    ALL_TASKS, PassReport, PassRequest, RecoveryHook, RunContext, Scheduler, SchedulerError,
    TaskOutcome, TaskReport,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, StorageError, StoredTask, TaskStore};
