//! Built-in maintenance handlers.
//!
//! Each handler is registered under a fixed reference (`prune_logs`,
//! `prune_cache`, `check_backups`, `expire_sessions`, `optimize_store`) when
//! its settings are present. Tasks opt in by naming the reference.

mod backups;
mod files;
#[cfg(feature = "sqlite")]
mod optimize;
#[cfg(feature = "sqlite")]
mod retention;
#[cfg(feature = "sqlite")]
mod sessions;

pub use backups::{CheckBackups, latest_backup};
pub use files::{PruneStats, Pruner, is_log_file, prune_dir};
#[cfg(feature = "sqlite")]
pub use optimize::{AuditRetention, OptimizeStore};
#[cfg(feature = "sqlite")]
pub use sessions::ExpireSessions;

use std::sync::Arc;

use crate::config::BuiltinsConfig;
use crate::registry::HandlerRegistry;
use crate::storage::TaskStore;

/// Register every configured built-in handler.
///
/// `store` is handed to handlers that disable their own task.
pub fn register_builtins<S: TaskStore + 'static>(
    registry: &mut HandlerRegistry,
    config: &BuiltinsConfig,
    store: Arc<S>,
) {
    if let Some(logs) = &config.prune_logs {
        registry.register_handler(Arc::new(Pruner::logs(logs.dirs.clone(), logs.keep_days)));
    }

    if let Some(cache) = &config.prune_cache {
        registry.register_handler(Arc::new(Pruner::cache(
            cache.dirs.clone(),
            cache.max_age_hours,
        )));
    }

    if let Some(backups) = &config.check_backups {
        let mut check = CheckBackups::new(&backups.dir, backups.max_age_hours, store)
            .with_disable_when_missing(backups.disable_when_missing);
        if let Some(task) = &backups.task {
            check = check.with_task(task.as_str());
        }
        registry.register_handler(Arc::new(check));
    }

    #[cfg(feature = "sqlite")]
    {
        if let Some(sessions) = &config.expire_sessions {
            registry.register_handler(Arc::new(ExpireSessions::new(
                &sessions.database,
                sessions.table.as_str(),
                sessions.column.as_str(),
                sessions.max_age_hours,
            )));
        }
    }
    #[cfg(not(feature = "sqlite"))]
    {
        if config.expire_sessions.is_some() {
            tracing::warn!("expire_sessions needs the sqlite feature, handler not registered");
        }
        if config.audit_retention.is_some() {
            tracing::warn!("audit_retention needs the sqlite feature, ignored");
        }
    }
}

/// `optimize_store` for a SQLite store, with audit retention when configured.
#[cfg(feature = "sqlite")]
pub fn store_maintenance(pool: sqlx::SqlitePool, config: &BuiltinsConfig) -> OptimizeStore {
    let optimize = OptimizeStore::new(pool);
    match &config.audit_retention {
        Some(audit) => optimize.with_audit_retention(AuditRetention::new(
            &audit.database,
            audit.table.as_str(),
            audit.column.as_str(),
            audit.max_age_days,
        )),
        None => optimize,
    }
}
