//! Configuration type definitions.
//!
//! The service file (`warden.yaml`) carries process settings, the store
//! location per site, task seeds, and settings for the built-in handlers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::types::SiteId;
use crate::storage::StoredTask;

/// Service configuration (warden.yaml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Default log filter, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Write logs to this file (rotated daily) instead of stderr.
    pub log_file: Option<PathBuf>,
    /// Single-instance marker for daemon mode.
    pub pid_file: PathBuf,
    /// Daemon run-time cap in seconds; 0 disables the cap.
    pub max_execution_time_secs: u64,
    /// Daemon idle wait between passes, in seconds.
    pub sleep_interval_secs: u64,
    /// Store used when a site has no override.
    pub database: StorageConfig,
    /// Per-site overrides.
    pub sites: HashMap<String, SiteConfig>,
    /// Descriptors written by `warden seed`.
    pub tasks: Vec<TaskSeed>,
    /// Settings for the built-in handlers.
    pub builtins: BuiltinsConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            pid_file: PathBuf::from("warden.pid"),
            max_execution_time_secs: 3600,
            sleep_interval_secs: 60,
            database: StorageConfig::default(),
            sites: HashMap::new(),
            tasks: Vec::new(),
            builtins: BuiltinsConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Wait between daemon passes.
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    /// Daemon run-time cap, if any.
    pub fn max_run_time(&self) -> Option<Duration> {
        (self.max_execution_time_secs > 0).then(|| Duration::from_secs(self.max_execution_time_secs))
    }

    /// Store for `site`, falling back to the top-level `database`.
    pub fn database_for(&self, site: &SiteId) -> &StorageConfig {
        self.sites
            .get(site.as_str())
            .and_then(|s| s.database.as_ref())
            .unwrap_or(&self.database)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (non-persistent, no cross-process exclusion).
    #[serde(rename = "memory")]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: "warden.db".to_string(),
        }
    }
}

/// Per-site settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub database: Option<StorageConfig>,
}

/// A task descriptor to create or update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSeed {
    /// Unique task name.
    pub name: String,
    /// Handler reference; defaults to the task name.
    pub handler: Option<String>,
    /// Extension to load before the handler.
    pub require: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Minutes between runs; 0 means force-only.
    #[serde(default)]
    pub interval_minutes: u32,
    #[serde(default = "default_sort_order")]
    pub sort_order: i64,
}

fn default_true() -> bool {
    true
}

fn default_sort_order() -> i64 {
    100
}

impl TaskSeed {
    /// Handler reference this seed resolves to.
    pub fn handler(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }

    /// Descriptor for the store. Claim state starts idle and due.
    pub fn to_stored(&self) -> StoredTask {
        let mut task = StoredTask::new(self.name.as_str(), self.handler())
            .with_interval(self.interval_minutes)
            .with_sort_order(self.sort_order)
            .with_active(self.active);
        task.require = self.require.clone();
        task
    }
}

/// Settings for the built-in handlers. A handler is only registered when its
/// section is present (`optimize_store` needs a SQLite store instead).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltinsConfig {
    pub prune_logs: Option<PruneLogsConfig>,
    pub prune_cache: Option<PruneCacheConfig>,
    pub check_backups: Option<CheckBackupsConfig>,
    pub expire_sessions: Option<ExpireSessionsConfig>,
    /// Extra step for `optimize_store`.
    pub audit_retention: Option<AuditRetentionConfig>,
}

/// `prune_logs` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneLogsConfig {
    /// Directories scanned recursively for `*.log` and `*.log.N`.
    pub dirs: Vec<PathBuf>,
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,
}

fn default_keep_days() -> u32 {
    30
}

/// `prune_cache` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneCacheConfig {
    /// Directories scanned recursively for expired files.
    pub dirs: Vec<PathBuf>,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u32,
}

/// `check_backups` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckBackupsConfig {
    /// Directory holding `backup_*.sql` files.
    pub dir: PathBuf,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u32,
    /// Disable the owning task when no backup exists at all.
    #[serde(default)]
    pub disable_when_missing: bool,
    /// Task to disable; defaults to `check_backups`.
    pub task: Option<String>,
}

/// `expire_sessions` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpireSessionsConfig {
    /// SQLite database holding the session table.
    pub database: PathBuf,
    #[serde(default = "default_session_table")]
    pub table: String,
    /// Column holding the last activity as epoch seconds.
    #[serde(default = "default_session_column")]
    pub column: String,
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u32,
}

/// Audit row retention applied by `optimize_store`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRetentionConfig {
    /// SQLite database holding the audit table.
    pub database: PathBuf,
    #[serde(default = "default_audit_table")]
    pub table: String,
    /// Column holding `YYYY-MM-DD HH:MM:SS` UTC timestamps.
    #[serde(default = "default_audit_column")]
    pub column: String,
    #[serde(default = "default_audit_max_age_days")]
    pub max_age_days: u32,
}

fn default_audit_table() -> String {
    "audit_master".to_string()
}

fn default_audit_column() -> String {
    "date".to_string()
}

fn default_audit_max_age_days() -> u32 {
    183
}

fn default_max_age_hours() -> u32 {
    24
}

fn default_session_table() -> String {
    "sessions".to_string()
}

fn default_session_column() -> String {
    "last_updated".to_string()
}
