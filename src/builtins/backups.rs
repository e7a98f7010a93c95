//! Backup freshness check.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::core::task::{TaskError, TaskHandler};
use crate::core::types::TaskName;
use crate::storage::TaskStore;

/// Newest `backup_*.sql` in `dir` and its modification time.
pub async fn latest_backup(dir: &Path) -> std::io::Result<Option<(PathBuf, SystemTime)>> {
    let mut newest: Option<(PathBuf, SystemTime)> = None;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("backup_") && name.ends_with(".sql")) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified()?;
        if newest.as_ref().is_none_or(|(_, t)| modified > *t) {
            newest = Some((entry.path(), modified));
        }
    }
    Ok(newest)
}

/// Warns (by failing) when the newest backup is missing or too old.
///
/// With `disable_when_missing`, a directory without any backup disables the
/// owning task so it stops failing every pass until an operator steps in.
pub struct CheckBackups<S: TaskStore> {
    dir: PathBuf,
    max_age: Duration,
    disable_when_missing: bool,
    task: TaskName,
    store: Arc<S>,
}

impl<S: TaskStore> CheckBackups<S> {
    pub fn new(dir: impl Into<PathBuf>, max_age_hours: u32, store: Arc<S>) -> Self {
        Self {
            dir: dir.into(),
            max_age: Duration::from_secs(u64::from(max_age_hours) * 3600),
            disable_when_missing: false,
            task: TaskName::new("check_backups"),
            store,
        }
    }

    pub fn with_disable_when_missing(mut self, disable: bool) -> Self {
        self.disable_when_missing = disable;
        self
    }

    /// Task disabled by `disable_when_missing`.
    pub fn with_task(mut self, task: impl Into<TaskName>) -> Self {
        self.task = task.into();
        self
    }

    async fn missing(&self, reason: &str) -> Result<(), TaskError> {
        tracing::warn!(dir = %self.dir.display(), "{}", reason);
        if self.disable_when_missing {
            self.store
                .set_active(&self.task, false)
                .await
                .map_err(|e| TaskError::Other(Box::new(e)))?;
            tracing::warn!(task = %self.task, "task disabled until backups exist");
        }
        Err(TaskError::ExecutionFailed(format!(
            "{}: {}",
            reason,
            self.dir.display()
        )))
    }
}

#[async_trait]
impl<S: TaskStore + 'static> TaskHandler for CheckBackups<S> {
    fn name(&self) -> &str {
        "check_backups"
    }

    async fn execute(&self) -> Result<(), TaskError> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return self.missing("backup directory not found").await;
        }

        let Some((path, modified)) = latest_backup(&self.dir).await? else {
            return self.missing("no backup files found").await;
        };

        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        let age_hours = age.as_secs_f64() / 3600.0;
        let file = path.file_name().map(|n| n.to_string_lossy().into_owned());

        if age > self.max_age {
            tracing::warn!(file = ?file, age_hours, "latest backup is old");
            return Err(TaskError::ExecutionFailed(format!(
                "latest backup is {:.1} hours old",
                age_hours
            )));
        }

        tracing::debug!(file = ?file, age_hours, "backup validation passed");
        Ok(())
    }
}
