//! File-age based cleanup shared by `prune_logs` and `prune_cache`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::core::task::{TaskError, TaskHandler};

/// What one cleanup removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub files: u64,
    pub bytes: u64,
    /// Entries that could not be inspected or removed.
    pub skipped: u64,
}

/// Delete every file under `dir` (recursively) last modified before `cutoff`
/// whose file name satisfies `matches`. A missing directory is not an error.
///
/// An entry that fails (rotated away mid-walk, permission denied) is logged
/// and skipped; the walk carries on with the rest.
pub async fn prune_dir(
    dir: &Path,
    cutoff: SystemTime,
    matches: impl Fn(&str) -> bool,
) -> std::io::Result<PruneStats> {
    let mut stats = PruneStats::default();
    if !tokio::fs::try_exists(dir).await? {
        tracing::debug!(dir = %dir.display(), "cleanup directory missing, skipped");
        return Ok(stats);
    }

    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %current.display(), error = %e, "cannot read directory, skipped");
                stats.skipped += 1;
                continue;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %current.display(), error = %e, "directory listing interrupted");
                    stats.skipped += 1;
                    break;
                }
            };
            let path = entry.path();
            match prune_entry(&entry, cutoff, &matches).await {
                Ok(Visit::Dir) => pending.push(path),
                Ok(Visit::Kept) => {}
                Ok(Visit::Removed(bytes)) => {
                    stats.files += 1;
                    stats.bytes += bytes;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cleanup skipped entry");
                    stats.skipped += 1;
                }
            }
        }
    }

    Ok(stats)
}

enum Visit {
    Dir,
    Kept,
    Removed(u64),
}

async fn prune_entry(
    entry: &tokio::fs::DirEntry,
    cutoff: SystemTime,
    matches: &impl Fn(&str) -> bool,
) -> std::io::Result<Visit> {
    let file_type = entry.file_type().await?;
    if file_type.is_dir() {
        return Ok(Visit::Dir);
    }
    if !file_type.is_file() || !matches(&entry.file_name().to_string_lossy()) {
        return Ok(Visit::Kept);
    }

    let metadata = entry.metadata().await?;
    if metadata.modified()? >= cutoff {
        return Ok(Visit::Kept);
    }
    tokio::fs::remove_file(entry.path()).await?;
    Ok(Visit::Removed(metadata.len()))
}

/// `*.log` and rotated `*.log.N`.
pub fn is_log_file(name: &str) -> bool {
    if name.ends_with(".log") {
        return true;
    }
    match name.rsplit_once(".log.") {
        Some((stem, suffix)) => {
            !stem.is_empty() && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Removes old files under a set of directories.
pub struct Pruner {
    name: &'static str,
    dirs: Vec<PathBuf>,
    max_age: Duration,
    filter: fn(&str) -> bool,
}

impl Pruner {
    /// `prune_logs`: rotated log files older than `keep_days`.
    pub fn logs(dirs: Vec<PathBuf>, keep_days: u32) -> Self {
        Self {
            name: "prune_logs",
            dirs,
            max_age: Duration::from_secs(u64::from(keep_days) * 24 * 3600),
            filter: is_log_file,
        }
    }

    /// `prune_cache`: any file older than `max_age_hours`.
    pub fn cache(dirs: Vec<PathBuf>, max_age_hours: u32) -> Self {
        Self {
            name: "prune_cache",
            dirs,
            max_age: Duration::from_secs(u64::from(max_age_hours) * 3600),
            filter: |_| true,
        }
    }
}

#[async_trait]
impl TaskHandler for Pruner {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self) -> Result<(), TaskError> {
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for dir in &self.dirs {
            let stats = prune_dir(dir, cutoff, self.filter).await?;
            if stats.files > 0 || stats.skipped > 0 {
                tracing::info!(
                    handler = self.name,
                    dir = %dir.display(),
                    deleted_files = stats.files,
                    freed_bytes = stats.bytes,
                    skipped = stats.skipped,
                    "removed expired files"
                );
            }
        }
        Ok(())
    }
}
