//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. The claim is a single
//! conditional `UPDATE`; SQLite serialises writers, so the affected-row count
//! tells exactly one caller that it won.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::{StorageError, StoredTask, TaskStore};
use crate::core::clock::{Clock, SystemClock};
use crate::core::types::TaskName;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SELECT_TASKS: &str = "SELECT name, handler, require_ref, active, interval_minutes, sort_order, running, next_run FROM background_tasks";

type TaskRow = (
    String,
    String,
    Option<String>,
    bool,
    i64,
    i64,
    bool,
    Option<i64>,
);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        // A single connection that never recycles; closing it drops the data.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Use a different time source for claim decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_background_tasks.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_task(row: TaskRow) -> Result<StoredTask, StorageError> {
    let (name, handler, require, active, interval, sort_order, running, next_run) = row;

    let interval_minutes = u32::try_from(interval)
        .map_err(|_| StorageError::Corrupt(format!("task {}: interval {}", name, interval)))?;
    let next_run = match next_run {
        Some(ms) => Some(millis_to_time(ms).ok_or_else(|| {
            StorageError::Corrupt(format!("task {}: next_run {}", name, ms))
        })?),
        None => None,
    };

    Ok(StoredTask {
        name: TaskName::new(name),
        handler,
        require,
        active,
        interval_minutes,
        sort_order,
        running,
        next_run,
    })
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

#[async_trait]
impl TaskStore for SqliteStorage {
    async fn list_eligible(
        &self,
        filter: Option<&TaskName>,
        force: bool,
    ) -> Result<Vec<StoredTask>, StorageError> {
        let mut sql = format!(
            "{} WHERE active = 1 AND (? OR interval_minutes > 0)",
            SELECT_TASKS
        );
        if filter.is_some() {
            sql.push_str(" AND name = ?");
        }
        sql.push_str(" ORDER BY sort_order, name");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(force);
        if let Some(name) = filter {
            query = query.bind(name.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(row_to_task).collect()
    }

    async fn get_task(&self, name: &TaskName) -> Result<StoredTask, StorageError> {
        let row: TaskRow = sqlx::query_as(&format!("{} WHERE name = ?", SELECT_TASKS))
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", name)))?;

        row_to_task(row)
    }

    async fn list_tasks(&self) -> Result<Vec<StoredTask>, StorageError> {
        let rows: Vec<TaskRow> =
            sqlx::query_as(&format!("{} ORDER BY sort_order, name", SELECT_TASKS))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(row_to_task).collect()
    }

    async fn try_claim(
        &self,
        name: &TaskName,
        interval_minutes: u32,
        force: bool,
    ) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let next_run = now + Duration::minutes(i64::from(interval_minutes));

        let result = sqlx::query(
            r#"
            UPDATE background_tasks SET running = 1, next_run = ?
            WHERE name = ? AND running < 1 AND (? OR next_run IS NULL OR ? > next_run)
            "#,
        )
        .bind(next_run.timestamp_millis())
        .bind(name.as_str())
        .bind(force)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, name: &TaskName) -> Result<(), StorageError> {
        sqlx::query("UPDATE background_tasks SET running = 0 WHERE name = ?")
            .bind(name.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn upsert_task(&self, task: StoredTask) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO background_tasks
                (name, handler, require_ref, active, interval_minutes, sort_order, running, next_run)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                handler = excluded.handler,
                require_ref = excluded.require_ref,
                active = excluded.active,
                interval_minutes = excluded.interval_minutes,
                sort_order = excluded.sort_order
            "#,
        )
        .bind(task.name.as_str())
        .bind(&task.handler)
        .bind(&task.require)
        .bind(task.active)
        .bind(i64::from(task.interval_minutes))
        .bind(task.sort_order)
        .bind(task.running)
        .bind(task.next_run.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn set_active(&self, name: &TaskName, active: bool) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE background_tasks SET active = ? WHERE name = ?")
            .bind(active)
            .bind(name.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task: {}", name)));
        }
        Ok(())
    }
}
