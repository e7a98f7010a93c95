//! Store maintenance.

use async_trait::async_trait;
use chrono::Duration;
use sqlx::sqlite::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

use super::retention::{Cutoff, delete_before};
use crate::core::clock::{Clock, SystemClock};
use crate::core::task::{TaskError, TaskHandler};

/// Audit rows to drop once they reach a given age.
///
/// The age column holds `YYYY-MM-DD HH:MM:SS` text in UTC.
#[derive(Debug, Clone)]
pub struct AuditRetention {
    database: PathBuf,
    table: String,
    column: String,
    max_age: Duration,
}

impl AuditRetention {
    pub fn new(
        database: impl Into<PathBuf>,
        table: impl Into<String>,
        column: impl Into<String>,
        max_age_days: u32,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            column: column.into(),
            max_age: Duration::days(i64::from(max_age_days)),
        }
    }
}

/// Runs `PRAGMA optimize` and `VACUUM` on the scheduler's own store, after
/// the optional audit retention delete.
pub struct OptimizeStore {
    pool: SqlitePool,
    audit: Option<AuditRetention>,
    clock: Arc<dyn Clock>,
}

impl OptimizeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            audit: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_audit_retention(mut self, audit: AuditRetention) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl TaskHandler for OptimizeStore {
    fn name(&self) -> &str {
        "optimize_store"
    }

    async fn execute(&self) -> Result<(), TaskError> {
        if let Some(audit) = &self.audit {
            let cutoff = (self.clock.now() - audit.max_age)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string();
            let deleted =
                delete_before(&audit.database, &audit.table, &audit.column, Cutoff::DateTime(cutoff))
                    .await?;
            if deleted > 0 {
                tracing::info!(table = %audit.table, deleted, "old audit rows removed");
            }
        }

        for statement in ["PRAGMA optimize", "VACUUM"] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| TaskError::Other(Box::new(e)))?;
        }
        tracing::info!("store optimized");
        Ok(())
    }
}
