//! Session row expiry.

use async_trait::async_trait;
use chrono::Duration;
use std::path::PathBuf;
use std::sync::Arc;

use super::retention::{Cutoff, delete_before};
use crate::core::clock::{Clock, SystemClock};
use crate::core::task::{TaskError, TaskHandler};

/// Deletes rows whose activity column (epoch seconds) is older than the
/// configured age.
///
/// Opens its own connection per run: the session table usually lives in the
/// application database, not the scheduler's store.
pub struct ExpireSessions {
    database: PathBuf,
    table: String,
    column: String,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl ExpireSessions {
    /// `table` and `column` are interpolated into SQL; config validation only
    /// admits plain identifiers.
    pub fn new(
        database: impl Into<PathBuf>,
        table: impl Into<String>,
        column: impl Into<String>,
        max_age_hours: u32,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            column: column.into(),
            max_age: Duration::hours(i64::from(max_age_hours)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl TaskHandler for ExpireSessions {
    fn name(&self) -> &str {
        "expire_sessions"
    }

    async fn execute(&self) -> Result<(), TaskError> {
        let cutoff = Cutoff::EpochSeconds((self.clock.now() - self.max_age).timestamp());
        let deleted = delete_before(&self.database, &self.table, &self.column, cutoff).await?;

        if deleted > 0 {
            tracing::info!(table = %self.table, deleted, "expired sessions removed");
        } else {
            tracing::debug!(table = %self.table, "no expired sessions");
        }
        Ok(())
    }
}
