//! Age-based row deletion in an application database.

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::path::Path;

use crate::core::task::TaskError;

/// How the age column stores its timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Cutoff {
    /// Integer column, seconds since the epoch.
    EpochSeconds(i64),
    /// Text column, `YYYY-MM-DD HH:MM:SS` in UTC.
    DateTime(String),
}

/// Delete the rows of `table` whose `column` is older than `cutoff`.
///
/// Opens its own connection: these tables live in the application database,
/// not the scheduler's store. `table` and `column` are interpolated into SQL;
/// config validation only admits plain identifiers.
pub(crate) async fn delete_before(
    database: &Path,
    table: &str,
    column: &str,
    cutoff: Cutoff,
) -> Result<u64, TaskError> {
    let sql = format!("DELETE FROM \"{}\" WHERE \"{}\" < ?", table, column);

    let mut conn = SqliteConnectOptions::new()
        .filename(database)
        .connect()
        .await
        .map_err(|e| TaskError::Other(Box::new(e)))?;

    let query = sqlx::query(&sql);
    let query = match cutoff {
        Cutoff::EpochSeconds(secs) => query.bind(secs),
        Cutoff::DateTime(text) => query.bind(text),
    };
    let result = query.execute(&mut conn).await;
    // close even when the delete failed
    let close = conn.close().await;
    let deleted = result
        .map_err(|e| TaskError::Other(Box::new(e)))?
        .rows_affected();
    close.map_err(|e| TaskError::Other(Box::new(e)))?;

    Ok(deleted)
}
