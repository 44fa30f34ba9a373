//! SQLite storage layer.
//!
//! Run-state and trace repositories backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod pool;
pub mod run_state;
pub mod trace;

use chrono::{DateTime, Utc};
use flowgate_types::error::RepositoryError;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Map a write error, turning UNIQUE violations into `Conflict`.
fn write_error(e: sqlx::Error, conflict: impl FnOnce() -> String) -> RepositoryError {
    match e {
        sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE") => {
            RepositoryError::Conflict(conflict())
        }
        e => RepositoryError::Query(e.to_string()),
    }
}
