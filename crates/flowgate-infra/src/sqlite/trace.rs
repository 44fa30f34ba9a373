//! SQLite trace repository implementation.
//!
//! Implements `TraceRepository` from `flowgate-core` over the append-only
//! `trace_entries` table. The `(run_id, sequence)` primary key enforces the
//! total order; `kind` and `node_id` are denormalized for ad-hoc queries.

use flowgate_core::repository::trace::TraceRepository;
use flowgate_types::error::RepositoryError;
use flowgate_types::trace::{TraceEntry, TraceEvent};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid, write_error};

/// SQLite-backed implementation of `TraceRepository`.
pub struct SqliteTraceRepository {
    pool: DatabasePool,
}

impl SqliteTraceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn event_columns(event: &TraceEvent) -> (&'static str, Option<&str>) {
    match event {
        TraceEvent::RunStatus { .. } => ("run_status", None),
        TraceEvent::NodeStatus { node_id, .. } => ("node_status", Some(node_id.as_str())),
        TraceEvent::Step(step) => ("step", Some(step.step_id.as_str())),
        TraceEvent::Breakpoint { node_id, .. } => ("breakpoint", Some(node_id.as_str())),
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<TraceEntry, RepositoryError> {
    let entry: String = row
        .try_get("entry")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let entry: TraceEntry = serde_json::from_str(&entry)
        .map_err(|e| RepositoryError::Query(format!("invalid trace entry JSON: {e}")))?;

    let run_id: String = row
        .try_get("run_id")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    if parse_uuid(&run_id)? != entry.run_id {
        return Err(RepositoryError::Query(format!(
            "trace entry {} stored under run {run_id}",
            entry.sequence
        )));
    }
    Ok(entry)
}

impl TraceRepository for SqliteTraceRepository {
    async fn append(&self, entry: &TraceEntry) -> Result<(), RepositoryError> {
        let json = serde_json::to_string(entry)
            .map_err(|e| RepositoryError::Query(format!("serialize trace entry: {e}")))?;
        let (kind, node_id) = event_columns(&entry.event);

        sqlx::query(
            r#"INSERT INTO trace_entries (run_id, sequence, kind, node_id, recorded_at, entry)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.run_id.to_string())
        .bind(entry.sequence as i64)
        .bind(kind)
        .bind(node_id)
        .bind(format_datetime(&entry.recorded_at))
        .bind(&json)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            write_error(e, || {
                format!("run {} already has trace entry {}", entry.run_id, entry.sequence)
            })
        })?;

        Ok(())
    }

    async fn list_entries(&self, run_id: &Uuid) -> Result<Vec<TraceEntry>, RepositoryError> {
        let rows = sqlx::query("SELECT run_id, entry FROM trace_entries WHERE run_id = ? ORDER BY sequence ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn last_sequence(&self, run_id: &Uuid) -> Result<u64, RepositoryError> {
        let (last,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) FROM trace_entries WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(last.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
