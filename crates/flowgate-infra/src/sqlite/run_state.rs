//! SQLite run-state repository implementation.
//!
//! Implements `RunStateRepository` from `flowgate-core`. A suspended run is
//! stored as one JSON blob in `suspended_runs`; its breakpoint requests are
//! mirrored into `breakpoint_requests` so pending requests can be listed and
//! looked up by id without decoding every run. Resolved requests stay in that
//! table after their run is archived.

use flowgate_core::repository::run_state::RunStateRepository;
use flowgate_core::workflow::checkpoint::SuspendedRun;
use flowgate_types::breakpoint::BreakpointRequest;
use flowgate_types::error::RepositoryError;
use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, write_error};

/// SQLite-backed implementation of `RunStateRepository`.
pub struct SqliteRunStateRepository {
    pool: DatabasePool,
}

impl SqliteRunStateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SuspendedRunRow {
    state: String,
}

impl SuspendedRunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            state: row.try_get("state")?,
        })
    }

    fn into_run(self) -> Result<SuspendedRun, RepositoryError> {
        serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid suspended run JSON: {e}")))
    }
}

fn decode_request(row: &sqlx::sqlite::SqliteRow) -> Result<BreakpointRequest, RepositoryError> {
    let request: String = row
        .try_get("request")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&request)
        .map_err(|e| RepositoryError::Query(format!("invalid breakpoint request JSON: {e}")))
}

fn status_str(request: &BreakpointRequest) -> Result<String, RepositoryError> {
    Ok(serde_json::to_value(request.status)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .as_str()
        .unwrap_or("pending")
        .to_string())
}

async fn upsert_request(conn: &mut SqliteConnection, request: &BreakpointRequest) -> Result<(), RepositoryError> {
    let json = serde_json::to_string(request)
        .map_err(|e| RepositoryError::Query(format!("serialize breakpoint request: {e}")))?;

    sqlx::query(
        r#"INSERT INTO breakpoint_requests
           (id, run_id, node_id, status, request, created_at, deadline, resolved_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             status = excluded.status,
             request = excluded.request,
             deadline = excluded.deadline,
             resolved_at = excluded.resolved_at"#,
    )
    .bind(request.id.to_string())
    .bind(request.run_id.to_string())
    .bind(&request.node_id)
    .bind(status_str(request)?)
    .bind(&json)
    .bind(format_datetime(&request.created_at))
    .bind(request.deadline.as_ref().map(format_datetime))
    .bind(request.resolved_at.as_ref().map(format_datetime))
    .execute(&mut *conn)
    .await
    .map_err(|e| RepositoryError::Query(e.to_string()))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// RunStateRepository impl
// ---------------------------------------------------------------------------

impl RunStateRepository for SqliteRunStateRepository {
    async fn save_suspended(&self, run: &SuspendedRun, expected_sequence: Option<u64>) -> Result<(), RepositoryError> {
        let state = serde_json::to_string(run)
            .map_err(|e| RepositoryError::Query(format!("serialize suspended run: {e}")))?;

        // Run row and request rows commit together.
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match expected_sequence {
            None => {
                sqlx::query(
                    r#"INSERT INTO suspended_runs
                       (run_id, workflow_name, sequence, state, started_at, suspended_at)
                       VALUES (?, ?, ?, ?, ?, ?)"#,
                )
                .bind(run.run_id.to_string())
                .bind(&run.graph.name)
                .bind(run.sequence as i64)
                .bind(&state)
                .bind(format_datetime(&run.started_at))
                .bind(format_datetime(&run.suspended_at))
                .execute(&mut *tx)
                .await
                .map_err(|e| write_error(e, || format!("run {} is already suspended", run.run_id)))?;
            }
            Some(expected) => {
                let result = sqlx::query(
                    "UPDATE suspended_runs SET sequence = ?, state = ?, suspended_at = ? WHERE run_id = ? AND sequence = ?",
                )
                .bind(run.sequence as i64)
                .bind(&state)
                .bind(format_datetime(&run.suspended_at))
                .bind(run.run_id.to_string())
                .bind(expected as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

                if result.rows_affected() == 0 {
                    return Err(RepositoryError::Conflict(format!(
                        "run {} is no longer at sequence {expected}",
                        run.run_id
                    )));
                }
            }
        }

        for request in &run.requests {
            upsert_request(&mut tx, request).await?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load_suspended(&self, run_id: &Uuid) -> Result<Option<SuspendedRun>, RepositoryError> {
        let row = sqlx::query("SELECT state FROM suspended_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = SuspendedRunRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn find_by_request(&self, request_id: &Uuid) -> Result<Option<SuspendedRun>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT sr.state FROM suspended_runs sr
               JOIN breakpoint_requests br ON br.run_id = sr.run_id
               WHERE br.id = ?"#,
        )
        .bind(request_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let run = SuspendedRunRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_run()?;
        Ok(run.request(*request_id).is_some().then_some(run))
    }

    async fn list_pending(&self, approver: Option<&str>) -> Result<Vec<BreakpointRequest>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT br.request FROM breakpoint_requests br
               JOIN suspended_runs sr ON sr.run_id = br.run_id
               WHERE br.status = 'pending'
               ORDER BY br.created_at ASC, br.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            let request = decode_request(row)?;
            if approver.is_none_or(|a| request.accepts(a)) {
                pending.push(request);
            }
        }
        Ok(pending)
    }

    async fn archive(
        &self,
        run_id: &Uuid,
        expected_sequence: u64,
        resolved: &[BreakpointRequest],
    ) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let result = sqlx::query("DELETE FROM suspended_runs WHERE run_id = ? AND sequence = ?")
            .bind(run_id.to_string())
            .bind(expected_sequence as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            let stored: Option<(i64,)> = sqlx::query_as("SELECT sequence FROM suspended_runs WHERE run_id = ?")
                .bind(run_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            return Err(match stored {
                Some((stored,)) => RepositoryError::Conflict(format!(
                    "run {run_id} expected sequence {expected_sequence}, stored {stored}"
                )),
                None => RepositoryError::NotFound,
            });
        }

        for request in resolved {
            upsert_request(&mut tx, request).await?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(run_id = %run_id, archived = resolved.len(), "archived suspended run");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
