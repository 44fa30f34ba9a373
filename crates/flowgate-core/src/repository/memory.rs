//! In-memory repository adapters.
//!
//! Same contracts as the SQLite adapters in flowgate-infra (sequence
//! compare-and-swap, append-only traces) without durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use flowgate_types::breakpoint::BreakpointRequest;
use flowgate_types::error::RepositoryError;
use flowgate_types::trace::TraceEntry;
use uuid::Uuid;

use crate::workflow::checkpoint::SuspendedRun;

use super::run_state::RunStateRepository;
use super::trace::TraceRepository;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunStore {
    runs: HashMap<Uuid, SuspendedRun>,
    archived: HashMap<Uuid, Vec<BreakpointRequest>>,
}

/// Suspended runs held in a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryRunStateRepository {
    inner: Mutex<RunStore>,
}

impl InMemoryRunStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolved requests archived for a run, in archive order.
    pub fn archived(&self, run_id: &Uuid) -> Vec<BreakpointRequest> {
        self.lock().archived.get(run_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, RunStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunStateRepository for InMemoryRunStateRepository {
    async fn save_suspended(&self, run: &SuspendedRun, expected_sequence: Option<u64>) -> Result<(), RepositoryError> {
        let mut store = self.lock();
        let current = store.runs.get(&run.run_id).map(|r| r.sequence);
        match (expected_sequence, current) {
            (None, None) => {}
            (Some(expected), Some(stored)) if expected == stored => {}
            (_, stored) => {
                return Err(RepositoryError::Conflict(format!(
                    "run {} expected sequence {expected_sequence:?}, stored {stored:?}",
                    run.run_id
                )));
            }
        }
        store.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_suspended(&self, run_id: &Uuid) -> Result<Option<SuspendedRun>, RepositoryError> {
        Ok(self.lock().runs.get(run_id).cloned())
    }

    async fn find_by_request(&self, request_id: &Uuid) -> Result<Option<SuspendedRun>, RepositoryError> {
        Ok(self
            .lock()
            .runs
            .values()
            .find(|run| run.request(*request_id).is_some())
            .cloned())
    }

    async fn list_pending(&self, approver: Option<&str>) -> Result<Vec<BreakpointRequest>, RepositoryError> {
        let store = self.lock();
        let mut pending: Vec<BreakpointRequest> = store
            .runs
            .values()
            .flat_map(|run| run.pending())
            .filter(|r| approver.is_none_or(|a| r.accepts(a)))
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.id));
        Ok(pending)
    }

    async fn archive(
        &self,
        run_id: &Uuid,
        expected_sequence: u64,
        resolved: &[BreakpointRequest],
    ) -> Result<(), RepositoryError> {
        let mut store = self.lock();
        match store.runs.get(run_id).map(|r| r.sequence) {
            None => return Err(RepositoryError::NotFound),
            Some(stored) if stored != expected_sequence => {
                return Err(RepositoryError::Conflict(format!(
                    "run {run_id} expected sequence {expected_sequence}, stored {stored}"
                )));
            }
            Some(_) => {}
        }
        store.runs.remove(run_id);
        store
            .archived
            .entry(*run_id)
            .or_default()
            .extend(resolved.iter().cloned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// Trace entries held per run in a concurrent map.
#[derive(Default)]
pub struct InMemoryTraceRepository {
    entries: DashMap<Uuid, BTreeMap<u64, TraceEntry>>,
}

impl InMemoryTraceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TraceRepository for InMemoryTraceRepository {
    async fn append(&self, entry: &TraceEntry) -> Result<(), RepositoryError> {
        let mut run = self.entries.entry(entry.run_id).or_default();
        if run.contains_key(&entry.sequence) {
            return Err(RepositoryError::Conflict(format!(
                "run {} already has trace entry {}",
                entry.run_id, entry.sequence
            )));
        }
        run.insert(entry.sequence, entry.clone());
        Ok(())
    }

    async fn list_entries(&self, run_id: &Uuid) -> Result<Vec<TraceEntry>, RepositoryError> {
        Ok(self
            .entries
            .get(run_id)
            .map(|run| run.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn last_sequence(&self, run_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self
            .entries
            .get(run_id)
            .and_then(|run| run.keys().next_back().copied())
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
