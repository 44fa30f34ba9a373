//! Trace repository trait definition.
//!
//! An append-only, run-keyed log. Entries are never updated or deleted.

use flowgate_types::error::RepositoryError;
use flowgate_types::trace::TraceEntry;
use uuid::Uuid;

/// Repository trait for execution traces.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TraceRepository: Send + Sync {
    /// Append one entry. Fails with `RepositoryError::Conflict` if the run
    /// already has an entry with the same sequence number.
    fn append(
        &self,
        entry: &TraceEntry,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All entries of a run, ordered by sequence.
    fn list_entries(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TraceEntry>, RepositoryError>> + Send;

    /// Highest sequence recorded for a run (0 when empty).
    fn last_sequence(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
