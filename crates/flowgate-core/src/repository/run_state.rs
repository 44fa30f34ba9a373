//! Run-state repository trait definition.
//!
//! Stores suspended runs together with their breakpoint requests. Every write
//! of an existing run is a compare-and-swap on its sequence number so that a
//! stale resume (two approvers racing on the same snapshot) is rejected.

use flowgate_types::breakpoint::BreakpointRequest;
use flowgate_types::error::RepositoryError;
use uuid::Uuid;

use crate::workflow::checkpoint::SuspendedRun;

/// Repository trait for suspended-run persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStateRepository: Send + Sync {
    /// Persist a suspended run atomically (context, frontier, requests).
    ///
    /// `expected_sequence = None` inserts and fails with
    /// `RepositoryError::Conflict` if the run is already stored. `Some(n)`
    /// replaces the stored run only if its sequence is still `n`.
    fn save_suspended(
        &self,
        run: &SuspendedRun,
        expected_sequence: Option<u64>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load a suspended run by ID.
    fn load_suspended(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<SuspendedRun>, RepositoryError>> + Send;

    /// Find the suspended run holding a breakpoint request.
    fn find_by_request(
        &self,
        request_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<SuspendedRun>, RepositoryError>> + Send;

    /// Pending requests, optionally restricted to those `approver` may decide,
    /// oldest first.
    fn list_pending(
        &self,
        approver: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<BreakpointRequest>, RepositoryError>> + Send;

    /// Remove a suspended run (compare-and-swap on its sequence) and record
    /// the final state of its resolved requests.
    fn archive(
        &self,
        run_id: &Uuid,
        expected_sequence: u64,
        resolved: &[BreakpointRequest],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
