//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (flowgate-infra) implements. The core crate never depends on any specific
//! storage technology; [`memory`] holds in-process adapters used by tests and
//! embedders that do not need durability.

pub mod memory;
pub mod run_state;
pub mod trace;
