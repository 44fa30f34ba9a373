//! Workflow engine and repository trait definitions for flowgate.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, together with the execution engine itself. It depends
//! only on `flowgate-types` -- never on `flowgate-infra` or any database/IO
//! crate.

pub mod event;
pub mod repository;
pub mod workflow;
