//! Infrastructure layer for flowgate.
//!
//! Implementations of the repository traits defined in `flowgate-core`
//! (SQLite run-state and trace stores) and the `flowgate.toml` loader.

pub mod config;
pub mod sqlite;
