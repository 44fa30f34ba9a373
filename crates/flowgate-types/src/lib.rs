//! Shared domain types for flowgate.
//!
//! This crate contains the serializable types exchanged between the engine,
//! its storage adapters and external callers: items and step results, the
//! workflow graph definition, breakpoint requests, trace entries and events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod breakpoint;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod item;
pub mod trace;
pub mod workflow;
