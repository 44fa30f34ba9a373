//! Workflow engine core: definition parsing, graph scheduling, and
//! suspend/resume at human-approval breakpoints.
//!
//! This module contains the "brain" of the workflow engine:
//! - `definition` -- YAML/JSON parsing and validation entry points
//! - `dag` -- petgraph validation, cycle detection, loop-body analysis
//! - `expression` -- `${...}` resolution and condition evaluation
//! - `context` -- scoped arena of step results for one run
//! - `step` -- step contract (single / items / all) and registry
//! - `step_runner` -- runs one step node: mode dispatch, retries, timeouts
//! - `merge` / `routing` -- join strategies and branch/fork/split routing
//! - `retry` -- retry policy evaluation and backoff
//! - `breakpoint` -- approval state machine
//! - `checkpoint` -- serializable continuation state and its persistence
//! - `trace` -- append-only execution trace recorder
//! - `executor` -- the graph engine driving a run end to end

pub mod breakpoint;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod merge;
pub mod retry;
pub mod routing;
pub mod step;
pub mod step_runner;
pub mod trace;
