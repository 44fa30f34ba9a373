//! Engine configuration types for flowgate.
//!
//! `EngineConfig` represents the `flowgate.toml` file that controls default
//! timeouts, loop limits and per-item concurrency.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
///
/// Loaded from `{data_dir}/flowgate.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Node timeout applied when a node does not declare one.
    #[serde(default = "default_node_timeout_secs")]
    pub default_node_timeout_secs: u64,

    /// Whole-run timeout applied when the workflow does not declare one.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Upper bound on loop iterations.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Maximum in-flight items for steps that opt into parallel item execution.
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Deadline applied to breakpoints that do not declare one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_breakpoint_deadline_secs: Option<u64>,

    /// Maximum serialized size of one node's output.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_max_loop_iterations() -> u32 {
    10_000
}

fn default_item_concurrency() -> usize {
    8
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_max_step_output_bytes() -> usize {
    1_048_576
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_node_timeout_secs: default_node_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            max_loop_iterations: default_max_loop_iterations(),
            item_concurrency: default_item_concurrency(),
            event_bus_capacity: default_event_bus_capacity(),
            default_breakpoint_deadline_secs: None,
            max_step_output_bytes: default_max_step_output_bytes(),
        }
    }
}
