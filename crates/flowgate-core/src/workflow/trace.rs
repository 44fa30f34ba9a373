//! Execution trace recorder.
//!
//! A passive per-run observer: the scheduler hands it every run, node and
//! breakpoint transition plus a full `StepTrace` for each finished node, and
//! it appends them to a [`TraceRepository`] under a gap-free sequence.
//! Recorder failures are logged and published as `RecorderFailed`; they never
//! reach the scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use flowgate_types::breakpoint::BreakpointRequest;
use flowgate_types::event::WorkflowEvent;
use flowgate_types::item::{Item, StepResult};
use flowgate_types::trace::{StepTrace, TraceEntry, TraceEvent};
use flowgate_types::workflow::{NodeStatus, RunStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::trace::TraceRepository;

/// Appends trace entries for one run.
pub struct TraceRecorder<T: TraceRepository> {
    repo: Arc<T>,
    event_bus: EventBus,
    run_id: Uuid,
    sequence: u64,
}

impl<T: TraceRepository> TraceRecorder<T> {
    /// Recorder for a new run; the first entry gets sequence 1.
    pub fn new(repo: Arc<T>, event_bus: EventBus, run_id: Uuid) -> Self {
        Self {
            repo,
            event_bus,
            run_id,
            sequence: 0,
        }
    }

    /// Recorder for a resumed run, continuing after the last stored entry.
    pub async fn resume(repo: Arc<T>, event_bus: EventBus, run_id: Uuid) -> Self {
        let sequence = match repo.last_sequence(&run_id).await {
            Ok(sequence) => sequence,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "could not read last trace sequence");
                event_bus.publish(WorkflowEvent::RecorderFailed {
                    run_id,
                    error: e.to_string(),
                });
                0
            }
        };
        Self {
            repo,
            event_bus,
            run_id,
            sequence,
        }
    }

    /// Sequence of the last successfully appended entry.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub async fn record(&mut self, event: TraceEvent) {
        let entry = TraceEntry {
            run_id: self.run_id,
            sequence: self.sequence + 1,
            recorded_at: Utc::now(),
            event,
        };
        match self.repo.append(&entry).await {
            Ok(()) => self.sequence = entry.sequence,
            Err(e) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    sequence = entry.sequence,
                    error = %e,
                    "trace append failed"
                );
                self.event_bus.publish(WorkflowEvent::RecorderFailed {
                    run_id: self.run_id,
                    error: e.to_string(),
                });
            }
        }
    }

    pub async fn run_status(&mut self, from: RunStatus, to: RunStatus) {
        self.record(TraceEvent::RunStatus { from, to }).await;
    }

    pub async fn node_status(&mut self, node_id: &str, status: NodeStatus, scope: Option<&str>) {
        self.record(TraceEvent::NodeStatus {
            node_id: node_id.to_string(),
            status,
            scope: scope.map(str::to_string),
        })
        .await;
    }

    pub async fn breakpoint(&mut self, request: &BreakpointRequest) {
        self.record(TraceEvent::Breakpoint {
            request_id: request.id,
            node_id: request.node_id.clone(),
            status: request.status,
        })
        .await;
    }

    /// Record a finished node with its inputs and resolved parameters.
    pub async fn step(
        &mut self,
        module_id: String,
        scope: Option<&str>,
        parameters: Value,
        inputs: &[Vec<Item>],
        result: &StepResult,
    ) {
        let timing = result.timing();
        let trace = StepTrace {
            step_id: result.node_id().to_string(),
            module_id,
            scope: scope.map(str::to_string),
            status: result.status(),
            started_at: timing.started_at,
            finished_at: timing.finished_at,
            attempts: timing.attempts,
            parameters,
            input_items: inputs
                .iter()
                .enumerate()
                .map(|(port, items)| (port, items.clone()))
                .collect::<BTreeMap<_, _>>(),
            output_items: result.outputs().to_vec(),
            item_count: result.item_count(),
            item_traces: result.item_traces().to_vec(),
            error: result.error().cloned(),
        };
        self.record(TraceEvent::Step(Box::new(trace))).await;
    }
}
