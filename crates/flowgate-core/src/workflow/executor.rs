//! Graph engine: event-driven execution of a workflow graph.
//!
//! The `GraphEngine` owns a run from trigger to completion, failure or
//! suspension. Every settled edge may make new nodes ready; ready step nodes
//! run concurrently on a `tokio::JoinSet`, control nodes (branch, fork,
//! merge, split, loop) are evaluated inline by the scheduler.
//!
//! # Execution flow
//!
//! 1. Validate the graph and build its `GraphPlan`.
//! 2. Scan the current region in declaration order: skip nodes whose inputs
//!    all died, open a breakpoint request for gated nodes, evaluate control
//!    nodes, spawn step nodes.
//! 3. When nothing else is ready, wait for the next task, the run deadline,
//!    a merge deadline or cancellation.
//! 4. Post each result into the `ExecutionContext`, record it, route it.
//! 5. On a breakpoint, drain in-flight nodes and persist a `SuspendedRun`;
//!    `resolve_breakpoint` / `expire_overdue` continue it later.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowgate_types::breakpoint::{BreakpointConfig, BreakpointRequest, Decision};
use flowgate_types::config::EngineConfig;
use flowgate_types::error::{ErrorKind, NodeError};
use flowgate_types::event::WorkflowEvent;
use flowgate_types::item::{Item, PairedItem, StepResult, StepStatus, StepTiming};
use flowgate_types::workflow::{
    EdgeType, MergeStrategy, NodeDefinition, NodeKind, NodeStatus, RunFailure, RunStatus, SplitMode, SplitRoute,
    WorkflowGraph,
};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::run_state::RunStateRepository;
use crate::repository::trace::TraceRepository;

use super::breakpoint::{BreakpointGate, GateError, GateResolution};
use super::checkpoint::{CheckpointError, CheckpointManager, EdgeState, Frontier, NodeState, SuspendedRun};
use super::context::{ExecutionContext, ROOT_SCOPE, ScopeId};
use super::dag::GraphPlan;
use super::definition::{WorkflowError, validate_definition, validate_steps};
use super::expression::resolve;
use super::merge::merge;
use super::routing::{pass_through, route_port, select_branch, split};
use super::step::StepRegistry;
use super::step_runner::{RunnerLimits, StepExecution, StepInvocation, StepRunner, stamp_origin};
use super::trace::TraceRecorder;

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Execute a workflow graph with the given trigger items.
    fn execute(
        &self,
        graph: &WorkflowGraph,
        trigger: Vec<Item>,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, EngineError>> + Send;

    /// Apply one approver decision to a pending breakpoint request,
    /// continuing the run once the request resolves.
    fn resolve_breakpoint(
        &self,
        request_id: Uuid,
        decision: Decision,
    ) -> impl std::future::Future<Output = Result<ResolveOutcome, EngineError>> + Send;

    /// Cancel a running or suspended run.
    fn cancel(&self, run_id: Uuid) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Result of a completed, failed or suspended run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// `Completed`, `Failed` or `Suspended`.
    pub status: RunStatus,
    /// Final context (node results, variables).
    pub context: ExecutionContext,
    /// Root-level nodes that completed, in declaration order.
    pub completed_nodes: Vec<String>,
    /// Set when the run failed.
    pub failure: Option<RunFailure>,
    /// Breakpoint requests still waiting for a decision.
    pub pending: Vec<BreakpointRequest>,
    /// The continuation state of a suspended run, as handed to the run-state
    /// store.
    pub suspended: Option<SuspendedRun>,
}

impl ExecutionResult {
    /// Root-scope result of a node.
    pub fn result(&self, node_id: &str) -> Option<&StepResult> {
        self.context.result(ROOT_SCOPE, node_id).map(|r| r.as_ref())
    }
}

/// Outcome of `resolve_breakpoint`.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// The vote was recorded; more approvals are needed.
    Pending(BreakpointRequest),
    /// The request resolved and the run continued.
    Resumed(ExecutionResult),
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by the engine API. Failures of the run itself are
/// reported through `ExecutionResult::failure`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("breakpoint error: {0}")]
    Gate(#[from] GateError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

struct RunCtx<'g, T: TraceRepository> {
    graph: &'g WorkflowGraph,
    plan: &'g GraphPlan,
    run_id: Uuid,
    context: Arc<ExecutionContext>,
    frontier: Frontier,
    recorder: TraceRecorder<T>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    timeout: Duration,
    deadline: Instant,
    /// Pending requests of this run, persisted on suspension.
    requests: Vec<BreakpointRequest>,
    /// Requests opened since the run was last (re)started.
    opened: Vec<Uuid>,
    merge_deadlines: HashMap<String, Instant>,
}

impl<T: TraceRepository> RunCtx<'_, T> {
    fn label(&self, scope: ScopeId) -> Option<String> {
        self.context.scope_label(scope).map(str::to_string)
    }

    fn failure(&self, kind: ErrorKind, message: impl Into<String>) -> RunFailure {
        RunFailure {
            node_id: None,
            kind,
            message: message.into(),
            failed_at: Utc::now(),
        }
    }

    fn cancelled(&self) -> RunFailure {
        self.failure(ErrorKind::Cancelled, "run cancelled")
    }

    fn timed_out(&self) -> RunFailure {
        self.failure(
            ErrorKind::NodeTimeout,
            format!("run exceeded its {}s timeout", self.timeout.as_secs()),
        )
    }

    fn completed_nodes(&self) -> Vec<String> {
        self.graph
            .nodes
            .iter()
            .filter(|n| self.plan.owner(&n.id).is_none())
            .filter(|n| self.frontier.node(&n.id) == NodeState::Completed)
            .map(|n| n.id.clone())
            .collect()
    }
}

enum RegionOutcome {
    Settled,
    Suspended,
}

enum Readiness {
    Waiting,
    Skip,
    Run(Vec<Vec<Item>>),
}

enum Wake {
    Cancelled,
    RunTimeout,
    MergeTimeout,
    Joined(Option<Result<(String, StepExecution), JoinError>>),
}

// ---------------------------------------------------------------------------
// GraphEngine
// ---------------------------------------------------------------------------

/// Event-driven graph executor with persisted breakpoints.
///
/// Generic over the run-state and trace stores for storage flexibility.
pub struct GraphEngine<S: RunStateRepository, T: TraceRepository> {
    config: EngineConfig,
    runner: Arc<StepRunner>,
    checkpoint: CheckpointManager<S>,
    traces: Arc<T>,
    event_bus: EventBus,
    /// Cancellation tokens of in-flight runs keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: RunStateRepository + 'static, T: TraceRepository + 'static> GraphEngine<S, T> {
    pub fn new(registry: StepRegistry, run_state: Arc<S>, traces: Arc<T>, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        let limits = RunnerLimits {
            default_timeout: Duration::from_secs(config.default_node_timeout_secs),
            item_concurrency: config.item_concurrency,
            max_output_bytes: config.max_step_output_bytes,
        };
        Self {
            runner: Arc::new(StepRunner::new(Arc::new(registry), limits, event_bus.clone())),
            checkpoint: CheckpointManager::new(run_state),
            traces,
            event_bus,
            cancellation_tokens: DashMap::new(),
            config,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn checkpoint(&self) -> &CheckpointManager<S> {
        &self.checkpoint
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a graph under a caller-supplied cancellation token.
    pub async fn execute_with_cancel(
        &self,
        graph: &WorkflowGraph,
        trigger: Vec<Item>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let plan = validate_definition(graph)?;
        validate_steps(graph, self.runner.registry())?;

        let run_id = Uuid::now_v7();
        let mut recorder = TraceRecorder::new(Arc::clone(&self.traces), self.event_bus.clone(), run_id);
        recorder.run_status(RunStatus::Pending, RunStatus::Running).await;

        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_name: graph.name.clone(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = graph.name.as_str(),
            nodes = graph.nodes.len(),
            "starting workflow run"
        );

        let run = self.run_ctx(
            graph,
            &plan,
            run_id,
            ExecutionContext::new(run_id),
            Frontier::new(graph, trigger),
            recorder,
            cancel,
            Utc::now(),
            Vec::new(),
        );
        Ok(self.drive_run(run, 0).await)
    }

    /// Pending breakpoint requests, optionally only those `approver` may decide.
    pub async fn list_pending(&self, approver: Option<&str>) -> Result<Vec<BreakpointRequest>, EngineError> {
        Ok(self.checkpoint.list_pending(approver).await?)
    }

    /// Expire every pending request whose deadline is before `now` and
    /// continue the affected runs per their expiry action.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionResult>, EngineError> {
        let overdue: Vec<Uuid> = self
            .checkpoint
            .list_pending(None)
            .await?
            .into_iter()
            .filter(|r| r.is_overdue(now))
            .map(|r| r.id)
            .collect();

        let mut results = Vec::with_capacity(overdue.len());
        for request_id in overdue {
            let mut suspended = match self.checkpoint.find_by_request(request_id).await {
                Ok(run) => run,
                Err(CheckpointError::RequestNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(request) = suspended.request_mut(request_id) else {
                continue;
            };
            if BreakpointGate::expire(request, now).is_err() {
                continue;
            }
            let request = request.clone();
            tracing::info!(
                run_id = %request.run_id,
                request_id = %request_id,
                node_id = request.node_id.as_str(),
                "breakpoint request expired"
            );
            self.event_bus.publish(WorkflowEvent::BreakpointResolved {
                request: request.clone(),
            });

            match self.continue_run(suspended, request).await {
                Ok(result) => results.push(result),
                Err(EngineError::Checkpoint(CheckpointError::Stale(run_id))) => {
                    tracing::debug!(run_id = %run_id, "run continued elsewhere, skipping expiry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn run_ctx<'g>(
        &self,
        graph: &'g WorkflowGraph,
        plan: &'g GraphPlan,
        run_id: Uuid,
        context: ExecutionContext,
        frontier: Frontier,
        recorder: TraceRecorder<T>,
        cancel: CancellationToken,
        started_at: DateTime<Utc>,
        requests: Vec<BreakpointRequest>,
    ) -> RunCtx<'g, T> {
        let timeout = Duration::from_secs(graph.settings.timeout_secs.unwrap_or(self.config.run_timeout_secs));
        RunCtx {
            graph,
            plan,
            run_id,
            context: Arc::new(context),
            frontier,
            recorder,
            cancel,
            started_at,
            timeout,
            deadline: Instant::now() + timeout,
            requests,
            opened: Vec::new(),
            merge_deadlines: HashMap::new(),
        }
    }

    /// Drive the root region and settle the run. `sequence` is the stored
    /// sequence of the run's last suspension (0 for a fresh run).
    async fn drive_run(&self, mut run: RunCtx<'_, T>, sequence: u64) -> ExecutionResult {
        self.cancellation_tokens.insert(run.run_id, run.cancel.clone());
        let outcome = self.drive(&mut run, None, ROOT_SCOPE).await;
        self.cancellation_tokens.remove(&run.run_id);

        match outcome {
            Ok(RegionOutcome::Settled) => self.complete(run).await,
            Ok(RegionOutcome::Suspended) => self.suspend(run, sequence).await,
            Err(failure) => self.fail(run, failure).await,
        }
    }

    async fn complete(&self, mut run: RunCtx<'_, T>) -> ExecutionResult {
        run.recorder.run_status(RunStatus::Running, RunStatus::Completed).await;
        let duration_ms = (Utc::now() - run.started_at).num_milliseconds().max(0) as u64;
        self.event_bus.publish(WorkflowEvent::RunCompleted {
            run_id: run.run_id,
            workflow_name: run.graph.name.clone(),
            duration_ms,
            nodes_completed: run.frontier.nodes_completed,
        });
        tracing::info!(
            run_id = %run.run_id,
            duration_ms,
            nodes_completed = run.frontier.nodes_completed,
            "workflow run completed"
        );

        ExecutionResult {
            run_id: run.run_id,
            status: RunStatus::Completed,
            completed_nodes: run.completed_nodes(),
            context: Arc::unwrap_or_clone(run.context),
            failure: None,
            pending: Vec::new(),
            suspended: None,
        }
    }

    async fn fail(&self, mut run: RunCtx<'_, T>, failure: RunFailure) -> ExecutionResult {
        run.recorder.run_status(RunStatus::Running, RunStatus::Failed).await;
        self.event_bus.publish(WorkflowEvent::RunFailed {
            run_id: run.run_id,
            workflow_name: run.graph.name.clone(),
            node_id: failure.node_id.clone(),
            kind: failure.kind,
            error: failure.message.clone(),
        });
        tracing::info!(
            run_id = %run.run_id,
            node_id = ?failure.node_id,
            kind = failure.kind.as_str(),
            error = failure.message.as_str(),
            "workflow run failed"
        );

        ExecutionResult {
            run_id: run.run_id,
            status: RunStatus::Failed,
            completed_nodes: run.completed_nodes(),
            context: Arc::unwrap_or_clone(run.context),
            failure: Some(failure),
            pending: Vec::new(),
            suspended: None,
        }
    }

    async fn suspend(&self, mut run: RunCtx<'_, T>, sequence: u64) -> ExecutionResult {
        let completed_nodes = run.completed_nodes();
        let suspended = SuspendedRun {
            run_id: run.run_id,
            sequence: sequence + 1,
            graph: run.graph.clone(),
            context: Arc::unwrap_or_clone(run.context),
            frontier: run.frontier,
            requests: run.requests,
            started_at: run.started_at,
            suspended_at: Utc::now(),
        };

        // A continued run was taken out of the store on release, so this is
        // always a fresh insert.
        if let Err(e) = self.checkpoint.save(&suspended, None).await {
            tracing::warn!(run_id = %run.run_id, error = %e, "failed to persist suspended run");
            self.event_bus.publish(WorkflowEvent::PersistenceFailed {
                run_id: run.run_id,
                error: e.to_string(),
            });
        }
        run.recorder.run_status(RunStatus::Running, RunStatus::Suspended).await;

        for request in suspended.requests.iter().filter(|r| run.opened.contains(&r.id)) {
            self.event_bus.publish(WorkflowEvent::BreakpointRequested {
                request: request.clone(),
            });
        }
        if let Some(gate) = suspended.pending().last() {
            self.event_bus.publish(WorkflowEvent::RunSuspended {
                run_id: run.run_id,
                node_id: gate.node_id.clone(),
                deadline: gate.deadline,
            });
            tracing::info!(
                run_id = %run.run_id,
                node_id = gate.node_id.as_str(),
                request_id = %gate.id,
                deadline = ?gate.deadline,
                "workflow run suspended at breakpoint"
            );
        }

        ExecutionResult {
            run_id: suspended.run_id,
            status: RunStatus::Suspended,
            context: suspended.context.clone(),
            completed_nodes,
            failure: None,
            pending: suspended.pending().cloned().collect(),
            suspended: Some(suspended),
        }
    }

    /// Take a run with a freshly resolved request out of the store and
    /// continue it.
    async fn continue_run(
        &self,
        suspended: SuspendedRun,
        request: BreakpointRequest,
    ) -> Result<ExecutionResult, EngineError> {
        // The frontier, not the request row, says which node is held.
        let Some(node_id) = suspended.frontier.gated_by(request.id).map(str::to_string) else {
            tracing::warn!(run_id = %suspended.run_id, request_id = %request.id, "request gates no node in this run");
            return Err(CheckpointError::Stale(suspended.run_id).into());
        };
        self.checkpoint.release(&suspended).await.map_err(|e| match e {
            CheckpointError::RunNotFound(run_id) => CheckpointError::Stale(run_id),
            other => other,
        })?;

        let SuspendedRun {
            run_id,
            sequence,
            graph,
            mut context,
            mut frontier,
            requests,
            started_at,
            ..
        } = suspended;
        let plan = validate_definition(&graph)?;

        let mut recorder = TraceRecorder::resume(Arc::clone(&self.traces), self.event_bus.clone(), run_id).await;
        recorder.breakpoint(&request).await;
        recorder.run_status(RunStatus::Suspended, RunStatus::Running).await;

        let mut failure = None;
        match BreakpointGate::resolution(&request) {
            Some(GateResolution::Approved(fields)) => {
                frontier.set_node(&node_id, NodeState::Released);
                let mut approval = match context.variable("approval") {
                    Some(Value::Object(existing)) => existing.clone(),
                    _ => Map::new(),
                };
                approval.insert(node_id.clone(), Value::Object(fields.clone()));
                context.set_variable("approval", Value::Object(approval));
                frontier.overrides.insert(node_id.clone(), fields);
            }
            Some(GateResolution::Divert { target }) => {
                let inputs = collect_inputs(&graph, &frontier, &node_id);
                frontier.set_node(&node_id, NodeState::Skipped);
                for (index, _) in graph.outgoing(&node_id) {
                    frontier.set_edge(index, EdgeState::Dead);
                }
                recorder.node_status(&node_id, NodeStatus::Skipped, None).await;
                if frontier.node(&target) == NodeState::Skipped {
                    frontier.set_node(&target, NodeState::Pending);
                }
                tracing::debug!(run_id = %run_id, from = node_id.as_str(), to = target.as_str(), "diverting run");
                frontier.forced.insert(target, inputs);
            }
            Some(GateResolution::Reject { reason }) => {
                frontier.set_node(&node_id, NodeState::Failed);
                recorder.node_status(&node_id, NodeStatus::Failed, None).await;
                failure = Some(RunFailure {
                    node_id: Some(node_id.clone()),
                    kind: ErrorKind::BreakpointRejected,
                    message: reason,
                    failed_at: Utc::now(),
                });
            }
            None => {
                return Err(GateError::NotPending {
                    id: request.id,
                    status: request.status,
                }
                .into());
            }
        }

        self.event_bus.publish(WorkflowEvent::RunResumed {
            run_id,
            node_id: node_id.clone(),
        });
        tracing::info!(run_id = %run_id, node_id = node_id.as_str(), "resuming workflow run");

        let remaining: Vec<BreakpointRequest> = requests.into_iter().filter(|r| !r.status.is_resolved()).collect();
        let run = self.run_ctx(
            &graph,
            &plan,
            run_id,
            context,
            frontier,
            recorder,
            CancellationToken::new(),
            started_at,
            remaining,
        );
        Ok(match failure {
            Some(failure) => self.fail(run, failure).await,
            None => self.drive_run(run, sequence).await,
        })
    }

    // -----------------------------------------------------------------------
    // Scheduler
    // -----------------------------------------------------------------------

    /// Run one region (the root or one loop iteration) until it settles,
    /// suspends or fails.
    fn drive<'a, 'g: 'a>(
        &'a self,
        run: &'a mut RunCtx<'g, T>,
        loop_id: Option<&'g str>,
        scope: ScopeId,
    ) -> BoxFuture<'a, Result<RegionOutcome, RunFailure>> {
        async move {
            let graph = run.graph;
            let plan = run.plan;
            let region = plan.region(graph, loop_id);
            let mut tasks: JoinSet<(String, StepExecution)> = JoinSet::new();
            let mut in_flight: HashMap<String, Vec<Vec<Item>>> = HashMap::new();
            let mut suspending = false;

            loop {
                if run.cancel.is_cancelled() {
                    return Err(run.cancelled());
                }
                if Instant::now() >= run.deadline {
                    return Err(run.timed_out());
                }

                let mut progressed = false;
                if !suspending {
                    for &node_id in &region {
                        let state = run.frontier.node(node_id);
                        if !state.is_open() {
                            continue;
                        }
                        let Some(node) = graph.node(node_id) else {
                            continue;
                        };
                        match readiness(graph, plan, &run.frontier, node) {
                            Readiness::Waiting => arm_merge_deadline(run, node),
                            Readiness::Skip => {
                                self.skip(run, node_id, scope).await;
                                progressed = true;
                            }
                            Readiness::Run(inputs) => {
                                progressed = true;
                                if state == NodeState::Pending {
                                    if let Some(config) = &node.breakpoint {
                                        self.open_breakpoint(run, node, config).await;
                                        suspending = true;
                                        break;
                                    }
                                }
                                run.frontier.forced.remove(node_id);
                                match &node.kind {
                                    NodeKind::Step { .. } => {
                                        self.spawn_step(run, node, scope, inputs, &mut tasks, &mut in_flight)
                                            .await;
                                    }
                                    NodeKind::Loop { .. } => self.run_loop(run, node, scope, inputs).await?,
                                    _ => self.run_control(run, node, scope, inputs).await?,
                                }
                            }
                        }
                    }
                }
                if progressed {
                    continue;
                }

                if tasks.is_empty() {
                    let waiting = region
                        .iter()
                        .any(|id| matches!(run.frontier.node(id), NodeState::WaitingApproval { .. }));
                    if suspending || waiting {
                        return Ok(RegionOutcome::Suspended);
                    }
                    // Diversion targets that were never diverted to.
                    let dormant: Vec<&str> = region
                        .iter()
                        .copied()
                        .filter(|id| {
                            run.frontier.node(id) == NodeState::Pending
                                && plan.is_dormant(id)
                                && !run.frontier.forced.contains_key(*id)
                        })
                        .collect();
                    if dormant.is_empty() {
                        return Ok(RegionOutcome::Settled);
                    }
                    for node_id in dormant {
                        self.skip(run, node_id, scope).await;
                    }
                    continue;
                }

                let cancel = run.cancel.clone();
                let deadline = run.deadline;
                let merge_deadline = region
                    .iter()
                    .filter_map(|id| run.merge_deadlines.get(*id))
                    .min()
                    .copied();
                let wake = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Wake::RunTimeout,
                    _ = sleep_until_some(merge_deadline) => Wake::MergeTimeout,
                    joined = tasks.join_next() => Wake::Joined(joined),
                };

                match wake {
                    Wake::Cancelled => return Err(run.cancelled()),
                    Wake::RunTimeout => return Err(run.timed_out()),
                    Wake::MergeTimeout => {
                        let now = Instant::now();
                        let expired: Vec<&str> = region
                            .iter()
                            .copied()
                            .filter(|id| run.merge_deadlines.get(*id).is_some_and(|d| *d <= now))
                            .collect();
                        for node_id in expired {
                            run.merge_deadlines.remove(node_id);
                            let Some(node) = graph.node(node_id) else {
                                continue;
                            };
                            if !run.frontier.node(node_id).is_open() {
                                continue;
                            }
                            let inputs = collect_inputs(graph, &run.frontier, node_id);
                            let error = NodeError::new(
                                node_id,
                                ErrorKind::NodeTimeout,
                                format!(
                                    "inputs incomplete after {}s",
                                    node.timeout_secs.unwrap_or_default()
                                ),
                            );
                            let result = StepResult::failed(error, StepTiming::instant());
                            self.finish(run, node, scope, &inputs, node.parameters.clone(), result, None)
                                .await?;
                        }
                    }
                    Wake::Joined(Some(Ok((node_id, execution)))) => {
                        if run.cancel.is_cancelled() {
                            return Err(run.cancelled());
                        }
                        let inputs = in_flight.remove(&node_id).unwrap_or_default();
                        let Some(node) = graph.node(&node_id) else {
                            continue;
                        };
                        self.finish(run, node, scope, &inputs, execution.parameters, execution.result, None)
                            .await?;
                    }
                    Wake::Joined(Some(Err(e))) => {
                        return Err(run.failure(ErrorKind::System, format!("step task failed: {e}")));
                    }
                    Wake::Joined(None) => {}
                }
            }
        }
        .boxed()
    }

    async fn open_breakpoint(&self, run: &mut RunCtx<'_, T>, node: &NodeDefinition, config: &BreakpointConfig) {
        let request = BreakpointGate::open(
            run.run_id,
            &node.id,
            config,
            self.config.default_breakpoint_deadline_secs,
            Utc::now(),
        );
        run.frontier.set_node(
            &node.id,
            NodeState::WaitingApproval {
                request_id: request.id,
            },
        );
        run.recorder
            .node_status(&node.id, NodeStatus::WaitingApproval, None)
            .await;
        run.recorder.breakpoint(&request).await;
        tracing::debug!(
            run_id = %run.run_id,
            node_id = node.id.as_str(),
            request_id = %request.id,
            "breakpoint reached"
        );
        run.opened.push(request.id);
        run.requests.push(request);
    }

    async fn skip(&self, run: &mut RunCtx<'_, T>, node_id: &str, scope: ScopeId) {
        let graph = run.graph;
        run.frontier.set_node(node_id, NodeState::Skipped);
        for (index, _) in graph.outgoing(node_id) {
            run.frontier.set_edge(index, EdgeState::Dead);
        }
        run.merge_deadlines.remove(node_id);
        let label = run.label(scope);
        run.recorder
            .node_status(node_id, NodeStatus::Skipped, label.as_deref())
            .await;
        tracing::debug!(run_id = %run.run_id, node_id, "node skipped");
    }

    async fn mark_started(&self, run: &mut RunCtx<'_, T>, node: &NodeDefinition, scope: ScopeId) {
        run.frontier.set_node(&node.id, NodeState::Running);
        let label = run.label(scope);
        run.recorder
            .node_status(&node.id, NodeStatus::Running, label.as_deref())
            .await;
        self.event_bus.publish(WorkflowEvent::NodeStarted {
            run_id: run.run_id,
            node_id: node.id.clone(),
            module_id: node.module_id(),
        });
        tracing::debug!(run_id = %run.run_id, node_id = node.id.as_str(), scope = ?label, "node started");
    }

    async fn spawn_step(
        &self,
        run: &mut RunCtx<'_, T>,
        node: &NodeDefinition,
        scope: ScopeId,
        inputs: Vec<Vec<Item>>,
        tasks: &mut JoinSet<(String, StepExecution)>,
        in_flight: &mut HashMap<String, Vec<Vec<Item>>>,
    ) {
        self.mark_started(run, node, scope).await;

        let invocation = StepInvocation {
            context: Arc::clone(&run.context),
            scope,
            inputs: inputs.clone(),
            overrides: run.frontier.overrides.get(&node.id).cloned(),
            item_error_policy: node
                .item_error_policy
                .unwrap_or(run.graph.settings.item_error_policy),
            cancel: run.cancel.clone(),
        };
        let runner = Arc::clone(&self.runner);
        let definition = node.clone();
        tasks.spawn(async move {
            let execution = runner.run(&definition, invocation).await;
            (definition.id, execution)
        });
        in_flight.insert(node.id.clone(), inputs);
    }

    /// Evaluate a start, fork, branch, merge or split node.
    async fn run_control(
        &self,
        run: &mut RunCtx<'_, T>,
        node: &NodeDefinition,
        scope: ScopeId,
        inputs: Vec<Vec<Item>>,
    ) -> Result<(), RunFailure> {
        let started_at = Utc::now();
        self.mark_started(run, node, scope).await;

        let mut parameters = node.parameters.clone();
        let mut selected = None;
        let outcome = match &node.kind {
            NodeKind::Start => Ok(inputs.clone()),
            NodeKind::Fork => Ok(vec![pass_through(&inputs)]),
            NodeKind::Merge { strategy } => Ok(vec![merge(strategy, &inputs)]),
            NodeKind::Split { mode } => {
                let ports = run
                    .graph
                    .outgoing(&node.id)
                    .map(|(_, e)| e.from_port + 1)
                    .max()
                    .unwrap_or(1);
                Ok(split(mode, pass_through(&inputs), ports))
            }
            NodeKind::Branch { rules, default_label } => {
                match branch_snapshot(&run.context, node, scope, &inputs) {
                    Ok(snapshot) => {
                        let label = select_branch(rules, default_label.as_deref(), &snapshot);
                        parameters = snapshot;
                        match label {
                            Some(label) => {
                                selected = Some(label);
                                Ok(vec![pass_through(&inputs)])
                            }
                            None => Err(NodeError::new(
                                &node.id,
                                ErrorKind::NoBranchMatched,
                                "no branch rule matched and no default label is set",
                            )),
                        }
                    }
                    Err(error) => Err(error),
                }
            }
            NodeKind::Step { .. } | NodeKind::Loop { .. } => return Ok(()),
        };

        let timing = StepTiming::new(started_at, Utc::now(), 1);
        let result = match outcome {
            Ok(ports) => StepResult::success(&node.id, stamp_origin(&node.id, ports), timing),
            Err(error) => StepResult::failed(error, timing),
        };
        self.finish(run, node, scope, &inputs, parameters, result, selected)
            .await
    }

    /// Run a loop node: one child scope per source element, iterations in
    /// order.
    async fn run_loop<'g>(
        &self,
        run: &mut RunCtx<'g, T>,
        node: &'g NodeDefinition,
        scope: ScopeId,
        inputs: Vec<Vec<Item>>,
    ) -> Result<(), RunFailure> {
        let NodeKind::Loop {
            source,
            max_iterations,
            export,
        } = &node.kind
        else {
            return Ok(());
        };
        let graph = run.graph;
        let plan = run.plan;
        let started_at = Utc::now();
        self.mark_started(run, node, scope).await;

        let (elements, parameters) = match loop_source(&run.context, node, scope, source.as_ref(), &inputs) {
            Ok(found) => found,
            Err(error) => {
                let result = StepResult::failed(error, StepTiming::new(started_at, Utc::now(), 1));
                return self
                    .finish(run, node, scope, &inputs, node.parameters.clone(), result, None)
                    .await;
            }
        };
        let limit = max_iterations
            .unwrap_or(u32::MAX)
            .min(self.config.max_loop_iterations) as usize;
        if elements.len() > limit {
            let error = NodeError::new(
                &node.id,
                ErrorKind::StepRuntime,
                format!("{} iterations exceed the limit of {limit}", elements.len()),
            );
            let result = StepResult::failed(error, StepTiming::new(started_at, Utc::now(), 1));
            return self
                .finish(run, node, scope, &inputs, parameters, result, None)
                .await;
        }

        let body_nodes: Vec<&str> = graph
            .nodes
            .iter()
            .filter(|n| plan.in_body(&node.id, &n.id))
            .map(|n| n.id.as_str())
            .collect();
        let body_edges: Vec<usize> = graph
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| plan.in_body(&node.id, &e.to))
            .map(|(i, _)| i)
            .collect();
        let iterate_edges: Vec<usize> = graph
            .outgoing(&node.id)
            .filter(|(_, e)| e.edge_type == EdgeType::Iterate)
            .map(|(i, _)| i)
            .collect();
        let leaves = plan.leaves(graph, &node.id);

        let mut collected = Vec::new();
        let mut exported: BTreeMap<String, Arc<StepResult>> = BTreeMap::new();
        for (index, element) in elements.into_iter().enumerate() {
            let child = Arc::make_mut(&mut run.context).push_scope(
                scope,
                format!("{}#{index}", node.id),
                element.clone(),
                index,
            );
            for id in &body_nodes {
                run.frontier.set_node(id, NodeState::Pending);
            }
            for &i in &body_edges {
                run.frontier.set_edge(i, EdgeState::Pending);
            }
            for &i in &iterate_edges {
                run.frontier
                    .set_edge(i, EdgeState::Fired(vec![element.clone().paired_with(index, 0)]));
            }

            tracing::debug!(run_id = %run.run_id, node_id = node.id.as_str(), index, "loop iteration");
            let outcome = self.drive(run, Some(node.id.as_str()), child).await;
            let results = Arc::make_mut(&mut run.context)
                .pop_scope(child)
                .unwrap_or_default();
            match outcome {
                Ok(RegionOutcome::Settled) => {}
                Ok(RegionOutcome::Suspended) => {
                    return Err(run.failure(ErrorKind::System, "loop body cannot suspend"));
                }
                Err(failure) => return Err(failure),
            }

            for leaf in &leaves {
                if let Some(result) = results.get(*leaf) {
                    collected.extend(
                        result
                            .port(0)
                            .iter()
                            .cloned()
                            .map(|item| item.with_pairing(vec![PairedItem::new(index, 0)])),
                    );
                }
            }
            for id in export {
                if let Some(result) = results.get(id) {
                    exported.insert(id.clone(), Arc::clone(result));
                }
            }
        }

        Arc::make_mut(&mut run.context).import(scope, exported.into_values());
        let timing = StepTiming::new(started_at, Utc::now(), 1);
        let result = StepResult::success(&node.id, stamp_origin(&node.id, vec![collected]), timing);
        self.finish(run, node, scope, &inputs, parameters, result, None)
            .await
    }

    /// Post a finished node's result, record it and route its outgoing
    /// edges. A failure without an error route fails the run.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run: &mut RunCtx<'_, T>,
        node: &NodeDefinition,
        scope: ScopeId,
        inputs: &[Vec<Item>],
        parameters: Value,
        result: StepResult,
        selected: Option<&str>,
    ) -> Result<(), RunFailure> {
        let graph = run.graph;
        let label = run.label(scope);
        run.merge_deadlines.remove(&node.id);
        run.recorder
            .step(node.module_id(), label.as_deref(), parameters, inputs, &result)
            .await;
        let posted = Arc::make_mut(&mut run.context).post(scope, result);

        let Some(error) = posted.error() else {
            run.frontier.set_node(&node.id, NodeState::Completed);
            run.frontier.nodes_completed += 1;
            let status = match posted.status() {
                StepStatus::Partial => NodeStatus::Partial,
                _ => NodeStatus::Completed,
            };
            run.recorder
                .node_status(&node.id, status, label.as_deref())
                .await;
            self.event_bus.publish(WorkflowEvent::NodeCompleted {
                run_id: run.run_id,
                node_id: node.id.clone(),
                item_count: posted.item_count(),
                duration_ms: posted.timing().duration_ms,
            });
            tracing::debug!(
                run_id = %run.run_id,
                node_id = node.id.as_str(),
                status = ?status,
                items = posted.item_count(),
                "node completed"
            );
            route(graph, &mut run.frontier, &node.id, posted.outputs(), selected);
            return Ok(());
        };

        run.frontier.set_node(&node.id, NodeState::Failed);
        run.recorder
            .node_status(&node.id, NodeStatus::Failed, label.as_deref())
            .await;
        self.event_bus.publish(WorkflowEvent::NodeFailed {
            run_id: run.run_id,
            node_id: node.id.clone(),
            kind: error.kind,
            error: error.message.clone(),
            will_retry: false,
        });
        tracing::debug!(
            run_id = %run.run_id,
            node_id = node.id.as_str(),
            kind = error.kind.as_str(),
            error = error.message.as_str(),
            "node failed"
        );

        if !graph.outgoing(&node.id).any(|(_, e)| e.on_error) {
            return Err(RunFailure {
                node_id: Some(node.id.clone()),
                kind: error.kind,
                message: error.message.clone(),
                failed_at: Utc::now(),
            });
        }
        route_error(graph, &mut run.frontier, &node.id, error);
        Ok(())
    }
}

impl<S: RunStateRepository + 'static, T: TraceRepository + 'static> WorkflowExecutor for GraphEngine<S, T> {
    async fn execute(&self, graph: &WorkflowGraph, trigger: Vec<Item>) -> Result<ExecutionResult, EngineError> {
        self.execute_with_cancel(graph, trigger, CancellationToken::new())
            .await
    }

    async fn resolve_breakpoint(&self, request_id: Uuid, decision: Decision) -> Result<ResolveOutcome, EngineError> {
        let mut suspended = self
            .checkpoint
            .find_by_request(request_id)
            .await
            .map_err(|e| match e {
                CheckpointError::RequestNotFound(id) => EngineError::Gate(GateError::NotFound(id)),
                other => other.into(),
            })?;

        let request = suspended
            .request_mut(request_id)
            .ok_or(GateError::NotFound(request_id))?;
        let approver = decision.approver.clone();
        let status = BreakpointGate::vote(request, decision, Utc::now())?;
        let request = request.clone();
        tracing::info!(
            run_id = %request.run_id,
            request_id = %request_id,
            approver = approver.as_str(),
            status = ?status,
            "breakpoint decision recorded"
        );

        if !status.is_resolved() {
            let expected = suspended.sequence;
            suspended.sequence += 1;
            self.checkpoint.save(&suspended, Some(expected)).await?;
            return Ok(ResolveOutcome::Pending(request));
        }

        self.event_bus.publish(WorkflowEvent::BreakpointResolved {
            request: request.clone(),
        });
        self.continue_run(suspended, request)
            .await
            .map(ResolveOutcome::Resumed)
    }

    async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        if let Some(token) = self.cancellation_tokens.get(&run_id) {
            token.cancel();
            tracing::info!(run_id = %run_id, "cancelling workflow run");
            return Ok(());
        }

        let suspended = self.checkpoint.load(run_id).await.map_err(|e| match e {
            CheckpointError::RunNotFound(id) => EngineError::RunNotFound(id),
            other => other.into(),
        })?;
        self.checkpoint
            .repo()
            .archive(&run_id, suspended.sequence, &suspended.requests)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        let mut recorder = TraceRecorder::resume(Arc::clone(&self.traces), self.event_bus.clone(), run_id).await;
        recorder.run_status(RunStatus::Suspended, RunStatus::Failed).await;
        self.event_bus.publish(WorkflowEvent::RunFailed {
            run_id,
            workflow_name: suspended.graph.name.clone(),
            node_id: None,
            kind: ErrorKind::Cancelled,
            error: "run cancelled while suspended".to_string(),
        });
        tracing::info!(run_id = %run_id, "cancelled suspended workflow run");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Readiness and routing
// ---------------------------------------------------------------------------

fn readiness(graph: &WorkflowGraph, plan: &GraphPlan, frontier: &Frontier, node: &NodeDefinition) -> Readiness {
    if let Some(inputs) = frontier.forced.get(&node.id) {
        return Readiness::Run(inputs.clone());
    }
    if matches!(node.kind, NodeKind::Start) {
        return Readiness::Run(vec![frontier.trigger.clone()]);
    }

    let mut any_edge = false;
    let mut fired = false;
    let mut dead = false;
    // Every control edge into a node is required.
    let mut gate_closed = false;
    for (index, edge) in graph.incoming(&node.id) {
        any_edge = true;
        match frontier.edge(index) {
            EdgeState::Pending => return Readiness::Waiting,
            EdgeState::Fired(_) => fired = true,
            EdgeState::Dead => {
                dead = true;
                gate_closed |= edge.edge_type == EdgeType::Control;
            }
        }
    }
    if !any_edge {
        return if plan.is_dormant(&node.id) {
            Readiness::Waiting
        } else {
            Readiness::Run(Vec::new())
        };
    }

    let barrier = matches!(
        node.kind,
        NodeKind::Merge {
            strategy: MergeStrategy::WaitAll
        }
    );
    if !fired || gate_closed || (barrier && dead) {
        return Readiness::Skip;
    }
    Readiness::Run(collect_inputs(graph, frontier, &node.id))
}

/// Items of the fired incoming edges, by input port.
fn collect_inputs(graph: &WorkflowGraph, frontier: &Frontier, node_id: &str) -> Vec<Vec<Item>> {
    let ports = graph
        .incoming(node_id)
        .map(|(_, e)| e.to_port + 1)
        .max()
        .unwrap_or(0);
    let mut inputs = vec![Vec::new(); ports];
    for (index, edge) in graph.incoming(node_id) {
        if !edge.edge_type.carries_items() {
            continue;
        }
        if let EdgeState::Fired(items) = frontier.edge(index) {
            inputs[edge.to_port].extend(items.iter().cloned());
        }
    }
    inputs
}

/// Start the join deadline of a merge once its first input fired.
fn arm_merge_deadline<T: TraceRepository>(run: &mut RunCtx<'_, T>, node: &NodeDefinition) {
    let (NodeKind::Merge { .. }, Some(secs)) = (&node.kind, node.timeout_secs) else {
        return;
    };
    if run.merge_deadlines.contains_key(&node.id) {
        return;
    }
    let any_fired = run
        .graph
        .incoming(&node.id)
        .any(|(index, _)| matches!(run.frontier.edge(index), EdgeState::Fired(_)));
    if any_fired {
        run.merge_deadlines
            .insert(node.id.clone(), Instant::now() + Duration::from_secs(secs));
    }
}

fn route(graph: &WorkflowGraph, frontier: &mut Frontier, node_id: &str, outputs: &[Vec<Item>], selected: Option<&str>) {
    let filter_routes: &[SplitRoute] = match graph.node(node_id).map(|n| &n.kind) {
        Some(NodeKind::Split {
            mode: SplitMode::Filter { routes },
        }) => routes.as_slice(),
        _ => &[],
    };
    for (index, edge) in graph.outgoing(node_id) {
        if edge.edge_type == EdgeType::Iterate {
            continue;
        }
        let chosen = selected.is_none_or(|label| edge.label.as_deref() == Some(label));
        // Labelled edges out of a filter split take their route's items.
        let port = edge
            .label
            .as_deref()
            .and_then(|label| route_port(filter_routes, label))
            .unwrap_or(edge.from_port);
        let state = if edge.on_error || !chosen {
            EdgeState::Dead
        } else if edge.edge_type.carries_items() {
            EdgeState::Fired(outputs.get(port).cloned().unwrap_or_default())
        } else {
            EdgeState::Fired(Vec::new())
        };
        frontier.set_edge(index, state);
    }
}

fn route_error(graph: &WorkflowGraph, frontier: &mut Frontier, node_id: &str, error: &NodeError) {
    let item = Item::new(json!({
        "error": {
            "node": error.node_id,
            "kind": error.kind,
            "message": error.message,
        }
    }))
    .with_origin(node_id, 0);
    for (index, edge) in graph.outgoing(node_id) {
        if edge.edge_type == EdgeType::Iterate {
            continue;
        }
        let state = if !edge.on_error {
            EdgeState::Dead
        } else if edge.edge_type.carries_items() {
            EdgeState::Fired(vec![item.clone()])
        } else {
            EdgeState::Fired(Vec::new())
        };
        frontier.set_edge(index, state);
    }
}

/// Condition snapshot of a branch node: its resolved parameters, or the
/// first input payload when it declares none.
fn branch_snapshot(
    context: &ExecutionContext,
    node: &NodeDefinition,
    scope: ScopeId,
    inputs: &[Vec<Item>],
) -> Result<Value, NodeError> {
    let first = inputs.iter().flatten().next();
    let declared = match &node.parameters {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    };
    if !declared {
        return Ok(first.map(|item| item.json().clone()).unwrap_or(Value::Null));
    }
    let view = context.view(scope);
    let view = match first {
        Some(item) => view.with_item(item, 0),
        None => view,
    };
    resolve(&node.parameters, &view).map_err(|e| NodeError::new(&node.id, ErrorKind::Resolution, e.to_string()))
}

/// Elements a loop iterates, plus the parameters recorded for it.
fn loop_source(
    context: &ExecutionContext,
    node: &NodeDefinition,
    scope: ScopeId,
    source: Option<&Value>,
    inputs: &[Vec<Item>],
) -> Result<(Vec<Item>, Value), NodeError> {
    let Some(template) = source else {
        return Ok((pass_through(inputs), node.parameters.clone()));
    };
    let view = context.view(scope);
    let view = match inputs.iter().flatten().next() {
        Some(item) => view.with_item(item, 0),
        None => view,
    };
    let value =
        resolve(template, &view).map_err(|e| NodeError::new(&node.id, ErrorKind::Resolution, e.to_string()))?;
    let elements = match &value {
        Value::Array(values) => values.iter().cloned().map(Item::new).collect(),
        Value::Null => Vec::new(),
        other => vec![Item::new(other.clone())],
    };
    Ok((elements, json!({ "source": value })))
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{InMemoryRunStateRepository, InMemoryTraceRepository};
    use crate::workflow::step::{BatchInput, BatchStep, ItemStep, SingleStep, StepContext, StepError, StepOutput};
    use flowgate_types::breakpoint::{ApprovalMode, BreakpointStatus, ExpiryAction};
    use flowgate_types::condition::Condition;
    use flowgate_types::trace::TraceEvent;
    use flowgate_types::workflow::{ControlEdge, ItemErrorPolicy, WorkflowSettings};
    use std::sync::atomic::{AtomicU32, Ordering};

    // -- test steps --------------------------------------------------------

    struct Double;

    impl ItemStep for Double {
        async fn run_item(
            &self,
            _ctx: &StepContext,
            _params: &Value,
            item: &Item,
            _index: usize,
        ) -> Result<StepOutput, StepError> {
            let n = item
                .json()
                .get("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| StepError::runtime("missing n"))?;
            Ok(json!({"n": n * 2}).into())
        }
    }

    struct RejectOdd;

    impl ItemStep for RejectOdd {
        async fn run_item(
            &self,
            _ctx: &StepContext,
            _params: &Value,
            item: &Item,
            _index: usize,
        ) -> Result<StepOutput, StepError> {
            match item.json()["n"].as_i64() {
                Some(n) if n % 2 == 0 => Ok(item.json().clone().into()),
                _ => Err(StepError::runtime("odd")),
            }
        }
    }

    struct Echo;

    impl ItemStep for Echo {
        async fn run_item(
            &self,
            _ctx: &StepContext,
            _params: &Value,
            item: &Item,
            _index: usize,
        ) -> Result<StepOutput, StepError> {
            Ok(item.json().clone().into())
        }
    }

    /// Returns its resolved parameters and counts invocations.
    struct Tag {
        calls: Arc<AtomicU32>,
    }

    impl SingleStep for Tag {
        async fn run(&self, _ctx: &StepContext, params: &Value) -> Result<StepOutput, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(params.clone().into())
        }
    }

    struct Boom;

    impl SingleStep for Boom {
        async fn run(&self, _ctx: &StepContext, _params: &Value) -> Result<StepOutput, StepError> {
            Err(StepError::runtime("boom"))
        }
    }

    struct Slow;

    impl SingleStep for Slow {
        async fn run(&self, ctx: &StepContext, _params: &Value) -> Result<StepOutput, StepError> {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                _ = ctx.cancel.cancelled() => {}
            }
            Ok(json!({"slow": true}).into())
        }
    }

    struct Count;

    impl BatchStep for Count {
        async fn run_batch(
            &self,
            _ctx: &StepContext,
            _params: &Value,
            input: &BatchInput,
        ) -> Result<StepOutput, StepError> {
            Ok(json!({"count": input.len()}).into())
        }
    }

    // -- fixtures ----------------------------------------------------------

    type TestEngine = GraphEngine<InMemoryRunStateRepository, InMemoryTraceRepository>;

    struct Harness {
        engine: Arc<TestEngine>,
        runs: Arc<InMemoryRunStateRepository>,
        traces: Arc<InMemoryTraceRepository>,
        calls: Arc<AtomicU32>,
    }

    fn harness() -> Harness {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = StepRegistry::new();
        registry
            .register_items("double", Double)
            .register_items("reject_odd", RejectOdd)
            .register_items("echo", Echo)
            .register_single(
                "tag",
                Tag {
                    calls: Arc::clone(&calls),
                },
            )
            .register_single("boom", Boom)
            .register_single("slow", Slow)
            .register_batch("count", Count);
        let runs = Arc::new(InMemoryRunStateRepository::new());
        let traces = Arc::new(InMemoryTraceRepository::new());
        let engine = GraphEngine::new(
            registry,
            Arc::clone(&runs),
            Arc::clone(&traces),
            EngineConfig::default(),
        );
        Harness {
            engine: Arc::new(engine),
            runs,
            traces,
            calls,
        }
    }

    fn graph(nodes: Vec<NodeDefinition>, edges: Vec<ControlEdge>) -> WorkflowGraph {
        WorkflowGraph {
            id: Uuid::now_v7(),
            name: "test".to_string(),
            version: "1.0.0".to_string(),
            nodes,
            edges,
            settings: WorkflowSettings::default(),
        }
    }

    fn start() -> NodeDefinition {
        NodeDefinition::new("start", NodeKind::Start)
    }

    fn step(id: &str, step: &str) -> NodeDefinition {
        NodeDefinition::new(
            id,
            NodeKind::Step {
                step: step.to_string(),
            },
        )
    }

    fn numbers(values: &[i64]) -> Vec<Item> {
        values.iter().map(|n| Item::new(json!({"n": n}))).collect()
    }

    fn payloads(items: &[Item]) -> Vec<Value> {
        items.iter().map(|i| i.json().clone()).collect()
    }

    /// start -> prep -> deploy (gated) -> done
    fn gated_graph(breakpoint: BreakpointConfig, extra: Vec<NodeDefinition>) -> WorkflowGraph {
        let mut nodes = vec![
            start(),
            step("prep", "tag").with_parameters(json!({"prepared": true})),
            step("deploy", "tag")
                .with_parameters(json!({"env": "staging"}))
                .with_breakpoint(breakpoint),
            step("done", "echo"),
        ];
        nodes.extend(extra);
        graph(
            nodes,
            vec![
                ControlEdge::data("start", "prep"),
                ControlEdge::data("prep", "deploy"),
                ControlEdge::data("deploy", "done"),
            ],
        )
    }

    fn ops_gate() -> BreakpointConfig {
        BreakpointConfig {
            prompt: "ship it?".to_string(),
            approvers: vec!["ops".to_string()],
            ..BreakpointConfig::default()
        }
    }

    // -- data flow ---------------------------------------------------------

    #[tokio::test]
    async fn test_linear_run_pairs_items_and_traces() {
        let h = harness();
        let g = graph(
            vec![start(), step("double", "double")],
            vec![ControlEdge::data("start", "double")],
        );
        let result = h.engine.execute(&g, numbers(&[1, 2])).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.completed_nodes, vec!["start", "double"]);
        let doubled = result.result("double").unwrap();
        assert_eq!(payloads(doubled.port(0)), vec![json!({"n": 2}), json!({"n": 4})]);
        assert_eq!(doubled.port(0)[1].paired(), &[PairedItem::new(1, 0)]);
        assert_eq!(doubled.port(0)[1].origin().unwrap().node_id, "double");

        let entries = h.traces.list_entries(&result.run_id).await.unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=entries.len() as u64).collect::<Vec<_>>());
        assert!(matches!(
            entries.last().unwrap().event,
            TraceEvent::RunStatus {
                to: RunStatus::Completed,
                ..
            }
        ));
        let step = entries
            .iter()
            .filter_map(|e| e.step())
            .find(|s| s.step_id == "double")
            .unwrap();
        assert_eq!(step.input_items[&0].len(), 2);
        assert_eq!(step.item_count, 2);
    }

    #[tokio::test]
    async fn test_item_errors_contained_or_fatal_by_policy() {
        let h = harness();
        let continuing = graph(
            vec![
                start(),
                step("check", "reject_odd").with_item_error_policy(ItemErrorPolicy::Continue),
            ],
            vec![ControlEdge::data("start", "check")],
        );
        let result = h.engine.execute(&continuing, numbers(&[2, 3, 4])).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let check = result.result("check").unwrap();
        assert_eq!(check.status(), StepStatus::Partial);
        assert_eq!(check.port(0).len(), 3);
        assert!(check.port(0)[1].is_error());

        let stopping = graph(
            vec![start(), step("check", "reject_odd")],
            vec![ControlEdge::data("start", "check")],
        );
        let result = h.engine.execute(&stopping, numbers(&[2, 3, 4])).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.node_id.as_deref(), Some("check"));
        assert_eq!(failure.kind, ErrorKind::StepRuntime);
    }

    #[tokio::test]
    async fn test_branch_routes_one_label() {
        let h = harness();
        let route = NodeDefinition::new(
            "route",
            NodeKind::Branch {
                rules: vec![
                    flowgate_types::workflow::BranchRule {
                        label: "big".to_string(),
                        condition: Condition::equals("size", json!("big")),
                    },
                    flowgate_types::workflow::BranchRule {
                        label: "small".to_string(),
                        condition: Condition::equals("size", json!("small")),
                    },
                ],
                default_label: None,
            },
        );
        let g = graph(
            vec![start(), route, step("big", "echo"), step("small", "echo")],
            vec![
                ControlEdge::data("start", "route"),
                ControlEdge::data("route", "big").labelled("big"),
                ControlEdge::data("route", "small").labelled("small"),
            ],
        );

        let result = h.engine.execute(&g, vec![Item::new(json!({"size": "big"}))]).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(payloads(result.result("big").unwrap().port(0)), vec![json!({"size": "big"})]);
        assert!(result.result("small").is_none());

        let result = h.engine.execute(&g, vec![Item::new(json!({"size": "huge"}))]).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::NoBranchMatched);
        assert_eq!(failure.node_id.as_deref(), Some("route"));
    }

    #[tokio::test]
    async fn test_fork_and_merge_order_by_port() {
        let h = harness();
        let fan = |strategy: MergeStrategy| {
            graph(
                vec![
                    start(),
                    NodeDefinition::new("fork", NodeKind::Fork),
                    step("double", "double"),
                    step("label", "tag").with_parameters(json!({"tag": "x"})),
                    NodeDefinition::new("join", NodeKind::Merge { strategy }),
                ],
                vec![
                    ControlEdge::data("start", "fork"),
                    ControlEdge::data("fork", "double"),
                    ControlEdge::data("fork", "label"),
                    ControlEdge::data("label", "join").to_port(1),
                    ControlEdge::data("double", "join"),
                ],
            )
        };

        let result = h
            .engine
            .execute(&fan(MergeStrategy::Multiplex), numbers(&[1, 2]))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let joined = result.result("join").unwrap();
        assert_eq!(joined.port(0).len(), 2);
        assert_eq!(joined.port(0)[0].json()["n"], json!(2));
        assert_eq!(joined.port(0)[1].json()["n"], json!(4));
        assert!(joined.port(0).iter().all(|i| i.json()["tag"] == json!("x")));

        let result = h
            .engine
            .execute(&fan(MergeStrategy::Append), numbers(&[1, 2]))
            .await
            .unwrap();
        let joined = result.result("join").unwrap();
        assert_eq!(
            payloads(joined.port(0)),
            vec![json!({"n": 2}), json!({"n": 4}), json!({"tag": "x"})]
        );
    }

    #[tokio::test]
    async fn test_error_routed_as_data() {
        let h = harness();
        let g = graph(
            vec![start(), step("boom", "boom"), step("handler", "echo"), step("after", "echo")],
            vec![
                ControlEdge::data("start", "boom"),
                ControlEdge::data("boom", "handler").error_route(),
                ControlEdge::data("boom", "after"),
            ],
        );
        let result = h.engine.execute(&g, numbers(&[1])).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.result("boom").unwrap().is_error());
        assert!(result.result("after").is_none());
        let handled = result.result("handler").unwrap();
        assert_eq!(handled.port(0)[0].json()["error"]["node"], json!("boom"));
        assert_eq!(handled.port(0)[0].json()["error"]["message"], json!("boom"));
    }

    #[tokio::test]
    async fn test_loop_scopes_and_exports() {
        let h = harness();
        let each = NodeDefinition::new(
            "each",
            NodeKind::Loop {
                source: None,
                max_iterations: None,
                export: vec!["double".to_string()],
            },
        );
        let g = graph(
            vec![start(), each, step("double", "double"), step("total", "count")],
            vec![
                ControlEdge::data("start", "each"),
                ControlEdge::typed("each", "double", EdgeType::Iterate),
                ControlEdge::data("each", "total"),
            ],
        );
        let result = h.engine.execute(&g, numbers(&[1, 2, 3])).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let looped = result.result("each").unwrap();
        assert_eq!(
            payloads(looped.port(0)),
            vec![json!({"n": 2}), json!({"n": 4}), json!({"n": 6})]
        );
        assert_eq!(looped.port(0)[2].paired(), &[PairedItem::new(2, 0)]);
        // Only the final iteration is exported.
        assert_eq!(payloads(result.result("double").unwrap().port(0)), vec![json!({"n": 6})]);
        assert_eq!(result.result("total").unwrap().port(0)[0].json()["count"], json!(3));
        assert_eq!(result.context.depth(), 1);
    }

    #[tokio::test]
    async fn test_loop_limit_fails_node() {
        let h = harness();
        let each = NodeDefinition::new(
            "each",
            NodeKind::Loop {
                source: Some(json!([1, 2, 3])),
                max_iterations: Some(2),
                export: vec![],
            },
        );
        let g = graph(
            vec![each, step("echo", "echo")],
            vec![ControlEdge::typed("each", "echo", EdgeType::Iterate)],
        );
        let result = h.engine.execute(&g, vec![]).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure.unwrap().node_id.as_deref(), Some("each"));
    }

    #[tokio::test]
    async fn test_merge_deadline_times_out() {
        let h = harness();
        let g = graph(
            vec![
                start(),
                NodeDefinition::new("fork", NodeKind::Fork),
                step("fast", "echo"),
                step("slow", "slow"),
                NodeDefinition::new(
                    "join",
                    NodeKind::Merge {
                        strategy: MergeStrategy::Append,
                    },
                )
                .with_timeout_secs(1),
            ],
            vec![
                ControlEdge::data("start", "fork"),
                ControlEdge::data("fork", "fast"),
                ControlEdge::data("fork", "slow"),
                ControlEdge::data("fast", "join"),
                ControlEdge::data("slow", "join").to_port(1),
            ],
        );
        let result = h.engine.execute(&g, numbers(&[1])).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.node_id.as_deref(), Some("join"));
        assert_eq!(failure.kind, ErrorKind::NodeTimeout);
        assert!(result.result("slow").is_none());
    }

    fn yes_no_branch(id: &str) -> NodeDefinition {
        NodeDefinition::new(
            id,
            NodeKind::Branch {
                rules: vec![
                    flowgate_types::workflow::BranchRule {
                        label: "yes".to_string(),
                        condition: Condition::equals("ok", json!(true)),
                    },
                    flowgate_types::workflow::BranchRule {
                        label: "no".to_string(),
                        condition: Condition::equals("ok", json!(false)),
                    },
                ],
                default_label: None,
            },
        )
    }

    #[tokio::test]
    async fn test_dead_control_edge_skips_target() {
        let h = harness();
        let g = graph(
            vec![start(), yes_no_branch("route"), step("x", "echo"), step("other", "echo")],
            vec![
                ControlEdge::data("start", "route"),
                ControlEdge::data("start", "x"),
                ControlEdge::typed("route", "x", EdgeType::Control).labelled("yes"),
                ControlEdge::data("route", "other").labelled("no"),
            ],
        );

        // The data edge into x fired, but its gate did not.
        let result = h.engine.execute(&g, vec![Item::new(json!({"ok": false}))]).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.result("x").is_none());
        assert_eq!(result.result("other").unwrap().port(0).len(), 1);

        // An open gate adds no items of its own.
        let result = h.engine.execute(&g, vec![Item::new(json!({"ok": true}))]).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(payloads(result.result("x").unwrap().port(0)), vec![json!({"ok": true})]);
        assert!(result.result("other").is_none());
    }

    #[tokio::test]
    async fn test_done_edge_signals_without_items() {
        let h = harness();
        let each = NodeDefinition::new(
            "each",
            NodeKind::Loop {
                source: None,
                max_iterations: None,
                export: vec![],
            },
        );
        let g = graph(
            vec![
                start(),
                each,
                step("double", "double"),
                step("after", "count"),
                step("total", "count"),
            ],
            vec![
                ControlEdge::data("start", "each"),
                ControlEdge::typed("each", "double", EdgeType::Iterate),
                ControlEdge::typed("each", "after", EdgeType::Done),
                ControlEdge::data("each", "total"),
            ],
        );
        let result = h.engine.execute(&g, numbers(&[1, 2, 3])).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.result("after").unwrap().port(0)[0].json()["count"], json!(0));
        assert_eq!(result.result("total").unwrap().port(0)[0].json()["count"], json!(3));
    }

    #[tokio::test]
    async fn test_split_modes_partition_items() {
        let h = harness();
        let two_way = |mode: SplitMode| {
            graph(
                vec![
                    start(),
                    NodeDefinition::new("split", NodeKind::Split { mode }),
                    step("a", "echo"),
                    step("b", "echo"),
                ],
                vec![
                    ControlEdge::data("start", "split"),
                    ControlEdge::data("split", "a"),
                    ControlEdge::data("split", "b").from_port(1),
                ],
            )
        };

        let result = h
            .engine
            .execute(&two_way(SplitMode::Clone), numbers(&[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.result("a").unwrap().port(0).len(), 3);
        assert_eq!(result.result("b").unwrap().port(0).len(), 3);

        let result = h
            .engine
            .execute(&two_way(SplitMode::Distribute), numbers(&[1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(
            payloads(result.result("a").unwrap().port(0)),
            vec![json!({"n": 1}), json!({"n": 3})]
        );
        assert_eq!(payloads(result.result("b").unwrap().port(0)), vec![json!({"n": 2})]);

        // Edges declared against route order; labels pick the route.
        let routes = vec![
            SplitRoute {
                label: "small".to_string(),
                condition: Condition::equals("size", json!("small")),
            },
            SplitRoute {
                label: "big".to_string(),
                condition: Condition::equals("size", json!("big")),
            },
        ];
        let g = graph(
            vec![
                start(),
                NodeDefinition::new(
                    "split",
                    NodeKind::Split {
                        mode: SplitMode::Filter { routes },
                    },
                ),
                step("large", "echo"),
                step("little", "echo"),
            ],
            vec![
                ControlEdge::data("start", "split"),
                ControlEdge::data("split", "large").labelled("big"),
                ControlEdge::data("split", "little").labelled("small"),
            ],
        );
        let trigger = vec![
            Item::new(json!({"size": "small", "id": 1})),
            Item::new(json!({"size": "big", "id": 2})),
            Item::new(json!({"size": "small", "id": 3})),
        ];
        let result = h.engine.execute(&g, trigger).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            payloads(result.result("large").unwrap().port(0)),
            vec![json!({"size": "big", "id": 2})]
        );
        let little: Vec<Value> = result
            .result("little")
            .unwrap()
            .port(0)
            .iter()
            .map(|i| i.json()["id"].clone())
            .collect();
        assert_eq!(little, vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn test_wait_all_skipped_when_a_branch_died() {
        let h = harness();
        let joined = |strategy: MergeStrategy| {
            graph(
                vec![
                    start(),
                    yes_no_branch("route"),
                    step("a", "echo"),
                    step("b", "echo"),
                    NodeDefinition::new("join", NodeKind::Merge { strategy }),
                ],
                vec![
                    ControlEdge::data("start", "route"),
                    ControlEdge::data("route", "a").labelled("yes"),
                    ControlEdge::data("route", "b").labelled("no"),
                    ControlEdge::data("a", "join"),
                    ControlEdge::data("b", "join").to_port(1),
                ],
            )
        };
        let trigger = || vec![Item::new(json!({"ok": true}))];

        let result = h
            .engine
            .execute(&joined(MergeStrategy::WaitAll), trigger())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.result("a").is_some());
        assert!(result.result("b").is_none());
        assert!(result.result("join").is_none());

        let result = h
            .engine
            .execute(&joined(MergeStrategy::Append), trigger())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            payloads(result.result("join").unwrap().port(0)),
            vec![json!({"ok": true})]
        );
    }

    #[tokio::test]
    async fn test_combine_by_key_joins_branches() {
        let h = harness();
        let keyed = |keep_unmatched: bool| {
            graph(
                vec![
                    start(),
                    NodeDefinition::new("fork", NodeKind::Fork),
                    step("left", "echo"),
                    step("right", "tag").with_parameters(json!({"id": 2, "color": "red"})),
                    NodeDefinition::new(
                        "join",
                        NodeKind::Merge {
                            strategy: MergeStrategy::CombineByKey {
                                key: "id".to_string(),
                                keep_unmatched,
                            },
                        },
                    ),
                ],
                vec![
                    ControlEdge::data("start", "fork"),
                    ControlEdge::data("fork", "left"),
                    ControlEdge::data("fork", "right"),
                    ControlEdge::data("left", "join"),
                    ControlEdge::data("right", "join").to_port(1),
                ],
            )
        };
        let trigger = || {
            vec![
                Item::new(json!({"id": 1, "name": "a"})),
                Item::new(json!({"id": 2, "name": "b"})),
            ]
        };

        let result = h.engine.execute(&keyed(false), trigger()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            payloads(result.result("join").unwrap().port(0)),
            vec![json!({"id": 2, "name": "b", "color": "red"})]
        );

        let result = h.engine.execute(&keyed(true), trigger()).await.unwrap();
        assert_eq!(
            payloads(result.result("join").unwrap().port(0)),
            vec![
                json!({"id": 1, "name": "a"}),
                json!({"id": 2, "name": "b", "color": "red"}),
            ]
        );
    }

    // -- breakpoints -------------------------------------------------------

    #[tokio::test]
    async fn test_approval_resumes_without_rerunning() {
        let h = harness();
        let g = gated_graph(ops_gate(), vec![]);
        let mut events = h.engine.event_bus().subscribe();

        let suspended = h.engine.execute(&g, numbers(&[1])).await.unwrap();
        assert_eq!(suspended.status, RunStatus::Suspended);
        assert_eq!(suspended.pending.len(), 1);
        assert_eq!(suspended.pending[0].node_id, "deploy");
        assert!(suspended.result("deploy").is_none());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.runs.load_suspended(&suspended.run_id).await.unwrap().is_some());

        let mut requested = false;
        while let Ok(event) = events.try_recv() {
            requested |= matches!(event, WorkflowEvent::BreakpointRequested { .. });
        }
        assert!(requested);

        let listed = h.engine.list_pending(Some("ops")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(h.engine.list_pending(Some("dev")).await.unwrap().is_empty());

        let outcome = h
            .engine
            .resolve_breakpoint(
                suspended.pending[0].id,
                Decision::approve("ops").with_field("env", json!("prod")),
            )
            .await
            .unwrap();
        let ResolveOutcome::Resumed(result) = outcome else {
            panic!("expected the run to resume");
        };

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.run_id, suspended.run_id);
        // prep ran once, deploy once after approval.
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            result.result("prep").unwrap().outputs(),
            suspended.result("prep").unwrap().outputs()
        );
        assert_eq!(result.result("deploy").unwrap().port(0)[0].json()["env"], json!("prod"));
        assert_eq!(result.result("done").unwrap().port(0)[0].json()["env"], json!("prod"));
        assert_eq!(
            result.context.variable("approval").unwrap()["deploy"]["env"],
            json!("prod")
        );

        assert!(h.runs.load_suspended(&result.run_id).await.unwrap().is_none());
        assert_eq!(h.runs.archived(&result.run_id)[0].status, BreakpointStatus::Approved);

        let entries = h.traces.list_entries(&result.run_id).await.unwrap();
        let sequences: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=entries.len() as u64).collect::<Vec<_>>());

        assert!(matches!(
            h.engine
                .resolve_breakpoint(suspended.pending[0].id, Decision::approve("ops"))
                .await,
            Err(EngineError::Gate(GateError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_all_mode_needs_every_approver() {
        let h = harness();
        let gate = BreakpointConfig {
            approvers: vec!["a".to_string(), "b".to_string()],
            mode: ApprovalMode::All,
            ..BreakpointConfig::default()
        };
        let suspended = h.engine.execute(&gated_graph(gate, vec![]), numbers(&[1])).await.unwrap();
        let request_id = suspended.pending[0].id;

        let first = h
            .engine
            .resolve_breakpoint(request_id, Decision::approve("a"))
            .await
            .unwrap();
        assert!(matches!(first, ResolveOutcome::Pending(ref r) if r.votes.len() == 1));
        let stored = h.runs.load_suspended(&suspended.run_id).await.unwrap().unwrap();
        assert_eq!(stored.sequence, suspended.suspended.as_ref().unwrap().sequence + 1);

        let second = h
            .engine
            .resolve_breakpoint(request_id, Decision::approve("b"))
            .await
            .unwrap();
        let ResolveOutcome::Resumed(result) = second else {
            panic!("expected the run to resume");
        };
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_rejection_fails_or_diverts() {
        let h = harness();
        let suspended = h.engine.execute(&gated_graph(ops_gate(), vec![]), numbers(&[1])).await.unwrap();
        let ResolveOutcome::Resumed(result) = h
            .engine
            .resolve_breakpoint(
                suspended.pending[0].id,
                Decision::reject("ops").with_comment("freeze"),
            )
            .await
            .unwrap()
        else {
            panic!("expected the run to resume");
        };
        assert_eq!(result.status, RunStatus::Failed);
        let failure = result.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::BreakpointRejected);
        assert_eq!(failure.node_id.as_deref(), Some("deploy"));
        assert!(failure.message.contains("freeze"));

        let gate = BreakpointConfig {
            on_reject: Some("notify".to_string()),
            ..ops_gate()
        };
        let notify = step("notify", "echo");
        let suspended = h
            .engine
            .execute(&gated_graph(gate, vec![notify]), numbers(&[1]))
            .await
            .unwrap();
        assert_eq!(suspended.status, RunStatus::Suspended);
        let ResolveOutcome::Resumed(result) = h
            .engine
            .resolve_breakpoint(suspended.pending[0].id, Decision::reject("ops"))
            .await
            .unwrap()
        else {
            panic!("expected the run to resume");
        };
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.result("deploy").is_none());
        assert!(result.result("done").is_none());
        // notify receives the gated node's inputs.
        assert_eq!(
            payloads(result.result("notify").unwrap().port(0)),
            vec![json!({"prepared": true})]
        );
    }

    #[tokio::test]
    async fn test_overdue_requests_escalate() {
        let h = harness();
        let gate = BreakpointConfig {
            deadline_secs: Some(60),
            on_expire: ExpiryAction::Escalate {
                node: "page".to_string(),
            },
            ..ops_gate()
        };
        let page = step("page", "tag").with_parameters(json!({"paged": true}));
        let suspended = h
            .engine
            .execute(&gated_graph(gate, vec![page]), numbers(&[1]))
            .await
            .unwrap();
        assert!(suspended.pending[0].deadline.is_some());

        assert!(h.engine.expire_overdue(Utc::now()).await.unwrap().is_empty());

        let results = h
            .engine
            .expire_overdue(Utc::now() + chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RunStatus::Completed);
        assert_eq!(results[0].result("page").unwrap().port(0)[0].json()["paged"], json!(true));
        assert_eq!(h.runs.archived(&suspended.run_id)[0].status, BreakpointStatus::Expired);
    }

    #[tokio::test]
    async fn test_stale_release_is_refused() {
        let h = harness();
        let suspended = h.engine.execute(&gated_graph(ops_gate(), vec![]), numbers(&[1])).await.unwrap();
        let mut snapshot = suspended.suspended.clone().unwrap();

        // Another writer moves the stored run forward.
        let mut newer = snapshot.clone();
        newer.sequence += 1;
        h.runs.save_suspended(&newer, Some(snapshot.sequence)).await.unwrap();

        let request_id = snapshot.pending().next().unwrap().id;
        let request = snapshot.request_mut(request_id).unwrap();
        BreakpointGate::vote(request, Decision::approve("ops"), Utc::now()).unwrap();
        let request = request.clone();
        assert!(matches!(
            h.engine.continue_run(snapshot, request).await,
            Err(EngineError::Checkpoint(CheckpointError::Stale(_)))
        ));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_decision_follows_expiry_action() {
        let h = harness();
        let gate = BreakpointConfig {
            deadline_secs: Some(0),
            on_expire: ExpiryAction::Escalate {
                node: "page".to_string(),
            },
            ..ops_gate()
        };
        let page = step("page", "tag").with_parameters(json!({"paged": true}));
        let suspended = h
            .engine
            .execute(&gated_graph(gate, vec![page]), numbers(&[1]))
            .await
            .unwrap();
        assert_eq!(suspended.status, RunStatus::Suspended);

        let outcome = h
            .engine
            .resolve_breakpoint(suspended.pending[0].id, Decision::approve("ops"))
            .await
            .unwrap();
        let ResolveOutcome::Resumed(result) = outcome else {
            panic!("expected the run to resume");
        };
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.result("deploy").is_none());
        assert!(result.result("done").is_none());
        assert_eq!(result.result("page").unwrap().port(0)[0].json()["paged"], json!(true));
        // prep and page only; the approval never reached deploy.
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.runs.archived(&suspended.run_id)[0].status, BreakpointStatus::Expired);
    }

    #[tokio::test]
    async fn test_request_must_gate_a_node_of_the_run() {
        let h = harness();
        let suspended = h.engine.execute(&gated_graph(ops_gate(), vec![]), numbers(&[1])).await.unwrap();
        let mut snapshot = suspended.suspended.clone().unwrap();
        let request_id = snapshot.pending().next().unwrap().id;
        assert_eq!(snapshot.frontier.gated_by(request_id), Some("deploy"));

        let request = snapshot.request_mut(request_id).unwrap();
        BreakpointGate::vote(request, Decision::approve("ops"), Utc::now()).unwrap();
        let request = request.clone();
        snapshot.frontier.set_node("deploy", NodeState::Pending);

        assert!(matches!(
            h.engine.continue_run(snapshot, request).await,
            Err(EngineError::Checkpoint(CheckpointError::Stale(_)))
        ));
        // Nothing was released or re-run.
        assert!(h.runs.load_suspended(&suspended.run_id).await.unwrap().is_some());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    // -- cancellation ------------------------------------------------------

    #[tokio::test]
    async fn test_cancel_mid_fork_posts_nothing_more() {
        let h = harness();
        let g = graph(
            vec![
                start(),
                NodeDefinition::new("fork", NodeKind::Fork),
                step("fast", "echo"),
                step("slow", "slow"),
                NodeDefinition::new(
                    "join",
                    NodeKind::Merge {
                        strategy: MergeStrategy::WaitAll,
                    },
                ),
            ],
            vec![
                ControlEdge::data("start", "fork"),
                ControlEdge::data("fork", "fast"),
                ControlEdge::data("fork", "slow"),
                ControlEdge::data("fast", "join"),
                ControlEdge::data("slow", "join").to_port(1),
            ],
        );
        let mut events = h.engine.event_bus().subscribe();
        let engine = Arc::clone(&h.engine);
        let handle = tokio::spawn(async move { engine.execute(&g, numbers(&[1])).await });

        let mut run_id = None;
        loop {
            match events.recv().await.unwrap() {
                WorkflowEvent::RunStarted { run_id: id, .. } => run_id = Some(id),
                WorkflowEvent::NodeCompleted { node_id, .. } if node_id == "fast" => break,
                _ => {}
            }
        }
        h.engine.cancel(run_id.unwrap()).await.unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert!(result.result("fast").is_some());
        assert!(result.result("slow").is_none());
        assert!(result.result("join").is_none());
    }

    #[tokio::test]
    async fn test_cancel_suspended_run_archives_it() {
        let h = harness();
        let suspended = h.engine.execute(&gated_graph(ops_gate(), vec![]), numbers(&[1])).await.unwrap();
        h.engine.cancel(suspended.run_id).await.unwrap();

        assert!(h.runs.load_suspended(&suspended.run_id).await.unwrap().is_none());
        assert_eq!(h.runs.archived(&suspended.run_id).len(), 1);
        assert!(matches!(
            h.engine.cancel(suspended.run_id).await,
            Err(EngineError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_graph_is_an_engine_error() {
        let h = harness();
        let g = graph(vec![step("a", "missing")], vec![]);
        assert!(matches!(
            h.engine.execute(&g, vec![]).await,
            Err(EngineError::Workflow(WorkflowError::UnknownStep { .. }))
        ));
    }
}
