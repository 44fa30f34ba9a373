//! Step runner: executes one step node and produces its `StepResult`.
//!
//! `StepRunner` dispatches on the registered [`StepHandler`] variant:
//! - `single` -- parameters resolved once, input items ignored
//! - `items` -- parameters resolved per input item (`$item`/`$index` bound),
//!   one call per item in input order, per-item failures contained under the
//!   `continue` policy
//! - `all` -- one call with the full collection, partitioned by input port
//!
//! Every attempt runs under the node timeout; failed attempts are retried per
//! the node's `RetryPolicy`. Output items are stamped with their origin and,
//! when the step left it empty, a pairing back to their source item.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use flowgate_types::error::{ErrorKind, NodeError};
use flowgate_types::event::WorkflowEvent;
use flowgate_types::item::{Item, ItemStatus, ItemTrace, StepResult, StepTiming};
use flowgate_types::workflow::{ItemErrorPolicy, NodeDefinition, NodeKind};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::event::bus::EventBus;

use super::context::{ExecutionContext, ScopeId, ScopeRef};
use super::expression::resolve;
use super::retry::RetryHandler;
use super::step::{BatchInput, ItemStepDyn, StepContext, StepHandler, StepRegistry, StepSchema};

// ---------------------------------------------------------------------------
// Invocation / execution
// ---------------------------------------------------------------------------

/// Everything a step node needs to run, detached from the scheduler.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Read-only snapshot of the context at dispatch time.
    pub context: Arc<ExecutionContext>,
    pub scope: ScopeId,
    /// Input items by input port (only item-carrying edges contribute).
    pub inputs: Vec<Vec<Item>>,
    /// Approver-supplied fields merged over the node's parameters.
    pub overrides: Option<Map<String, Value>>,
    pub item_error_policy: ItemErrorPolicy,
    pub cancel: CancellationToken,
}

/// Outcome of one step node execution.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub result: StepResult,
    /// Resolved parameters (the template itself for `items` mode).
    pub parameters: Value,
}

/// Tunables applied to every step.
#[derive(Debug, Clone)]
pub struct RunnerLimits {
    pub default_timeout: Duration,
    pub item_concurrency: usize,
    pub max_output_bytes: usize,
}

/// Per-attempt success payload.
struct AttemptOutput {
    ports: Vec<Vec<Item>>,
    traces: Vec<ItemTrace>,
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes step nodes through the registered step handlers.
pub struct StepRunner {
    registry: Arc<StepRegistry>,
    limits: RunnerLimits,
    event_bus: EventBus,
}

impl StepRunner {
    pub fn new(registry: Arc<StepRegistry>, limits: RunnerLimits, event_bus: EventBus) -> Self {
        Self {
            registry,
            limits,
            event_bus,
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Run a step node to completion (all attempts included).
    pub async fn run(&self, node: &NodeDefinition, invocation: StepInvocation) -> StepExecution {
        let started_at = Utc::now();
        let template = merged_parameters(&node.parameters, invocation.overrides.as_ref());

        let NodeKind::Step { step } = &node.kind else {
            let error = NodeError::new(&node.id, ErrorKind::Validation, "not a step node");
            return StepExecution {
                result: StepResult::failed(error, StepTiming::new(started_at, Utc::now(), 1)),
                parameters: template,
            };
        };
        let Some(handler) = self.registry.get(step).cloned() else {
            let error = NodeError::new(
                &node.id,
                ErrorKind::Validation,
                format!("unknown step type '{step}'"),
            );
            return StepExecution {
                result: StepResult::failed(error, StepTiming::new(started_at, Utc::now(), 1)),
                parameters: template,
            };
        };

        let timeout = node
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.limits.default_timeout);
        let run_id = invocation.context.run_id();
        let mut attempt = 1u32;

        loop {
            let step_ctx = StepContext {
                run_id,
                node_id: node.id.clone(),
                attempt,
                cancel: invocation.cancel.clone(),
            };

            let outcome = match tokio::time::timeout(
                timeout,
                self.attempt(&handler, &step_ctx, &template, &invocation),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(NodeError::new(
                    &node.id,
                    ErrorKind::NodeTimeout,
                    format!("timed out after {}s", timeout.as_secs_f64()),
                )),
            };

            let (ports, traces, parameters) = match outcome {
                Ok((output, parameters)) => (output.ports, output.traces, parameters),
                Err(error) => {
                    let retry = node
                        .retry
                        .as_ref()
                        .is_some_and(|p| RetryHandler::should_retry(p, attempt, error.kind))
                        && !invocation.cancel.is_cancelled();
                    if let Some(policy) = node.retry.as_ref().filter(|_| retry) {
                        let backoff = RetryHandler::backoff(policy, attempt);
                        tracing::debug!(
                            node_id = %node.id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %error.message,
                            "retrying node"
                        );
                        self.event_bus.publish(WorkflowEvent::NodeFailed {
                            run_id,
                            node_id: node.id.clone(),
                            kind: error.kind,
                            error: error.message.clone(),
                            will_retry: true,
                        });
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = invocation.cancel.cancelled() => {}
                        }
                        attempt += 1;
                        continue;
                    }
                    return StepExecution {
                        result: StepResult::failed(error, StepTiming::new(started_at, Utc::now(), attempt)),
                        parameters: template,
                    };
                }
            };

            let timing = StepTiming::new(started_at, Utc::now(), attempt);
            let ports = stamp_origin(&node.id, ports);
            if let Err(error) = self.check_output(&node.id, &handler.schema(), &ports) {
                return StepExecution {
                    result: StepResult::failed(error, timing),
                    parameters,
                };
            }
            let result = StepResult::success(&node.id, ports, timing).with_item_traces(traces);
            return StepExecution { result, parameters };
        }
    }

    async fn attempt(
        &self,
        handler: &StepHandler,
        ctx: &StepContext,
        template: &Value,
        invocation: &StepInvocation,
    ) -> Result<(AttemptOutput, Value), NodeError> {
        let view = invocation.context.view(invocation.scope);
        let node_id = ctx.node_id.as_str();

        match handler {
            StepHandler::Single(step) => {
                let params = resolve(template, &view)
                    .map_err(|e| NodeError::new(node_id, ErrorKind::Resolution, e.to_string()))?;
                step.schema()
                    .check_params(&params)
                    .map_err(|e| NodeError::new(node_id, ErrorKind::TypeMismatch, e.to_string()))?;
                let output = step
                    .run_boxed(ctx, &params)
                    .await
                    .map_err(|e| NodeError::new(node_id, e.error_kind(), e.message))?;
                Ok((
                    AttemptOutput {
                        ports: output.into_ports(),
                        traces: Vec::new(),
                    },
                    params,
                ))
            }
            StepHandler::All(step) => {
                let params = resolve(template, &view)
                    .map_err(|e| NodeError::new(node_id, ErrorKind::Resolution, e.to_string()))?;
                step.schema()
                    .check_params(&params)
                    .map_err(|e| NodeError::new(node_id, ErrorKind::TypeMismatch, e.to_string()))?;
                let input = BatchInput::new(invocation.inputs.clone());
                let output = step
                    .run_batch_boxed(ctx, &params, &input)
                    .await
                    .map_err(|e| NodeError::new(node_id, e.error_kind(), e.message))?;
                let mut ports = output.into_ports();
                // A single source item makes every output a 1:N child of it.
                if let Some((port, _)) = single_source(&invocation.inputs) {
                    for item in ports.iter_mut().flatten() {
                        if item.paired().is_empty() {
                            *item = std::mem::take(item).paired_with(0, port);
                        }
                    }
                }
                Ok((AttemptOutput { ports, traces: Vec::new() }, params))
            }
            StepHandler::Items(step) => {
                let output = self
                    .run_items(step.as_ref(), ctx, template, invocation)
                    .await?;
                Ok((output, template.clone()))
            }
        }
    }

    async fn run_items(
        &self,
        step: &dyn ItemStepDyn,
        ctx: &StepContext,
        template: &Value,
        invocation: &StepInvocation,
    ) -> Result<AttemptOutput, NodeError> {
        let node_id = ctx.node_id.as_str();
        let schema = step.schema();
        let view = invocation.context.view(invocation.scope);

        // (flat index, input port, index within port, item)
        let inputs: Vec<(usize, usize, usize, &Item)> = invocation
            .inputs
            .iter()
            .enumerate()
            .flat_map(|(port, items)| items.iter().enumerate().map(move |(i, item)| (port, i, item)))
            .enumerate()
            .map(|(flat, (port, i, item))| (flat, port, i, item))
            .collect();

        let job = ItemJob {
            step,
            schema: &schema,
            ctx,
            template,
            view,
        };

        let stop_on_failure = invocation.item_error_policy == ItemErrorPolicy::Stop;
        let parallelism = step.parallelism().clamp(1, self.limits.item_concurrency.max(1));
        let mut outcomes = Vec::with_capacity(inputs.len());
        if parallelism == 1 {
            for &(flat, port, index, item) in &inputs {
                let processed = job.process(flat, port, index, item).await;
                let failed = matches!(processed.outcome, ItemOutcome::Failed(..));
                outcomes.push(processed);
                if failed && stop_on_failure {
                    break;
                }
            }
        } else {
            let job = &job;
            let pending: Vec<_> = inputs
                .iter()
                .map(|&(flat, port, index, item)| job.process(flat, port, index, item))
                .collect();
            let mut stream = futures_util::stream::iter(pending).buffer_unordered(parallelism);
            // Dropping the stream on the first failure cancels in-flight items
            // and never starts the rest.
            while let Some(processed) = stream.next().await {
                let failed = matches!(processed.outcome, ItemOutcome::Failed(..));
                outcomes.push(processed);
                if failed && stop_on_failure {
                    break;
                }
            }
            drop(stream);
            outcomes.sort_by_key(|p| p.flat);
        }

        let mut ports: Vec<Vec<Item>> = vec![Vec::new()];
        let mut traces = Vec::with_capacity(outcomes.len());
        let mut processed = 0usize;
        let mut failed = 0usize;

        for ProcessedItem {
            flat,
            port,
            index,
            duration_ms,
            outcome,
        } in outcomes
        {
            match outcome {
                ItemOutcome::Forwarded(item) => {
                    ports[0].push(item.paired_with(index, port));
                    traces.push(ItemTrace {
                        index: flat,
                        status: ItemStatus::Forwarded,
                        duration_ms,
                        error: None,
                    });
                }
                ItemOutcome::Produced(out_ports) => {
                    processed += 1;
                    if ports.len() < out_ports.len() {
                        ports.resize_with(out_ports.len(), Vec::new);
                    }
                    for (out_port, items) in out_ports.into_iter().enumerate() {
                        ports[out_port].extend(items.into_iter().map(|item| {
                            if item.paired().is_empty() {
                                item.paired_with(index, port)
                            } else {
                                item
                            }
                        }));
                    }
                    traces.push(ItemTrace {
                        index: flat,
                        status: ItemStatus::Success,
                        duration_ms,
                        error: None,
                    });
                }
                ItemOutcome::Failed(kind, message) => {
                    processed += 1;
                    failed += 1;
                    if stop_on_failure {
                        return Err(NodeError::new(node_id, kind, format!("item {flat}: {message}")));
                    }
                    tracing::debug!(node_id, item = flat, error = %message, "item failed, continuing");
                    ports[0].push(Item::from_error(kind, message.clone()).paired_with(index, port));
                    traces.push(ItemTrace {
                        index: flat,
                        status: ItemStatus::Error,
                        duration_ms,
                        error: Some(message),
                    });
                }
            }
        }

        if processed > 0 && failed == processed {
            return Err(NodeError::new(
                node_id,
                ErrorKind::StepRuntime,
                format!("all {processed} items failed"),
            ));
        }

        Ok(AttemptOutput { ports, traces })
    }

    fn check_output(&self, node_id: &str, schema: &StepSchema, ports: &[Vec<Item>]) -> Result<(), NodeError> {
        for item in ports.iter().flatten().filter(|i| !i.is_error()) {
            schema
                .check_output(item.json())
                .map_err(|e| NodeError::new(node_id, ErrorKind::TypeMismatch, e.to_string()))?;
        }
        let size = serde_json::to_vec(ports).map(|b| b.len()).unwrap_or(0);
        if size > self.limits.max_output_bytes {
            tracing::warn!(node_id, size, max = self.limits.max_output_bytes, "step output exceeds size limit");
            return Err(NodeError::new(
                node_id,
                ErrorKind::StepRuntime,
                format!(
                    "output of {size} bytes exceeds the {} byte limit",
                    self.limits.max_output_bytes
                ),
            ));
        }
        Ok(())
    }
}

enum ItemOutcome {
    Produced(Vec<Vec<Item>>),
    Forwarded(Item),
    Failed(ErrorKind, String),
}

struct ProcessedItem {
    /// Position in the flattened input.
    flat: usize,
    port: usize,
    /// Position within `port`.
    index: usize,
    duration_ms: u64,
    outcome: ItemOutcome,
}

/// Shared, borrowed state for processing the items of one attempt.
struct ItemJob<'a> {
    step: &'a dyn ItemStepDyn,
    schema: &'a StepSchema,
    ctx: &'a StepContext,
    template: &'a Value,
    view: ScopeRef<'a>,
}

impl<'a> ItemJob<'a> {
    async fn process(&self, flat: usize, port: usize, index: usize, item: &'a Item) -> ProcessedItem {
        let started = Instant::now();
        let outcome = self.outcome(flat, item).await;
        ProcessedItem {
            flat,
            port,
            index,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
        }
    }

    async fn outcome(&self, flat: usize, item: &'a Item) -> ItemOutcome {
        if item.is_error() {
            return ItemOutcome::Forwarded(item.clone());
        }
        let params = match resolve(self.template, &self.view.with_item(item, flat)) {
            Ok(params) => params,
            Err(e) => return ItemOutcome::Failed(ErrorKind::Resolution, e.to_string()),
        };
        if let Err(e) = self.schema.check_params(&params) {
            return ItemOutcome::Failed(ErrorKind::TypeMismatch, e.to_string());
        }
        match self.step.run_item_boxed(self.ctx, &params, item, flat).await {
            Ok(output) => ItemOutcome::Produced(output.into_ports()),
            Err(e) => ItemOutcome::Failed(e.error_kind(), e.message),
        }
    }
}

/// Shallow merge of approver fields over the node parameters (approver wins).
pub fn merged_parameters(parameters: &Value, overrides: Option<&Map<String, Value>>) -> Value {
    match (parameters, overrides) {
        (Value::Object(base), Some(fields)) => {
            let mut merged = base.clone();
            merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        (_, Some(fields)) => Value::Object(fields.clone()),
        (params, None) => params.clone(),
    }
}

/// Stamp `origin` on every item: producing node plus index within its port.
pub fn stamp_origin(node_id: &str, ports: Vec<Vec<Item>>) -> Vec<Vec<Item>> {
    ports
        .into_iter()
        .map(|items| {
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| item.with_origin(node_id, i))
                .collect()
        })
        .collect()
}

/// The `(port, item)` of the only input item, if there is exactly one.
fn single_source(inputs: &[Vec<Item>]) -> Option<(usize, &Item)> {
    let mut found = None;
    for (port, items) in inputs.iter().enumerate() {
        for item in items {
            if found.is_some() {
                return None;
            }
            found = Some((port, item));
        }
    }
    found
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
