//! Step contract: the interface pluggable units of work implement.
//!
//! A step declares its execution mode by which trait it implements:
//! 1. [`SingleStep`] -- one call per node execution, input items ignored
//! 2. [`ItemStep`] -- one call per input item, in input order
//! 3. [`BatchStep`] -- one call with the whole ordered collection
//!
//! Each trait uses RPITIT and therefore is not object-safe. Following the
//! boxed-provider pattern, every trait has an object-safe `*Dyn` companion
//! with a blanket impl, and [`StepRegistry`] stores the resulting closed
//! [`StepHandler`] variant, resolved once at registration.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use flowgate_types::condition::Condition;
use flowgate_types::error::ErrorKind;
use flowgate_types::item::Item;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::expression::evaluate_condition;

// ---------------------------------------------------------------------------
// Step I/O
// ---------------------------------------------------------------------------

/// Execution mode of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Single,
    Items,
    All,
}

/// Per-invocation metadata handed to a step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the run is cancelled; long-running steps should observe it.
    pub cancel: CancellationToken,
}

/// What a step returns.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    /// A raw value, wrapped into a single item on port 0.
    Value(Value),
    /// Explicit items on port 0.
    Items(Vec<Item>),
    /// Explicit items per output port.
    Ports(Vec<Vec<Item>>),
}

impl StepOutput {
    /// Normalise into items per port.
    pub fn into_ports(self) -> Vec<Vec<Item>> {
        match self {
            StepOutput::Value(value) => vec![vec![Item::new(value)]],
            StepOutput::Items(items) => vec![items],
            StepOutput::Ports(ports) => ports,
        }
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        StepOutput::Value(value)
    }
}

/// Input of a [`BatchStep`]: items partitioned by input port.
#[derive(Debug, Clone, Default)]
pub struct BatchInput {
    by_port: Vec<Vec<Item>>,
}

impl BatchInput {
    pub fn new(by_port: Vec<Vec<Item>>) -> Self {
        Self { by_port }
    }

    /// Items partitioned by input port.
    pub fn by_port(&self) -> &[Vec<Item>] {
        &self.by_port
    }

    /// Flattened view, lowest port first.
    pub fn merged(&self) -> impl Iterator<Item = &Item> {
        self.by_port.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_port.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a failure is an opaque step failure or an infrastructure fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Runtime,
    /// Transient infrastructure failure; retryable under the default policy.
    System,
}

/// Error returned by a step implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Runtime,
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::System,
            message: message.into(),
        }
    }

    /// Engine error kind this failure maps to.
    pub fn error_kind(&self) -> ErrorKind {
        match self.kind {
            StepErrorKind::Runtime => ErrorKind::StepRuntime,
            StepErrorKind::System => ErrorKind::System,
        }
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Declared type tag of a parameter or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ValueType {
    /// Whether `value` conforms to this type tag.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
            ValueType::Any => true,
        }
    }

    /// Type tag describing `value`.
    pub fn of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_f64() => "number",
            Value::Number(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    /// Visibility condition over the parameter snapshot; hidden parameters
    /// are neither required nor type-checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<Condition>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: false,
            display: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn shown_when(mut self, condition: Condition) -> Self {
        self.display = Some(condition);
        self
    }
}

/// Declared inputs and output of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSchema {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Expected type of every output item payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ValueType>,
}

/// Declared vs actual type disagreement.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("'{field}' expected {expected:?}, got {actual}")]
pub struct TypeMismatch {
    pub field: String,
    pub expected: ValueType,
    pub actual: &'static str,
}

impl StepSchema {
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_output(mut self, output: ValueType) -> Self {
        self.output = Some(output);
        self
    }

    /// Names of the parameters visible for this snapshot.
    pub fn visible_params<'a>(&'a self, params: &'a Value) -> impl Iterator<Item = &'a ParamSpec> + 'a {
        self.params.iter().filter(move |p| {
            p.display
                .as_ref()
                .is_none_or(|cond| evaluate_condition(cond, params))
        })
    }

    /// Check resolved parameters against the declared types.
    pub fn check_params(&self, params: &Value) -> Result<(), TypeMismatch> {
        for spec in self.visible_params(params) {
            match params.get(&spec.name) {
                Some(value) if !spec.value_type.matches(value) => {
                    return Err(TypeMismatch {
                        field: spec.name.clone(),
                        expected: spec.value_type,
                        actual: ValueType::of(value),
                    });
                }
                None if spec.required => {
                    return Err(TypeMismatch {
                        field: spec.name.clone(),
                        expected: spec.value_type,
                        actual: "missing",
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check one produced item payload against the declared output type.
    pub fn check_output(&self, payload: &Value) -> Result<(), TypeMismatch> {
        match self.output {
            Some(expected) if !expected.matches(payload) => Err(TypeMismatch {
                field: "output".to_string(),
                expected,
                actual: ValueType::of(payload),
            }),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Step traits
// ---------------------------------------------------------------------------

/// A step invoked once per node execution.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SingleStep: Send + Sync {
    fn schema(&self) -> StepSchema {
        StepSchema::default()
    }

    fn run(
        &self,
        ctx: &StepContext,
        params: &Value,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send;
}

/// A step invoked once per input item.
pub trait ItemStep: Send + Sync {
    fn schema(&self) -> StepSchema {
        StepSchema::default()
    }

    /// Maximum items processed concurrently. Output order is always
    /// reconstructed from input order.
    fn parallelism(&self) -> usize {
        1
    }

    /// Process one item. `params` are resolved with `$item` bound to `item`.
    fn run_item(
        &self,
        ctx: &StepContext,
        params: &Value,
        item: &Item,
        index: usize,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send;
}

/// A step receiving the full ordered item collection in one call.
pub trait BatchStep: Send + Sync {
    fn schema(&self) -> StepSchema {
        StepSchema::default()
    }

    fn run_batch(
        &self,
        ctx: &StepContext,
        params: &Value,
        input: &BatchInput,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send;
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send + 'a>>;

/// Object-safe version of [`SingleStep`] with boxed futures.
pub trait SingleStepDyn: Send + Sync {
    fn schema(&self) -> StepSchema;

    fn run_boxed<'a>(&'a self, ctx: &'a StepContext, params: &'a Value) -> StepFuture<'a>;
}

impl<T: SingleStep> SingleStepDyn for T {
    fn schema(&self) -> StepSchema {
        SingleStep::schema(self)
    }

    fn run_boxed<'a>(&'a self, ctx: &'a StepContext, params: &'a Value) -> StepFuture<'a> {
        Box::pin(self.run(ctx, params))
    }
}

/// Object-safe version of [`ItemStep`] with boxed futures.
pub trait ItemStepDyn: Send + Sync {
    fn schema(&self) -> StepSchema;

    fn parallelism(&self) -> usize;

    fn run_item_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        item: &'a Item,
        index: usize,
    ) -> StepFuture<'a>;
}

impl<T: ItemStep> ItemStepDyn for T {
    fn schema(&self) -> StepSchema {
        ItemStep::schema(self)
    }

    fn parallelism(&self) -> usize {
        ItemStep::parallelism(self)
    }

    fn run_item_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        item: &'a Item,
        index: usize,
    ) -> StepFuture<'a> {
        Box::pin(self.run_item(ctx, params, item, index))
    }
}

/// Object-safe version of [`BatchStep`] with boxed futures.
pub trait BatchStepDyn: Send + Sync {
    fn schema(&self) -> StepSchema;

    fn run_batch_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        input: &'a BatchInput,
    ) -> StepFuture<'a>;
}

impl<T: BatchStep> BatchStepDyn for T {
    fn schema(&self) -> StepSchema {
        BatchStep::schema(self)
    }

    fn run_batch_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: &'a Value,
        input: &'a BatchInput,
    ) -> StepFuture<'a> {
        Box::pin(self.run_batch(ctx, params, input))
    }
}

/// A registered step: one capability tag plus one call signature per variant.
#[derive(Clone)]
pub enum StepHandler {
    Single(Arc<dyn SingleStepDyn>),
    Items(Arc<dyn ItemStepDyn>),
    All(Arc<dyn BatchStepDyn>),
}

impl StepHandler {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            StepHandler::Single(_) => ExecutionMode::Single,
            StepHandler::Items(_) => ExecutionMode::Items,
            StepHandler::All(_) => ExecutionMode::All,
        }
    }

    pub fn schema(&self) -> StepSchema {
        match self {
            StepHandler::Single(s) => s.schema(),
            StepHandler::Items(s) => s.schema(),
            StepHandler::All(s) => s.schema(),
        }
    }
}

impl std::fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StepHandler").field(&self.mode()).finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Catalog of step types, keyed by the name used in `NodeKind::Step`.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, StepHandler>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_single<S: SingleStep + 'static>(&mut self, name: impl Into<String>, step: S) -> &mut Self {
        self.handlers.insert(name.into(), StepHandler::Single(Arc::new(step)));
        self
    }

    pub fn register_items<S: ItemStep + 'static>(&mut self, name: impl Into<String>, step: S) -> &mut Self {
        self.handlers.insert(name.into(), StepHandler::Items(Arc::new(step)));
        self
    }

    pub fn register_batch<S: BatchStep + 'static>(&mut self, name: impl Into<String>, step: S) -> &mut Self {
        self.handlers.insert(name.into(), StepHandler::All(Arc::new(step)));
        self
    }

    pub fn get(&self, name: &str) -> Option<&StepHandler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}
