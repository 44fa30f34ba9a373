//! Per-run execution context: an arena of step results keyed by scope and node.
//!
//! The scheduler is the only writer. Every running node receives a cheap
//! snapshot (`Arc<ExecutionContext>`) plus the id of the scope it runs in, and
//! reads through a [`ScopeRef`]. Writes replace one node's result at one key,
//! so readers never observe a half-written result.
//!
//! Scopes form a chain: loop iterations push a child scope holding `$item`,
//! `$index` and the results of the body nodes; lookups walk the chain from the
//! innermost scope outwards. Child scopes are popped when the iteration ends
//! and their results are discarded unless explicitly exported.

use std::collections::BTreeMap;
use std::sync::Arc;

use flowgate_types::item::{Item, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::expression::ReferenceSource;

/// Index of a scope inside the arena.
pub type ScopeId = usize;

/// The run-level scope; always present.
pub const ROOT_SCOPE: ScopeId = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Scope {
    /// `None` for the root scope, `"<loop>#<index>"` for iterations.
    label: Option<String>,
    parent: Option<ScopeId>,
    item: Option<Item>,
    index: Option<usize>,
    results: BTreeMap<String, Arc<StepResult>>,
}

/// Mutable state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    run_id: Uuid,
    /// Run variables, readable as `$vars.<name>`.
    variables: BTreeMap<String, Value>,
    scopes: Vec<Scope>,
}

impl ExecutionContext {
    /// Create a context holding only the root scope.
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            variables: BTreeMap::new(),
            scopes: vec![Scope {
                label: None,
                parent: None,
                item: None,
                index: None,
                results: BTreeMap::new(),
            }],
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Open a child scope of `parent` bound to an iteration item.
    pub fn push_scope(&mut self, parent: ScopeId, label: impl Into<String>, item: Item, index: usize) -> ScopeId {
        self.scopes.push(Scope {
            label: Some(label.into()),
            parent: Some(parent),
            item: Some(item),
            index: Some(index),
            results: BTreeMap::new(),
        });
        self.scopes.len() - 1
    }

    /// Close the innermost scope, returning the results it held.
    ///
    /// Scopes are strictly nested, so only the most recently pushed scope may
    /// be popped; any other id (and the root) returns `None`.
    pub fn pop_scope(&mut self, scope: ScopeId) -> Option<BTreeMap<String, Arc<StepResult>>> {
        if scope == ROOT_SCOPE || scope + 1 != self.scopes.len() {
            return None;
        }
        self.scopes.pop().map(|s| s.results)
    }

    /// Label of a scope (`None` for the root).
    pub fn scope_label(&self, scope: ScopeId) -> Option<&str> {
        self.scopes.get(scope).and_then(|s| s.label.as_deref())
    }

    /// Number of open scopes, the root included.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Store a node's result in `scope`, replacing any earlier one.
    pub fn post(&mut self, scope: ScopeId, result: StepResult) -> Arc<StepResult> {
        let result = Arc::new(result);
        if let Some(s) = self.scopes.get_mut(scope) {
            s.results.insert(result.node_id().to_string(), Arc::clone(&result));
        }
        result
    }

    /// Copy already-shared results into `scope` (loop exports).
    pub fn import(&mut self, scope: ScopeId, results: impl IntoIterator<Item = Arc<StepResult>>) {
        if let Some(s) = self.scopes.get_mut(scope) {
            for result in results {
                s.results.insert(result.node_id().to_string(), result);
            }
        }
    }

    /// Latest result of `node_id`, searching from `scope` outwards.
    pub fn result(&self, scope: ScopeId, node_id: &str) -> Option<&Arc<StepResult>> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = self.scopes.get(id)?;
            if let Some(result) = s.results.get(node_id) {
                return Some(result);
            }
            current = s.parent;
        }
        None
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Read-only view of `scope` for template resolution.
    pub fn view(&self, scope: ScopeId) -> ScopeRef<'_> {
        ScopeRef {
            ctx: self,
            scope,
            item: None,
        }
    }
}

/// A scope handle used by running nodes: reads walk the scope chain, and the
/// iterated item can be rebound per call for `items`-mode resolution.
#[derive(Clone, Copy)]
pub struct ScopeRef<'a> {
    ctx: &'a ExecutionContext,
    scope: ScopeId,
    item: Option<(&'a Item, usize)>,
}

impl<'a> ScopeRef<'a> {
    /// Bind `$item` / `$index` for the duration of one resolution.
    pub fn with_item(self, item: &'a Item, index: usize) -> Self {
        Self {
            item: Some((item, index)),
            ..self
        }
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    fn scope_binding(&self) -> Option<&'a Scope> {
        let mut current = Some(self.scope);
        while let Some(id) = current {
            let s = self.ctx.scopes.get(id)?;
            if s.item.is_some() {
                return Some(s);
            }
            current = s.parent;
        }
        None
    }
}

impl ReferenceSource for ScopeRef<'_> {
    fn step_result(&self, node_id: &str) -> Option<&StepResult> {
        self.ctx.result(self.scope, node_id).map(|r| r.as_ref())
    }

    fn current_item(&self) -> Option<&Item> {
        match self.item {
            Some((item, _)) => Some(item),
            None => self.scope_binding().and_then(|s| s.item.as_ref()),
        }
    }

    fn current_index(&self) -> Option<usize> {
        match self.item {
            Some((_, index)) => Some(index),
            None => self.scope_binding().and_then(|s| s.index),
        }
    }

    fn variable(&self, name: &str) -> Option<&Value> {
        self.ctx.variable(name)
    }

    fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }
}
