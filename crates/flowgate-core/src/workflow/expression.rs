//! `${...}` reference resolution and structured condition evaluation.
//!
//! Templates are arbitrary JSON values; every string inside them may contain
//! placeholders. A string consisting of exactly one placeholder resolves to
//! the referenced value with its JSON type intact; placeholders embedded in a
//! longer string are interpolated as text.
//!
//! Supported references:
//! - `<node>.data[.path]` -- payload of the node's first output item
//! - `<node>.items[.N[.path]]` -- payloads of all the node's output items
//! - `<node>.status` / `<node>.error`
//! - `$item[.path]`, `$index` -- the currently iterated item
//! - `$vars.<name>[.path]`, `$run.id`
//!
//! Paths accept both `a.b.2.c` and `a.b[2].c`.

use flowgate_types::condition::{Condition, Predicate};
use flowgate_types::item::{Item, StepResult, StepStatus};
use serde_json::{Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while resolving a template.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    #[error("unresolvable reference '{path}'")]
    Missing { path: String },

    #[error("invalid reference '{0}'")]
    InvalidReference(String),

    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),
}

// ---------------------------------------------------------------------------
// Reference source
// ---------------------------------------------------------------------------

/// Read access to everything a template may reference.
///
/// Implemented by scope views of the execution context; kept as a trait so
/// resolution stays independent of how results are stored.
pub trait ReferenceSource {
    /// Latest result of `node_id`, searching enclosing scopes innermost first.
    fn step_result(&self, node_id: &str) -> Option<&StepResult>;

    /// The item bound to `$item`, if any.
    fn current_item(&self) -> Option<&Item>;

    /// The index bound to `$index`, if any.
    fn current_index(&self) -> Option<usize>;

    /// A run variable (`$vars.<name>`).
    fn variable(&self, name: &str) -> Option<&Value>;

    fn run_id(&self) -> Uuid;
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve every placeholder inside `template`.
pub fn resolve(template: &Value, source: &impl ReferenceSource) -> Result<Value, ResolutionError> {
    match template {
        Value::String(s) => resolve_string(s, source),
        Value::Array(values) => values
            .iter()
            .map(|v| resolve(v, source))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve(value, source)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, source: &impl ReferenceSource) -> Result<Value, ResolutionError> {
    let Some(first) = s.find("${") else {
        return Ok(Value::String(s.to_string()));
    };

    // Whole-string placeholder keeps the referenced type.
    if first == 0 && s.ends_with('}') && s[2..].find('}') == Some(s.len() - 3) {
        return resolve_reference(s[2..s.len() - 1].trim(), source);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ResolutionError::Unterminated(s.to_string()));
        };
        let value = resolve_reference(after[..end].trim(), source)?;
        out.push_str(&value_to_string(&value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Resolve a single reference expression (the text between `${` and `}`).
pub fn resolve_reference(reference: &str, source: &impl ReferenceSource) -> Result<Value, ResolutionError> {
    let missing = || ResolutionError::Missing {
        path: reference.to_string(),
    };

    if reference.is_empty() {
        return Err(ResolutionError::InvalidReference(reference.to_string()));
    }

    let (root, rest) = match reference.split_once('.') {
        Some((root, rest)) => (root, rest),
        None => (reference, ""),
    };

    match root {
        "$item" => {
            let item = source.current_item().ok_or_else(missing)?;
            lookup_path(item.json(), rest).cloned().ok_or_else(missing)
        }
        "$index" if rest.is_empty() => source.current_index().map(|i| json!(i)).ok_or_else(missing),
        "$vars" => {
            let (name, path) = rest.split_once('.').unwrap_or((rest, ""));
            let value = source.variable(name).ok_or_else(missing)?;
            lookup_path(value, path).cloned().ok_or_else(missing)
        }
        "$run" if rest == "id" => Ok(json!(source.run_id().to_string())),
        r if r.starts_with('$') => Err(ResolutionError::InvalidReference(reference.to_string())),
        node_id => {
            let result = source.step_result(node_id).ok_or_else(missing)?;
            let (field, path) = rest.split_once('.').unwrap_or((rest, ""));
            let base = match field {
                "data" => {
                    let item = result.outputs().iter().flatten().next().ok_or_else(missing)?;
                    item.json().clone()
                }
                "items" => Value::Array(
                    result
                        .outputs()
                        .iter()
                        .flatten()
                        .map(|item| item.json().clone())
                        .collect(),
                ),
                "status" if path.is_empty() => return Ok(json!(status_str(result.status()))),
                "error" => match result.error() {
                    Some(err) => json!({"kind": err.kind, "message": err.message}),
                    None => return Err(missing()),
                },
                _ => return Err(ResolutionError::InvalidReference(reference.to_string())),
            };
            lookup_path(&base, path).cloned().ok_or_else(missing)
        }
    }
}

fn status_str(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Success => "success",
        StepStatus::Partial => "partial",
        StepStatus::Error => "error",
    }
}

/// Walk a dotted path (`a.b[2].c` or `a.b.2.c`) into a JSON value.
///
/// An empty path returns the value itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(values) => values.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        let mut indexes = indexes;
        while let Some(stripped) = indexes.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index = stripped[..close].trim().parse::<usize>().ok()?;
            current = current.as_array()?.get(index)?;
            indexes = &stripped[close + 1..];
        }
        if !indexes.is_empty() {
            return None;
        }
    }
    Some(current)
}

/// Render a resolved value for string interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Evaluate a condition tree against a parameter snapshot.
///
/// Pure and deterministic: missing fields never raise, they simply fail
/// `equals`/`$in` and satisfy `$ne`.
pub fn evaluate_condition(condition: &Condition, snapshot: &Value) -> bool {
    match condition {
        Condition::And(children) => children.iter().all(|c| evaluate_condition(c, snapshot)),
        Condition::Or(children) => children.iter().any(|c| evaluate_condition(c, snapshot)),
        Condition::Field { path, predicate } => {
            let actual = lookup_path(snapshot, path);
            match predicate {
                Predicate::Equals(expected) => actual == Some(expected),
                Predicate::NotEquals(expected) => actual != Some(expected),
                Predicate::In(candidates) => actual.is_some_and(|a| candidates.contains(a)),
                Predicate::Exists(expected) => actual.is_some() == *expected,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_types::error::{ErrorKind, NodeError};
    use flowgate_types::item::StepTiming;
    use std::collections::HashMap;

    struct Fixture {
        results: HashMap<String, StepResult>,
        item: Option<Item>,
        index: Option<usize>,
        vars: HashMap<String, Value>,
        run_id: Uuid,
    }

    impl ReferenceSource for Fixture {
        fn step_result(&self, node_id: &str) -> Option<&StepResult> {
            self.results.get(node_id)
        }
        fn current_item(&self) -> Option<&Item> {
            self.item.as_ref()
        }
        fn current_index(&self) -> Option<usize> {
            self.index
        }
        fn variable(&self, name: &str) -> Option<&Value> {
            self.vars.get(name)
        }
        fn run_id(&self) -> Uuid {
            self.run_id
        }
    }

    fn fixture() -> Fixture {
        let mut results = HashMap::new();
        results.insert(
            "fetch".to_string(),
            StepResult::success(
                "fetch",
                vec![vec![
                    Item::new(json!({"id": 1, "tags": ["a", "b"], "n": 42})),
                    Item::new(json!({"id": 2, "tags": [], "n": 7})),
                ]],
                StepTiming::instant(),
            ),
        );
        results.insert(
            "broken".to_string(),
            StepResult::failed(
                NodeError::new("broken", ErrorKind::StepRuntime, "boom"),
                StepTiming::instant(),
            ),
        );
        let mut vars = HashMap::new();
        vars.insert("env".to_string(), json!({"region": "eu"}));
        Fixture {
            results,
            item: Some(Item::new(json!({"user": {"name": "ada"}}))),
            index: Some(3),
            vars,
            run_id: Uuid::nil(),
        }
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let fx = fixture();
        assert_eq!(resolve(&json!("${fetch.data.n}"), &fx).unwrap(), json!(42));
        assert_eq!(resolve(&json!("${fetch.data.tags}"), &fx).unwrap(), json!(["a", "b"]));
        assert_eq!(resolve(&json!("${$index}"), &fx).unwrap(), json!(3));
    }

    #[test]
    fn test_embedded_placeholders_interpolate() {
        let fx = fixture();
        let value = resolve(&json!("hi ${$item.user.name} #${$index} in ${$vars.env.region}"), &fx).unwrap();
        assert_eq!(value, json!("hi ada #3 in eu"));
    }

    #[test]
    fn test_items_and_indexing() {
        let fx = fixture();
        assert_eq!(resolve(&json!("${fetch.items.1.id}"), &fx).unwrap(), json!(2));
        assert_eq!(resolve(&json!("${fetch.items[0].tags[1]}"), &fx).unwrap(), json!("b"));
        let all = resolve(&json!("${fetch.items}"), &fx).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_nested_templates_resolve_recursively() {
        let fx = fixture();
        let value = resolve(
            &json!({"url": "/users/${fetch.data.id}", "list": ["${$index}", 5], "flag": true}),
            &fx,
        )
        .unwrap();
        assert_eq!(value, json!({"url": "/users/1", "list": [3, 5], "flag": true}));
    }

    #[test]
    fn test_status_and_error_references() {
        let fx = fixture();
        assert_eq!(resolve(&json!("${broken.status}"), &fx).unwrap(), json!("error"));
        assert_eq!(
            resolve(&json!("${broken.error.kind}"), &fx).unwrap(),
            json!("step_runtime")
        );
        assert_eq!(resolve(&json!("${$run.id}"), &fx).unwrap(), json!(Uuid::nil().to_string()));
    }

    #[test]
    fn test_missing_reference_names_path() {
        let fx = fixture();
        let err = resolve(&json!({"x": "${ghost.data.id}"}), &fx).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::Missing {
                path: "ghost.data.id".to_string()
            }
        );
        assert!(err.to_string().contains("ghost.data.id"));

        let err = resolve(&json!("${broken.data}"), &fx).unwrap_err();
        assert!(matches!(err, ResolutionError::Missing { .. }));

        let err = resolve(&json!("${fetch.bogus}"), &fx).unwrap_err();
        assert!(matches!(err, ResolutionError::InvalidReference(_)));

        let err = resolve(&json!("a ${fetch.data"), &fx).unwrap_err();
        assert!(matches!(err, ResolutionError::Unterminated(_)));
    }

    #[test]
    fn test_condition_and_of_equalities() {
        let cond = Condition::parse(&json!({"$and": [{"op": "create"}, {"adv": true}]})).unwrap();
        assert!(evaluate_condition(&cond, &json!({"op": "create", "adv": true})));
        assert!(!evaluate_condition(&cond, &json!({"op": "create", "adv": false})));
    }

    #[test]
    fn test_condition_predicates() {
        let snapshot = json!({"status": "open", "owner": null, "meta": {"tier": 2}});
        let check = |c: Value| evaluate_condition(&Condition::parse(&c).unwrap(), &snapshot);

        assert!(check(json!({"status": {"$in": ["open", "pending"]}})));
        assert!(!check(json!({"status": {"$in": ["closed"]}})));
        assert!(check(json!({"status": {"$ne": "closed"}})));
        assert!(check(json!({"missing": {"$ne": "x"}})));
        assert!(check(json!({"owner": {"$exists": true}})));
        assert!(check(json!({"missing": {"$exists": false}})));
        assert!(check(json!({"meta.tier": 2})));
        assert!(check(json!({"$or": [{"status": "closed"}, {"meta.tier": 2}]})));
        assert!(!check(json!({"$or": []})));
        assert!(check(json!({"$and": []})));
    }

    #[test]
    fn test_lookup_path_forms() {
        let value = json!({"a": {"b": [10, {"c": "x"}]}});
        assert_eq!(lookup_path(&value, ""), Some(&value));
        assert_eq!(lookup_path(&value, "a.b.0"), Some(&json!(10)));
        assert_eq!(lookup_path(&value, "a.b[1].c"), Some(&json!("x")));
        assert_eq!(lookup_path(&value, "a.b[5]"), None);
        assert_eq!(lookup_path(&value, "a.b[x]"), None);
    }
}
