//! Structured boolean conditions.
//!
//! Conditions are written as JSON documents in the workflow definition:
//!
//! ```json
//! { "$and": [ { "op": "create" }, { "adv": true } ] }
//! { "status": { "$in": ["open", "pending"] }, "owner": { "$exists": true } }
//! ```
//!
//! They are parsed once into a closed set of tagged variants; evaluation
//! lives in `flowgate-core` and never performs dynamic attribute lookup.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A recursive boolean condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Condition {
    /// All children must hold (empty = true).
    And(Vec<Condition>),
    /// At least one child must hold (empty = false).
    Or(Vec<Condition>),
    /// A predicate applied to a dotted field path of the snapshot.
    Field { path: String, predicate: Predicate },
}

/// Predicate applied to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(Value),
    NotEquals(Value),
    In(Vec<Value>),
    Exists(bool),
}

/// Errors raised while parsing a condition document.
#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("condition must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error("'{0}' expects an array of conditions")]
    ExpectedArray(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("'$exists' expects a boolean")]
    ExistsNotBool,
}

impl Condition {
    /// Convenience constructor for an equality predicate.
    pub fn equals(path: impl Into<String>, value: Value) -> Self {
        Condition::Field {
            path: path.into(),
            predicate: Predicate::Equals(value),
        }
    }

    /// Parse a condition from its JSON form.
    pub fn parse(value: &Value) -> Result<Self, ConditionError> {
        let Value::Object(map) = value else {
            return Err(ConditionError::NotAnObject(value.to_string()));
        };

        let mut parts = Vec::with_capacity(map.len());
        for (key, val) in map {
            match key.as_str() {
                "$and" | "$or" => {
                    let Value::Array(children) = val else {
                        return Err(ConditionError::ExpectedArray(key.clone()));
                    };
                    let children = children
                        .iter()
                        .map(Condition::parse)
                        .collect::<Result<Vec<_>, _>>()?;
                    parts.push(if key == "$and" {
                        Condition::And(children)
                    } else {
                        Condition::Or(children)
                    });
                }
                op if op.starts_with('$') => {
                    return Err(ConditionError::UnknownOperator(op.to_string()));
                }
                path => parts.push(Condition::Field {
                    path: path.to_string(),
                    predicate: parse_predicate(val)?,
                }),
            }
        }

        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(Condition::And(parts))
        }
    }

    /// Render the condition back into its JSON form.
    pub fn to_value(&self) -> Value {
        match self {
            Condition::And(children) => {
                serde_json::json!({ "$and": children.iter().map(Condition::to_value).collect::<Vec<_>>() })
            }
            Condition::Or(children) => {
                serde_json::json!({ "$or": children.iter().map(Condition::to_value).collect::<Vec<_>>() })
            }
            Condition::Field { path, predicate } => {
                let mut map = Map::new();
                let rendered = match predicate {
                    Predicate::Equals(v) => match v {
                        // Objects would be mistaken for operator maps; use `$eq`.
                        Value::Object(_) => serde_json::json!({ "$eq": v }),
                        other => other.clone(),
                    },
                    Predicate::NotEquals(v) => serde_json::json!({ "$ne": v }),
                    Predicate::In(vs) => serde_json::json!({ "$in": vs }),
                    Predicate::Exists(b) => serde_json::json!({ "$exists": b }),
                };
                map.insert(path.clone(), rendered);
                Value::Object(map)
            }
        }
    }
}

fn parse_predicate(value: &Value) -> Result<Predicate, ConditionError> {
    let Value::Object(map) = value else {
        return Ok(Predicate::Equals(value.clone()));
    };
    if map.len() != 1 {
        return Ok(Predicate::Equals(value.clone()));
    }
    let Some((op, arg)) = map.iter().next() else {
        return Ok(Predicate::Equals(value.clone()));
    };
    match op.as_str() {
        "$eq" => Ok(Predicate::Equals(arg.clone())),
        "$ne" => Ok(Predicate::NotEquals(arg.clone())),
        "$in" => match arg {
            Value::Array(values) => Ok(Predicate::In(values.clone())),
            _ => Err(ConditionError::ExpectedArray("$in".to_string())),
        },
        "$exists" => arg
            .as_bool()
            .map(Predicate::Exists)
            .ok_or(ConditionError::ExistsNotBool),
        other if other.starts_with('$') => Err(ConditionError::UnknownOperator(other.to_string())),
        _ => Ok(Predicate::Equals(value.clone())),
    }
}

impl TryFrom<Value> for Condition {
    type Error = ConditionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Condition::parse(&value)
    }
}

impl From<Condition> for Value {
    fn from(condition: Condition) -> Self {
        condition.to_value()
    }
}
