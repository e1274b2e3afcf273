//! Save conditions: predicates the backend checks against its stored copy
//! before it applies a mutation.
//!
//! A condition travels with the outbox entry and the mutate request. When it
//! does not hold, the backend refuses the write with a conditional-check
//! failure and the engine discards the mutation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator for a field condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(symbol)
    }
}

/// A predicate over a record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MutationCondition {
    /// Compare one top-level field against a literal.
    Field {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// The field is present and not null.
    Exists { field: String },
    And { conditions: Vec<MutationCondition> },
    Or { conditions: Vec<MutationCondition> },
    Not { condition: Box<MutationCondition> },
}

impl MutationCondition {
    pub fn field(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        MutationCondition::Field {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(field, CompareOp::Eq, value)
    }

    pub fn exists(field: impl Into<String>) -> Self {
        MutationCondition::Exists {
            field: field.into(),
        }
    }

    pub fn and(self, other: MutationCondition) -> Self {
        match self {
            MutationCondition::And { mut conditions } => {
                conditions.push(other);
                MutationCondition::And { conditions }
            }
            first => MutationCondition::And {
                conditions: vec![first, other],
            },
        }
    }

    pub fn or(self, other: MutationCondition) -> Self {
        match self {
            MutationCondition::Or { mut conditions } => {
                conditions.push(other);
                MutationCondition::Or { conditions }
            }
            first => MutationCondition::Or {
                conditions: vec![first, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        MutationCondition::Not {
            condition: Box::new(self),
        }
    }

    /// Evaluate against a payload. Absent fields read as null.
    ///
    /// Ordering operators hold only between two numbers or two strings; any
    /// other pairing is false.
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            MutationCondition::Field { field, op, value } => {
                let actual = payload.get(field).unwrap_or(&Value::Null);
                compare(actual, *op, value)
            }
            MutationCondition::Exists { field } => {
                payload.get(field).is_some_and(|v| !v.is_null())
            }
            MutationCondition::And { conditions } => conditions.iter().all(|c| c.matches(payload)),
            MutationCondition::Or { conditions } => conditions.iter().any(|c| c.matches(payload)),
            MutationCondition::Not { condition } => !condition.matches(payload),
        }
    }
}

impl fmt::Display for MutationCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, conditions: &[MutationCondition], sep: &str| {
            f.write_str("(")?;
            for (i, c) in conditions.iter().enumerate() {
                if i > 0 {
                    write!(f, " {sep} ")?;
                }
                write!(f, "{c}")?;
            }
            f.write_str(")")
        };
        match self {
            MutationCondition::Field { field, op, value } => write!(f, "{field} {op} {value}"),
            MutationCondition::Exists { field } => write!(f, "exists({field})"),
            MutationCondition::And { conditions } => join(f, conditions, "and"),
            MutationCondition::Or { conditions } => join(f, conditions, "or"),
            MutationCondition::Not { condition } => write!(f, "not {condition}"),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => equal(actual, expected),
        CompareOp::Ne => !equal(actual, expected),
        CompareOp::Lt => ordering(actual, expected) == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        CompareOp::Ge => {
            matches!(ordering(actual, expected), Some(Ordering::Greater | Ordering::Equal))
        }
    }
}

// 1 and 1.0 are the same number.
fn equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
