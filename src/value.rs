//! Field Values
//!
//! Collected inputs and condition literals share one small tagged type.
//! Serialized untagged, so records hold plain JSON scalars.
//!
//! Coercion rules:
//! - Two values are numeric when each is a finite number or text that
//!   parses as one. Numeric pairs compare numerically.
//! - Booleans compare with booleans or with the text `true` / `false`.
//! - Everything else compares by exact, case-sensitive rendered text.
//! - `Null` equals only `Null`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Field name -> value. Ordered so serialized records are stable.
pub type Inputs = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric reading of the value, if it has one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) if s == "true" => Some(true),
            FieldValue::Text(s) if s == "false" => Some(false),
            _ => None,
        }
    }

    /// Null or empty text. Whitespace counts as a value.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Equality under the coercion rules above.
    pub fn loosely_equals(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Null, _) | (_, FieldValue::Null) => false,
            _ => {
                if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
                    return a == b;
                }
                if matches!(self, FieldValue::Bool(_)) || matches!(other, FieldValue::Bool(_)) {
                    if let (Some(a), Some(b)) = (self.as_bool(), other.as_bool()) {
                        return a == b;
                    }
                }
                self.to_string() == other.to_string()
            }
        }
    }

    /// Numeric ordering; `None` when either side is not numeric.
    pub fn numeric_cmp(&self, other: &FieldValue) -> Option<Ordering> {
        let a = self.as_number()?;
        let b = other.as_number()?;
        a.partial_cmp(&b)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<serde_json::Value> for FieldValue {
    /// Arrays and objects have no scalar reading; they are kept as their
    /// JSON text.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(FieldValue::Number)
                .unwrap_or_else(|| FieldValue::Text(n.to_string())),
            serde_json::Value::String(s) => FieldValue::Text(s),
            other => FieldValue::Text(other.to_string()),
        }
    }
}
