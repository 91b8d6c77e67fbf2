// Runtime values for expression evaluation.
//
// Request tuples mix plain strings with structured attributes, so the value
// union carries a JSON arm for maps and records. Scalars pulled out of a JSON
// object are converted back to native arms so comparisons behave uniformly.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// All numbers are f64, integer literals included.
    Num(f64),
    Str(String),
    /// Maps and serialized records; property access digs into this arm.
    Json(serde_json::Value),
}

impl Value {
    /// Builds a value from any serializable record, e.g. a user struct with
    /// attribute fields. Scalar results collapse to native arms.
    pub fn record<T: Serialize>(value: &T) -> Result<Value, Error> {
        let json = serde_json::to_value(value)
            .map_err(|e| Error::Type(format!("unserializable record: {}", e)))?;
        Ok(Value::from(json))
    }

    pub fn as_bool(&self) -> Result<bool, Error> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(Error::Type(format!("expected bool, got {}", other))),
        }
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(Error::Type(format!("expected string, got {}", other))),
        }
    }

    pub fn as_num(&self) -> Result<f64, Error> {
        match self {
            Value::Num(n) => Ok(*n),
            other => Err(Error::Type(format!("expected number, got {}", other))),
        }
    }

    /// Resolves one property segment. Only the Json arm has properties.
    pub fn property(&self, name: &str) -> Result<Value, Error> {
        match self {
            Value::Json(serde_json::Value::Object(map)) => match map.get(name) {
                Some(v) => Ok(Value::from(v.clone())),
                None => Err(Error::Property(name.to_string())),
            },
            _ => Err(Error::Property(name.to_string())),
        }
    }

    /// Ordering is defined within the Num and Str arms only.
    pub fn compare(&self, other: &Value) -> Result<Ordering, Error> {
        match (self, other) {
            (Value::Num(a), Value::Num(b)) => a
                .partial_cmp(b)
                .ok_or_else(|| Error::Type("NaN is not ordered".to_string())),
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (a, b) => Err(Error::Type(format!("cannot order {} and {}", a, b))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Str(s) => write!(f, "'{}'", s),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s),
            other => Value::Json(other),
        }
    }
}
