//! Lock-key normalisation.
//!
//! A keyed lock policy returns arbitrary JSON from its key function. Only a
//! string or an array of strings is a valid key set; anything else is a
//! programming error in the caller's policy and is rejected per task.

use serde_json::Value;

use crate::cluster::LockRequest;

/// Keys produced by a keyed lock policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockKeys {
    One(String),
    Many(Vec<String>),
}

impl LockKeys {
    /// Pair every key with the policy's `locking` flag, preserving order.
    pub fn into_requests(self, locking: bool) -> Vec<LockRequest> {
        match self {
            Self::One(key) => vec![LockRequest::new(key, locking)],
            Self::Many(keys) => keys
                .into_iter()
                .map(|key| LockRequest::new(key, locking))
                .collect(),
        }
    }
}

impl TryFrom<Value> for LockKeys {
    /// Short description of what was found instead.
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(key) => Ok(Self::One(key)),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(key) => Ok(key),
                    other => Err(format!("array containing {}", describe(&other))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Many),
            other => Err(describe(&other).to_string()),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
