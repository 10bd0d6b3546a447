//! Composite join keys

use crate::context::Context;
use crate::transform::Transform;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// The tuple of join-key transform outputs identifying one accumulated row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JoinKey(pub Vec<Value>);

impl JoinKey {
    pub fn new(parts: Vec<Value>) -> Self {
        JoinKey(parts)
    }

    /// Evaluate `transforms` against `ctx`.
    ///
    /// Returns `None` when any component is null or the empty string; such an
    /// emission is skipped entirely.
    pub fn compute(transforms: &[Transform], ctx: &Context<'_>) -> Option<Self> {
        let mut parts = Vec::with_capacity(transforms.len());
        for t in transforms {
            let part = t(ctx);
            if is_blank(&part) {
                return None;
            }
            parts.push(part);
        }
        Some(JoinKey(parts))
    }

    /// A single-component key
    pub fn of(part: impl Into<Value>) -> Self {
        JoinKey(vec![part.into()])
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// The lone component of a single-component key
    pub fn single(&self) -> Option<&Value> {
        match self.0.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

impl From<Value> for JoinKey {
    fn from(part: Value) -> Self {
        JoinKey(vec![part])
    }
}

impl fmt::Display for JoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl Hash for JoinKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for part in &self.0 {
            hash_value(part, state);
        }
    }
}

// Consistent with `Value`'s equality: objects compare regardless of entry
// order, so only their length feeds the hash.
fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
        }
    }
}

pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
