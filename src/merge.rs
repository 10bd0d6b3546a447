//! Merge policies for repeated writes to the same field of the same key
//!
//! A policy sees the value previously accumulated for a field (if any) and the
//! newly computed value, and decides what is kept. Policies run on every
//! update to an already-seen key, not only at finalization.

use serde::Deserialize;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A policy could not combine the two operands
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{policy} cannot merge {previous} with {new}{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
pub struct PolicyError {
    pub policy: String,
    pub previous: Value,
    pub new: Value,
    /// Message returned by a custom policy
    pub reason: Option<String>,
}

/// User-supplied merge function
pub type MergeFn = Arc<dyn Fn(Option<&Value>, Value) -> Result<Value, String> + Send + Sync>;

/// How a field's previous and new values are combined
#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Numeric accumulation
    Sum,
    /// Collect every new value into a list
    Append,
    /// Concatenate new lists onto the accumulated list
    Extend,
    Min,
    Max,
    /// Keep the first non-null value ever seen
    FirstNonNull,
    #[serde(skip)]
    Custom(String, MergeFn),
}

impl MergePolicy {
    /// Wrap a closure as a named policy
    pub fn custom<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>, Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        MergePolicy::Custom(name.into(), Arc::new(f))
    }

    pub fn name(&self) -> &str {
        match self {
            MergePolicy::Sum => "sum",
            MergePolicy::Append => "append",
            MergePolicy::Extend => "extend",
            MergePolicy::Min => "min",
            MergePolicy::Max => "max",
            MergePolicy::FirstNonNull => "first_non_null",
            MergePolicy::Custom(name, _) => name,
        }
    }

    /// Resolve `previous` (absent on first write) and `new` into the kept value
    pub fn merge(&self, previous: Option<&Value>, new: Value) -> Result<Value, PolicyError> {
        let prev = previous.filter(|v| !v.is_null());
        match self {
            MergePolicy::Sum => match prev {
                None => Ok(new),
                Some(p) if new.is_null() => Ok(p.clone()),
                Some(p) => add_numbers(p, &new).ok_or_else(|| self.error(previous, new)),
            },
            MergePolicy::Append => match prev {
                None => Ok(Value::Array(vec![new])),
                Some(Value::Array(items)) => {
                    let mut items = items.clone();
                    items.push(new);
                    Ok(Value::Array(items))
                }
                Some(_) => Err(self.error(previous, new)),
            },
            MergePolicy::Extend => {
                let mut items = match previous {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items.clone(),
                    Some(_) => return Err(self.error(previous, new)),
                };
                match new {
                    Value::Array(more) => items.extend(more),
                    Value::Null => {}
                    scalar => items.push(scalar),
                }
                Ok(Value::Array(items))
            }
            MergePolicy::Min | MergePolicy::Max => match prev {
                None => Ok(new),
                Some(p) if new.is_null() => Ok(p.clone()),
                Some(p) => {
                    let ord = compare(p, &new).ok_or_else(|| self.error(previous, new.clone()))?;
                    let keep_new = match self {
                        MergePolicy::Min => ord == Ordering::Greater,
                        _ => ord == Ordering::Less,
                    };
                    Ok(if keep_new { new } else { p.clone() })
                }
            },
            MergePolicy::FirstNonNull => Ok(prev.cloned().unwrap_or(new)),
            MergePolicy::Custom(name, f) => f(previous, new.clone()).map_err(|reason| PolicyError {
                policy: name.clone(),
                previous: previous.cloned().unwrap_or(Value::Null),
                new,
                reason: Some(reason),
            }),
        }
    }

    fn error(&self, previous: Option<&Value>, new: Value) -> PolicyError {
        PolicyError {
            policy: self.name().to_string(),
            previous: previous.cloned().unwrap_or(Value::Null),
            new,
            reason: None,
        }
    }
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MergePolicy({})", self.name())
    }
}

fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    let (Value::Number(a), Value::Number(b)) = (a, b) else {
        return None;
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Value::from(sum));
        }
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(Value::from(sum));
        }
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?).map(Value::Number)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold(policy: &MergePolicy, values: Vec<Value>) -> Value {
        let mut acc: Option<Value> = None;
        for v in values {
            acc = Some(policy.merge(acc.as_ref(), v).unwrap());
        }
        acc.unwrap_or(Value::Null)
    }

    #[test]
    fn test_sum() {
        assert_eq!(fold(&MergePolicy::Sum, vec![json!(1), json!(1), json!(1)]), json!(3));
        assert_eq!(fold(&MergePolicy::Sum, vec![json!(1), json!(0.5)]), json!(1.5));
        assert_eq!(fold(&MergePolicy::Sum, vec![json!(2), Value::Null]), json!(2));
        let err = MergePolicy::Sum.merge(Some(&json!(1)), json!("x")).unwrap_err();
        assert_eq!(err.reason, None);
        assert_eq!(err.to_string(), r#"sum cannot merge 1 with "x""#);
    }

    #[test]
    fn test_first_non_null() {
        let got = fold(&MergePolicy::FirstNonNull, vec![Value::Null, json!("a"), json!("b")]);
        assert_eq!(got, json!("a"));
    }

    #[test]
    fn test_append_and_extend() {
        assert_eq!(fold(&MergePolicy::Append, vec![json!(1), json!([2])]), json!([1, [2]]));
        assert_eq!(fold(&MergePolicy::Extend, vec![json!([1]), json!([2, 3]), json!(4)]), json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_min_max() {
        let values = vec![json!(5), json!(2), Value::Null, json!(9)];
        assert_eq!(fold(&MergePolicy::Min, values.clone()), json!(2));
        assert_eq!(fold(&MergePolicy::Max, values), json!(9));
        assert_eq!(fold(&MergePolicy::Min, vec![json!("b"), json!("a")]), json!("a"));
        assert!(MergePolicy::Max.merge(Some(&json!(1)), json!("a")).is_err());
    }

    #[test]
    fn test_custom_and_deserialize() {
        let longest = MergePolicy::custom("longest", |prev, new| {
            let prev_len = prev.and_then(Value::as_str).map_or(0, str::len);
            let new_len = new.as_str().ok_or("not a string")?.len();
            Ok(if new_len > prev_len { new } else { prev.cloned().unwrap_or(Value::Null) })
        });
        assert_eq!(fold(&longest, vec![json!("ab"), json!("abc"), json!("x")]), json!("abc"));
        let err = longest.merge(None, json!(1)).unwrap_err();
        assert_eq!(err.policy, "longest");
        assert_eq!(err.reason.as_deref(), Some("not a string"));
        assert_eq!(err.to_string(), "longest cannot merge null with 1: not a string");

        let parsed: MergePolicy = serde_json::from_value(json!("first_non_null")).unwrap();
        assert_eq!(parsed.name(), "first_non_null");
    }
}
