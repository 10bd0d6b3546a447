//! Transform library: pure functions from a traversal context to a value
//!
//! Every primitive is a plain function returning a boxed closure, so transforms
//! compose by ordinary function application:
//!
//! ```rust
//! use ingot::transform::{coalesce, concat, get, get_from_parent, literal};
//!
//! let label = concat(vec![get_from_parent("name", 1), literal("/"), get("title")]);
//! let name = coalesce(vec![get("display_name"), get("login")]);
//! ```

use crate::context::Context;
use crate::path::{parse_path, resolve_path, PathSegment};
use serde_json::Value;
use std::sync::Arc;

/// A computed value for one context. Absent values are `Value::Null`.
pub type Transform = Arc<dyn Fn(&Context<'_>) -> Value + Send + Sync>;

/// Anything that can be turned into a path: dotted strings or explicit segments
pub trait IntoPath {
    fn into_path(self) -> Vec<PathSegment>;
}

impl IntoPath for &str {
    fn into_path(self) -> Vec<PathSegment> {
        parse_path(self)
    }
}

impl IntoPath for String {
    fn into_path(self) -> Vec<PathSegment> {
        parse_path(&self)
    }
}

impl IntoPath for Vec<PathSegment> {
    fn into_path(self) -> Vec<PathSegment> {
        self
    }
}

impl IntoPath for &[PathSegment] {
    fn into_path(self) -> Vec<PathSegment> {
        self.to_vec()
    }
}

/// Lift any closure into a transform
pub fn transform<F>(f: F) -> Transform
where
    F: Fn(&Context<'_>) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The current node itself
pub fn node() -> Transform {
    transform(|ctx| ctx.node.clone())
}

pub fn literal(value: impl Into<Value>) -> Transform {
    let value = value.into();
    transform(move |_| value.clone())
}

/// The mapping key of the current context
pub fn key() -> Transform {
    transform(|ctx| ctx.key.clone().map(Value::String).unwrap_or(Value::Null))
}

/// The sequence index of the current context
pub fn index() -> Transform {
    transform(|ctx| ctx.index.map(Value::from).unwrap_or(Value::Null))
}

/// Resolve `path` relative to the current node
pub fn get(path: impl IntoPath) -> Transform {
    let segments = path.into_path();
    transform(move |ctx| resolve_path(ctx.node, &segments).cloned().unwrap_or(Value::Null))
}

/// Resolve `path` from the root of the tree
pub fn get_from_root(path: impl IntoPath) -> Transform {
    let segments = path.into_path();
    transform(move |ctx| resolve_path(ctx.root, &segments).cloned().unwrap_or(Value::Null))
}

/// Resolve `path` relative to the ancestor `depth` levels up (1 = parent)
pub fn get_from_parent(path: impl IntoPath, depth: usize) -> Transform {
    let segments = path.into_path();
    transform(move |ctx| {
        ctx.ancestor(depth)
            .filter(|_| depth > 0)
            .and_then(|p| resolve_path(p.node, &segments))
            .cloned()
            .unwrap_or(Value::Null)
    })
}

/// The mapping key of the ancestor `depth` levels up
pub fn parent_key(depth: usize) -> Transform {
    transform(move |ctx| {
        ctx.ancestor(depth)
            .filter(|_| depth > 0)
            .and_then(|p| p.key.clone())
            .map(Value::String)
            .unwrap_or(Value::Null)
    })
}

/// The sequence index of the ancestor `depth` levels up
pub fn parent_index(depth: usize) -> Transform {
    transform(move |ctx| {
        ctx.ancestor(depth)
            .filter(|_| depth > 0)
            .and_then(|p| p.index)
            .map(Value::from)
            .unwrap_or(Value::Null)
    })
}

/// Length of a sequence, mapping or string (in characters); null otherwise
pub fn len_of(inner: Transform) -> Transform {
    transform(move |ctx| match inner(ctx) {
        Value::Array(a) => Value::from(a.len()),
        Value::Object(o) => Value::from(o.len()),
        Value::String(s) => Value::from(s.chars().count()),
        _ => Value::Null,
    })
}

/// Concatenate the text of every part; null parts contribute nothing
pub fn concat(parts: Vec<Transform>) -> Transform {
    transform(move |ctx| {
        let text: String = parts.iter().map(|p| value_text(&p(ctx))).collect();
        Value::String(text)
    })
}

/// Join the non-null, non-empty parts with `sep`
pub fn format_id(parts: Vec<Transform>, sep: impl Into<String>) -> Transform {
    let sep = sep.into();
    transform(move |ctx| {
        let pieces: Vec<String> = parts
            .iter()
            .map(|p| value_text(&p(ctx)))
            .filter(|s| !s.is_empty())
            .collect();
        Value::String(pieces.join(&sep))
    })
}

/// The first non-null result
pub fn coalesce(inners: Vec<Transform>) -> Transform {
    transform(move |ctx| {
        inners
            .iter()
            .map(|t| t(ctx))
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null)
    })
}

/// A value from the traversal's slot bag
pub fn slot(name: impl Into<String>) -> Transform {
    let name = name.into();
    transform(move |ctx| ctx.slot(&name).cloned().unwrap_or(Value::Null))
}

/// Plain text of a value: strings unquoted, null empty, the rest as JSON
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
