//! Path segments and resolution against nested JSON values
//!
//! A path is a sequence of mapping keys and sequence indices. Resolution never
//! fails loudly: any miss along the way yields `None`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// Either a bare segment between dots, or a bracketed index: `a.b[0].c`
static SEGMENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[(\d+)\]|([^.\[\]]+)").unwrap()
});

/// One step of a path from the root of a tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "[{}]", i),
            PathSegment::Key(k) => write!(f, "{}", k),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

/// Parse a dotted path such as `"users.0.name"` or `"users[0].name"`.
///
/// All-digit segments become indices. Empty segments are dropped, so `""`
/// parses to the empty path (the node itself).
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    SEGMENT_REGEX
        .captures_iter(path)
        .filter_map(|caps| {
            if let Some(idx) = caps.get(1) {
                return idx.as_str().parse().ok().map(PathSegment::Index);
            }
            let seg = caps.get(2)?.as_str();
            if seg.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(i) = seg.parse() {
                    return Some(PathSegment::Index(i));
                }
            }
            Some(PathSegment::Key(seg.to_string()))
        })
        .collect()
}

/// Render a path for diagnostics, e.g. `users[1].name`
pub fn display_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for seg in path {
        match seg {
            PathSegment::Index(_) => out.push_str(&seg.to_string()),
            PathSegment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
        }
    }
    out
}

/// Resolve `path` against `value`, returning `None` on any miss.
///
/// Index segments applied to a mapping look up the stringified index, so
/// `{"1": x}` resolves under `[1]`. Strings are never indexed.
pub fn resolve_path<'a>(value: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    let mut current = value;
    for seg in path {
        current = match (current, seg) {
            (Value::Object(map), PathSegment::Key(k)) => map.get(k)?,
            (Value::Object(map), PathSegment::Index(i)) => map.get(&i.to_string())?,
            (Value::Array(arr), PathSegment::Index(i)) => arr.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}
