//! Traversal context: one visited node plus its ancestry

use crate::path::{display_path, PathSegment};
use indexmap::IndexMap;
use serde_json::Value;
use std::rc::Rc;

/// Read-only auxiliary values shared by every context of one traversal
pub type Slots = IndexMap<String, Value>;

pub(crate) static NULL: Value = Value::Null;

/// One node visited during a traversal.
///
/// Contexts borrow the root tree and link upward to their parent only. The
/// chain mirrors tree descent, so it cannot form a cycle.
#[derive(Debug, Clone)]
pub struct Context<'a> {
    /// The full input tree
    pub root: &'a Value,
    /// The node under iteration (`Null` when a path missed)
    pub node: &'a Value,
    /// Absolute path from the root to this node
    pub path: Vec<PathSegment>,
    pub parent: Option<Rc<Context<'a>>>,
    /// Stringified mapping key when produced by iterating a mapping
    pub key: Option<String>,
    /// Position when produced by iterating a sequence
    pub index: Option<usize>,
    pub slots: Option<&'a Slots>,
}

impl<'a> Context<'a> {
    /// A parentless context at `path`, used as the base of a traversal
    pub fn base(root: &'a Value, node: Option<&'a Value>, path: Vec<PathSegment>) -> Self {
        Context {
            root,
            node: node.unwrap_or(&NULL),
            path,
            parent: None,
            key: None,
            index: None,
            slots: None,
        }
    }

    /// Walk `depth` steps up the ancestor chain. `ancestor(0)` is `self`.
    pub fn ancestor(&self, depth: usize) -> Option<&Context<'a>> {
        let mut current = self;
        for _ in 0..depth {
            current = current.parent.as_deref()?;
        }
        Some(current)
    }

    pub fn slot(&self, name: &str) -> Option<&'a Value> {
        self.slots.and_then(|s| s.get(name))
    }

    /// Human-readable location for diagnostics
    pub fn location(&self) -> String {
        let rendered = display_path(&self.path);
        if rendered.is_empty() {
            "<root>".to_string()
        } else {
            rendered
        }
    }
}
