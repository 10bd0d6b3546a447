//! Traversal engine: walks a tree and yields one context per node to process

use crate::context::{Context, Slots, NULL};
use crate::emit::Emit;
use crate::path::{resolve_path, PathSegment};
use crate::transform::IntoPath;
use serde::Deserialize;
use serde_json::Value;
use std::rc::Rc;

/// How a container reached by a path is iterated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationMode {
    /// One context per mapping entry; non-mappings yield nothing
    Items,
    /// One context per sequence element; non-sequences yield nothing
    Elements,
    /// One context wrapping the container itself
    Single,
    /// Elements for sequences, a single context for anything else
    #[default]
    Auto,
}

/// How to reach and iterate a collection of nodes, and what to emit for each
pub struct TraversalSpec<I> {
    /// Path from the root to the outer container
    pub path: Vec<PathSegment>,
    pub mode: IterationMode,
    /// Path inside each outer node to an inner container, iterated instead
    pub inner_path: Option<Vec<PathSegment>>,
    pub inner_mode: IterationMode,
    pub slots: Slots,
    pub emits: Vec<Emit<I>>,
}

impl<I> TraversalSpec<I> {
    pub fn new(path: impl IntoPath, mode: IterationMode) -> Self {
        TraversalSpec {
            path: path.into_path(),
            mode,
            inner_path: None,
            inner_mode: IterationMode::Auto,
            slots: Slots::new(),
            emits: Vec::new(),
        }
    }

    /// Iterate a second level under each outer node
    pub fn inner(mut self, path: impl IntoPath, mode: IterationMode) -> Self {
        self.inner_path = Some(path.into_path());
        self.inner_mode = mode;
        self
    }

    pub fn slot(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.slots.insert(name.into(), value.into());
        self
    }

    pub fn emit(mut self, emit: impl Into<Emit<I>>) -> Self {
        self.emits.push(emit.into());
        self
    }
}

impl<I> Clone for TraversalSpec<I> {
    fn clone(&self) -> Self {
        TraversalSpec {
            path: self.path.clone(),
            mode: self.mode,
            inner_path: self.inner_path.clone(),
            inner_mode: self.inner_mode,
            slots: self.slots.clone(),
            emits: self.emits.clone(),
        }
    }
}

impl<I> std::fmt::Debug for TraversalSpec<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraversalSpec")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("inner_path", &self.inner_path)
            .field("inner_mode", &self.inner_mode)
            .field("emits", &self.emits)
            .finish()
    }
}

/// Contexts produced by one call to [`traverse`]. Exhausted once consumed;
/// call `traverse` again for a fresh pass.
pub type Traversal<'a> = std::vec::IntoIter<Context<'a>>;

/// Produce the contexts `spec` selects from `root`.
///
/// A missing path or a container of the wrong shape yields zero contexts for
/// `Items`/`Elements`; strings are never iterated as sequences.
pub fn traverse<'a, I>(root: &'a Value, spec: &'a TraversalSpec<I>) -> Traversal<'a> {
    let slots = (!spec.slots.is_empty()).then_some(&spec.slots);
    let outer = resolve_path(root, &spec.path);
    let mut base = Context::base(root, outer, spec.path.clone());
    base.slots = slots;
    let base = Rc::new(base);

    let mut out = Vec::new();
    let Some(inner_path) = &spec.inner_path else {
        expand(&base, base.node, &spec.path, spec.mode, &mut out);
        return out.into_iter();
    };

    let mut outers = Vec::new();
    expand(&base, base.node, &spec.path, spec.mode, &mut outers);
    for outer_ctx in outers {
        let container = resolve_path(outer_ctx.node, inner_path).unwrap_or(&NULL);
        let mut inner_base = outer_ctx.path.clone();
        inner_base.extend(inner_path.iter().cloned());
        let parent = Rc::new(outer_ctx);
        expand(&parent, container, &inner_base, spec.inner_mode, &mut out);
    }
    out.into_iter()
}

fn expand<'a>(
    parent: &Rc<Context<'a>>,
    container: &'a Value,
    base_path: &[PathSegment],
    mode: IterationMode,
    out: &mut Vec<Context<'a>>,
) {
    let child = |node: &'a Value, seg: Option<PathSegment>, key: Option<String>, index: Option<usize>| {
        let mut path = base_path.to_vec();
        path.extend(seg);
        Context {
            root: parent.root,
            node,
            path,
            parent: Some(Rc::clone(parent)),
            key,
            index,
            slots: parent.slots,
        }
    };

    match (mode, container) {
        (IterationMode::Items, Value::Object(map)) => {
            for (k, v) in map {
                out.push(child(v, Some(PathSegment::Key(k.clone())), Some(k.clone()), None));
            }
        }
        (IterationMode::Elements | IterationMode::Auto, Value::Array(items)) => {
            for (i, v) in items.iter().enumerate() {
                out.push(child(v, Some(PathSegment::Index(i)), None, Some(i)));
            }
        }
        (IterationMode::Single | IterationMode::Auto, _) => {
            out.push(child(container, None, None, None));
        }
        _ => {}
    }
}
