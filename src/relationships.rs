//! Many-to-one relationships between output tables
//!
//! Resolution is a second, independent pass over the input: every context
//! that produces a child key also evaluates the relationship's parent-key
//! transforms, giving a child key to parent key map per relationship. Binding
//! is a separate step, either in memory ([`bind_many_to_one`]) or during
//! persistence ([`crate::sequencer::load`]).

use crate::builder::Row;
use crate::error::{Error, ErrorReport};
use crate::executor::{MappingResult, MappingSpec, TableOutput};
use crate::key::JoinKey;
use crate::transform::Transform;
use crate::traversal::traverse;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// A reference from each child row to one parent row
#[derive(Clone)]
pub struct ManyToOneSpec {
    pub child_table: String,
    pub parent_table: String,
    /// Field on the child that receives the parent reference
    pub attr: String,
    /// Evaluated in the child's context, reproduces the parent's join key
    pub child_to_parent_key: Vec<Transform>,
    /// Whether an unresolved parent is an error
    pub required: bool,
}

impl ManyToOneSpec {
    pub fn new(
        child_table: impl Into<String>,
        parent_table: impl Into<String>,
        attr: impl Into<String>,
    ) -> Self {
        ManyToOneSpec {
            child_table: child_table.into(),
            parent_table: parent_table.into(),
            attr: attr.into(),
            child_to_parent_key: Vec::new(),
            required: false,
        }
    }

    /// Append a parent-key component
    pub fn key(mut self, part: Transform) -> Self {
        self.child_to_parent_key.push(part);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

impl fmt::Debug for ManyToOneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManyToOneSpec")
            .field("child_table", &self.child_table)
            .field("parent_table", &self.parent_table)
            .field("attr", &self.attr)
            .field("key_parts", &self.child_to_parent_key.len())
            .field("required", &self.required)
            .finish()
    }
}

/// Child key to parent key; `None` when the parent key did not resolve
pub type KeyMap = IndexMap<JoinKey, Option<JoinKey>>;

/// Something that can hold a reference to a parent of the same type
pub trait Record {
    /// Point `attr` of `self` at `parent`. `id_field` names the parent's
    /// identity for records that reference their parent by value.
    fn bind(&mut self, attr: &str, parent: &Self, id_field: &str) -> Result<(), String>;
}

/// Rows reference their parent by copying the parent's id field
impl Record for Row {
    fn bind(&mut self, attr: &str, parent: &Self, id_field: &str) -> Result<(), String> {
        match parent.get(id_field) {
            Some(id) if !id.is_null() => {
                self.insert(attr.to_string(), id.clone());
                Ok(())
            }
            _ => Err(format!("parent has no {}", id_field)),
        }
    }
}

/// Re-traverse every root and compute one key map per relationship, in the
/// order the relationships were given.
pub fn compute_relationship_keys<I>(
    roots: &[Value],
    spec: &MappingSpec<I>,
    relationships: &[ManyToOneSpec],
) -> Vec<KeyMap> {
    let mut maps = vec![KeyMap::new(); relationships.len()];
    for root in roots {
        for traversal in &spec.traversals {
            for ctx in traverse(root, traversal) {
                for emit in &traversal.emits {
                    let mut child_key = None;
                    for (rel, map) in relationships.iter().zip(maps.iter_mut()) {
                        if rel.child_table != emit.table() {
                            continue;
                        }
                        if child_key.is_none() {
                            child_key = JoinKey::compute(emit.join_keys(), &ctx);
                        }
                        let Some(child) = &child_key else {
                            break;
                        };
                        let parent = JoinKey::compute(&rel.child_to_parent_key, &ctx);
                        match map.get_mut(child) {
                            Some(_) if parent.is_none() => {}
                            Some(existing) => *existing = parent,
                            None => {
                                map.insert(child.clone(), parent);
                            }
                        }
                    }
                }
            }
        }
    }

    for (rel, map) in relationships.iter().zip(&maps) {
        let resolved = map.values().filter(|p| p.is_some()).count();
        debug!(
            child = %rel.child_table,
            parent = %rel.parent_table,
            children = map.len(),
            resolved,
            "computed relationship keys"
        );
    }
    maps
}

/// Set `rel.attr` on every child whose parent can be found through `lookup`.
///
/// Unresolved optional relationships are left unset. Returns the keys of
/// children whose required relationship could not be bound.
pub(crate) fn bind_children<'p, R, F>(
    children: &mut IndexMap<JoinKey, R>,
    rel: &ManyToOneSpec,
    map: &KeyMap,
    lookup: F,
    id_field: &str,
    errors: &mut ErrorReport,
) -> Vec<JoinKey>
where
    R: Record + 'p,
    F: Fn(&JoinKey) -> Option<&'p R>,
{
    let mut failed = Vec::new();
    for (key, child) in children.iter_mut() {
        let Some(parent_key) = map.get(key).cloned().flatten() else {
            if rel.required {
                errors.push(Error::UnresolvedRelationship {
                    child_table: rel.child_table.clone(),
                    parent_table: rel.parent_table.clone(),
                    attr: rel.attr.clone(),
                    key: key.clone(),
                });
                failed.push(key.clone());
            }
            continue;
        };

        let Some(parent) = lookup(&parent_key) else {
            if rel.required {
                errors.push(Error::MissingParent {
                    child_table: rel.child_table.clone(),
                    parent_table: rel.parent_table.clone(),
                    attr: rel.attr.clone(),
                    key: key.clone(),
                    parent_key,
                });
                failed.push(key.clone());
            }
            continue;
        };

        if let Err(message) = child.bind(&rel.attr, parent, id_field) {
            errors.push(Error::Binding {
                table: rel.child_table.clone(),
                key: key.clone(),
                attr: rel.attr.clone(),
                message,
            });
            if rel.required {
                failed.push(key.clone());
            }
        }
    }
    failed
}

/// Bind relationships between tables of an in-memory result.
///
/// Rows are bound through the parent's `id_field`, normally
/// [`RunConfig::id_field`](crate::config::RunConfig). Binding failures are
/// appended to `result.errors`. A relationship from a table to itself is
/// rejected as a dependency cycle.
pub fn bind_many_to_one<I: Record>(
    result: &mut MappingResult<I>,
    relationships: &[ManyToOneSpec],
    key_maps: &[KeyMap],
    id_field: &str,
) -> Result<(), Error> {
    for (rel, map) in relationships.iter().zip(key_maps) {
        if rel.child_table == rel.parent_table {
            return Err(Error::DependencyCycle {
                tables: vec![rel.child_table.clone()],
            });
        }
        let Some(slot) = result.tables.get_mut(&rel.child_table) else {
            continue;
        };
        let mut children = std::mem::replace(slot, TableOutput::Rows(IndexMap::new()));
        let parents = result.tables.get(&rel.parent_table);
        let errors = &mut result.errors;

        match (&mut children, parents) {
            (TableOutput::Rows(rows), Some(TableOutput::Rows(parents))) => {
                bind_children(rows, rel, map, |k| parents.get(k), id_field, errors);
            }
            (TableOutput::Instances(items), Some(TableOutput::Instances(parents))) => {
                bind_children(items, rel, map, |k| parents.get(k), id_field, errors);
            }
            (TableOutput::Rows(rows), None) => {
                bind_children(rows, rel, map, |_| None::<&Row>, id_field, errors);
            }
            (TableOutput::Instances(items), None) => {
                bind_children(items, rel, map, |_| None::<&I>, id_field, errors);
            }
            (TableOutput::Rows(rows), Some(_)) => {
                kind_mismatch(rel, rows.keys(), errors);
            }
            (TableOutput::Instances(items), Some(_)) => {
                kind_mismatch(rel, items.keys(), errors);
            }
        }

        if let Some(slot) = result.tables.get_mut(&rel.child_table) {
            *slot = children;
        }
    }
    Ok(())
}

fn kind_mismatch<'k>(rel: &ManyToOneSpec, keys: impl Iterator<Item = &'k JoinKey>, errors: &mut ErrorReport) {
    for key in keys {
        errors.push(Error::Binding {
            table: rel.child_table.clone(),
            key: key.clone(),
            attr: rel.attr.clone(),
            message: format!("{} holds a different kind of output", rel.parent_table),
        });
    }
}
