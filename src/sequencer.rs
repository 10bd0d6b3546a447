//! Dependency-ordered persistence of built instances
//!
//! Parents are flushed before their children so that identities assigned by
//! the store are available when children are bound to them. Binding happens
//! after the parent flush and before the child is added, so a store enforcing
//! non-null foreign keys never sees an unbound child.

use crate::error::{Error, ErrorReport};
use crate::executor::{MappingResult, TableOutput};
use crate::key::JoinKey;
use crate::relationships::{bind_children, KeyMap, ManyToOneSpec, Record};
use crate::session::Session;
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Outcome of [`load`]
#[derive(Debug)]
pub struct LoadReport<H> {
    /// Tables in the order they were flushed
    pub order: Vec<String>,
    /// Session handle of every persisted instance, by table and join key
    pub handles: IndexMap<String, IndexMap<JoinKey, H>>,
    /// Mapping errors carried over plus binding errors found while loading
    pub errors: ErrorReport,
}

/// Order `tables` so that every parent comes before its children.
///
/// Tables that only appear in a relationship are included. Among tables that
/// are ready at the same time, the one declared first goes first. A
/// relationship from a table to itself counts as a cycle.
pub fn flush_order(tables: &[String], relationships: &[ManyToOneSpec]) -> Result<Vec<String>, Error> {
    let mut nodes: IndexSet<&str> = tables.iter().map(String::as_str).collect();
    for rel in relationships {
        nodes.insert(&rel.parent_table);
        nodes.insert(&rel.child_table);
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];
    let mut seen = HashSet::new();
    for rel in relationships {
        let (Some(parent), Some(child)) = (
            nodes.get_index_of(rel.parent_table.as_str()),
            nodes.get_index_of(rel.child_table.as_str()),
        ) else {
            continue;
        };
        if seen.insert((parent, child)) {
            children[parent].push(child);
            in_degree[child] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &child in &children[next] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() < nodes.len() {
        let tables = (0..nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .filter_map(|i| nodes.get_index(i))
            .map(|t| t.to_string())
            .collect();
        return Err(Error::DependencyCycle { tables });
    }

    Ok(order
        .into_iter()
        .filter_map(|i| nodes.get_index(i))
        .map(|t| t.to_string())
        .collect())
}

/// Persist the instance tables of `result` through `session`.
///
/// For each table in flush order: add its instances, flush, then bind the
/// children of every relationship it is the parent of, through the parent's
/// `id_field`. A child whose required relationship cannot be bound is
/// reported and never added; that includes parents in row tables or tables
/// nothing emitted, which are not persisted. Store failures abort the load.
pub fn load<I, S>(
    result: MappingResult<I>,
    relationships: &[ManyToOneSpec],
    key_maps: &[KeyMap],
    session: &mut S,
    id_field: &str,
) -> Result<LoadReport<S::Handle>, Error>
where
    I: Record,
    S: Session<I>,
{
    let MappingResult { tables, mut errors } = result;

    let mut pending: IndexMap<String, IndexMap<JoinKey, I>> = IndexMap::new();
    for (table, output) in tables {
        match output {
            TableOutput::Instances(items) => {
                pending.insert(table, items);
            }
            TableOutput::Rows(rows) => {
                debug!(table = %table, rows = rows.len(), "skipping row table");
            }
        }
    }

    let declared: Vec<String> = pending.keys().cloned().collect();
    let order = flush_order(&declared, relationships)?;
    debug!(order = ?order, "flush order");

    let mut blocked: HashMap<String, HashSet<JoinKey>> = HashMap::new();
    let mut handles = IndexMap::new();
    for table in &order {
        let items = pending.shift_remove(table);
        let persisted = items.is_some();
        let skip = blocked.remove(table).unwrap_or_default();

        let mut table_handles = IndexMap::new();
        if let Some(items) = items {
            for (key, instance) in items {
                if skip.contains(&key) {
                    continue;
                }
                let handle = session.add(table, instance).map_err(|e| Error::Persistence {
                    table: table.clone(),
                    message: e.to_string(),
                })?;
                table_handles.insert(key, handle);
            }
            session.flush().map_err(|e| Error::Persistence {
                table: table.clone(),
                message: e.to_string(),
            })?;
            debug!(table = %table, added = table_handles.len(), skipped = skip.len(), "flushed table");
        } else {
            debug!(table = %table, "no instances to persist");
        }

        for (rel, map) in relationships.iter().zip(key_maps) {
            if rel.parent_table != *table {
                continue;
            }
            let Some(children) = pending.get_mut(&rel.child_table) else {
                continue;
            };
            let store = &*session;
            let lookup = |k: &JoinKey| table_handles.get(k).and_then(|h| store.get(*h));
            let failed = bind_children(children, rel, map, lookup, id_field, &mut errors);
            if !failed.is_empty() {
                warn!(child = %rel.child_table, attr = %rel.attr, count = failed.len(), "children left unbound");
                blocked.entry(rel.child_table.clone()).or_default().extend(failed);
            }
        }
        if persisted {
            handles.insert(table.clone(), table_handles);
        }
    }

    Ok(LoadReport { order, handles, errors })
}
