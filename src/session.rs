//! Persistence seam used by the flush sequencer

use crate::builder::Row;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct PersistError(pub String);

/// A unit of work that stages instances and assigns identities on flush.
///
/// Handles stay valid across flushes; `get` returns the staged instance,
/// including anything the store filled in when it was flushed.
pub trait Session<I> {
    type Handle: Copy + Debug;

    fn add(&mut self, table: &str, instance: I) -> Result<Self::Handle, PersistError>;

    fn flush(&mut self) -> Result<(), PersistError>;

    fn get(&self, handle: Self::Handle) -> Option<&I>;
}

#[derive(Debug)]
struct Staged {
    table: String,
    row: Row,
    flushed: bool,
}

/// In-memory store for [`Row`]s.
///
/// Flushing assigns sequential ids per table to rows without one and checks
/// not-null constraints, the way a relational store would.
#[derive(Debug)]
pub struct MemorySession {
    id_field: String,
    staged: Vec<Staged>,
    next_id: HashMap<String, u64>,
    not_null: HashSet<(String, String)>,
    flushes: Vec<Vec<String>>,
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySession {
    pub fn new() -> Self {
        MemorySession {
            id_field: String::from("id"),
            staged: Vec::new(),
            next_id: HashMap::new(),
            not_null: HashSet::new(),
            flushes: Vec::new(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    /// Reject flushing `table` rows whose `column` is missing or null
    pub fn require_non_null(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.not_null.insert((table.into(), column.into()));
        self
    }

    /// Flushed rows of `table`, in insertion order
    pub fn rows(&self, table: &str) -> Vec<&Row> {
        self.staged
            .iter()
            .filter(|s| s.flushed && s.table == table)
            .map(|s| &s.row)
            .collect()
    }

    /// Tables written by each flush, in order
    pub fn flush_log(&self) -> &[Vec<String>] {
        &self.flushes
    }
}

impl Session<Row> for MemorySession {
    type Handle = usize;

    fn add(&mut self, table: &str, instance: Row) -> Result<usize, PersistError> {
        self.staged.push(Staged {
            table: table.to_string(),
            row: instance,
            flushed: false,
        });
        Ok(self.staged.len() - 1)
    }

    fn flush(&mut self) -> Result<(), PersistError> {
        for staged in self.staged.iter().filter(|s| !s.flushed) {
            for (table, column) in &self.not_null {
                if *table == staged.table && staged.row.get(column).map_or(true, Value::is_null) {
                    return Err(PersistError(format!("{table}.{column} may not be null")));
                }
            }
        }

        let mut tables = Vec::new();
        for staged in self.staged.iter_mut().filter(|s| !s.flushed) {
            let next = self.next_id.entry(staged.table.clone()).or_insert(1);
            match staged.row.get(&self.id_field) {
                Some(Value::Number(n)) => {
                    if let Some(n) = n.as_u64() {
                        *next = (*next).max(n.saturating_add(1));
                    }
                }
                Some(v) if !v.is_null() => {}
                _ => {
                    let id = *next;
                    *next = id
                        .checked_add(1)
                        .ok_or_else(|| PersistError(format!("{} has no ids left", staged.table)))?;
                    staged.row.insert(self.id_field.clone(), Value::from(id));
                }
            }
            staged.flushed = true;
            if !tables.contains(&staged.table) {
                tables.push(staged.table.clone());
            }
        }
        self.flushes.push(tables);
        Ok(())
    }

    fn get(&self, handle: usize) -> Option<&Row> {
        self.staged.get(handle).map(|s| &s.row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_flush_assigns_ids() {
        let mut session = MemorySession::new();
        let a = session.add("users", row(json!({"name": "Alice"}))).unwrap();
        session.add("users", row(json!({"id": 10, "name": "Bob"}))).unwrap();
        assert_eq!(session.get(a).unwrap().get("id"), None);

        session.flush().unwrap();
        let c = session.add("users", row(json!({"name": "Carol"}))).unwrap();
        session.flush().unwrap();

        assert_eq!(session.get(a).unwrap()["id"], json!(1));
        assert_eq!(session.get(c).unwrap()["id"], json!(11));
        assert_eq!(session.rows("users").len(), 3);
        assert_eq!(session.flush_log().len(), 2);
    }

    #[test]
    fn test_not_null_constraint() {
        let mut session = MemorySession::new().require_non_null("posts", "user_id");
        session.add("posts", row(json!({"title": "x"}))).unwrap();
        let err = session.flush().unwrap_err();
        assert_eq!(err.to_string(), "posts.user_id may not be null");
        assert!(session.rows("posts").is_empty());
    }

    #[test]
    fn test_explicit_max_id() {
        let mut session = MemorySession::new();
        session.add("users", row(json!({"id": u64::MAX, "name": "Max"}))).unwrap();
        session.flush().unwrap();
        assert_eq!(session.rows("users")[0]["id"], json!(u64::MAX));

        let next = session.add("users", row(json!({"name": "Nobody"}))).unwrap();
        let err = session.flush().unwrap_err();
        assert_eq!(err.to_string(), "users has no ids left");
        assert_eq!(session.get(next).unwrap().get("id"), None);
    }
}
