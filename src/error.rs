//! Engine errors and the collected error report

use crate::key::JoinKey;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("{table} {key}: update rejected: {message}")]
    BuilderUpdate {
        table: String,
        key: JoinKey,
        message: String,
    },

    #[error("{table} {key}: could not finalize: {}", messages.join("; "))]
    BuilderFinalize {
        table: String,
        key: JoinKey,
        messages: Vec<String>,
    },

    #[error("{child_table} {key}: required relationship `{attr}` to {parent_table} did not resolve")]
    UnresolvedRelationship {
        child_table: String,
        parent_table: String,
        attr: String,
        key: JoinKey,
    },

    #[error("{child_table} {key}: `{attr}` points at {parent_table} {parent_key}, which was not built")]
    MissingParent {
        child_table: String,
        parent_table: String,
        attr: String,
        key: JoinKey,
        parent_key: JoinKey,
    },

    #[error("{table} {key}: cannot bind `{attr}`: {message}")]
    Binding {
        table: String,
        key: JoinKey,
        attr: String,
        message: String,
    },

    #[error("dependency cycle among tables: {}", tables.join(", "))]
    DependencyCycle { tables: Vec<String> },

    #[error("table {table} is emitted both as rows and as instances")]
    TableKindConflict { table: String },

    #[error("persisting {table} failed: {message}")]
    Persistence { table: String, message: String },
}

impl Error {
    /// The table an error is attributed to
    pub fn table(&self) -> Option<&str> {
        match self {
            Error::BuilderUpdate { table, .. }
            | Error::BuilderFinalize { table, .. }
            | Error::Binding { table, .. }
            | Error::TableKindConflict { table }
            | Error::Persistence { table, .. } => Some(table),
            Error::UnresolvedRelationship { child_table, .. }
            | Error::MissingParent { child_table, .. } => Some(child_table),
            Error::DependencyCycle { .. } => None,
        }
    }

    /// The row key an error is attributed to
    pub fn key(&self) -> Option<&JoinKey> {
        match self {
            Error::BuilderUpdate { key, .. }
            | Error::BuilderFinalize { key, .. }
            | Error::UnresolvedRelationship { key, .. }
            | Error::MissingParent { key, .. }
            | Error::Binding { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Errors gathered in collect mode, in the order they occurred
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    errors: Vec<Error>,
}

impl ErrorReport {
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub fn extend(&mut self, other: ErrorReport) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.errors.iter()
    }

    pub fn for_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Error> {
        self.errors.iter().filter(move |e| e.table() == Some(table))
    }

    pub fn for_key<'a>(&'a self, table: &'a str, key: &'a JoinKey) -> impl Iterator<Item = &'a Error> {
        self.for_table(table).filter(move |e| e.key() == Some(key))
    }

    pub fn into_vec(self) -> Vec<Error> {
        self.errors
    }
}
