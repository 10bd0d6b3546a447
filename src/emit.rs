//! Emission specs: what to produce for each context of a traversal

use crate::builder::BuilderFactory;
use crate::config::ErrorMode;
use crate::merge::MergePolicy;
use crate::transform::Transform;
use indexmap::IndexMap;
use std::fmt;

/// A named output field of a row
#[derive(Clone)]
pub struct Field {
    pub name: String,
    pub transform: Transform,
}

impl Field {
    pub fn new(name: impl Into<String>, transform: Transform) -> Self {
        Field {
            name: name.into(),
            transform,
        }
    }
}

/// A builder field: the selector is resolved to a field name by the builder
#[derive(Clone)]
pub struct FieldSpec {
    pub selector: String,
    pub transform: Transform,
}

impl FieldSpec {
    pub fn new(selector: impl Into<String>, transform: Transform) -> Self {
        FieldSpec {
            selector: selector.into(),
            transform,
        }
    }
}

/// Produces plain keyed rows
#[derive(Clone)]
pub struct RowEmit {
    pub table: String,
    pub fields: Vec<Field>,
    pub join_keys: Vec<Transform>,
}

impl RowEmit {
    pub fn new(table: impl Into<String>) -> Self {
        RowEmit {
            table: table.into(),
            fields: Vec::new(),
            join_keys: Vec::new(),
        }
    }

    /// Append a join-key component
    pub fn join_on(mut self, key: Transform) -> Self {
        self.join_keys.push(key);
        self
    }

    pub fn field(mut self, name: impl Into<String>, transform: Transform) -> Self {
        self.fields.push(Field::new(name, transform));
        self
    }
}

/// Produces builder-managed instances of type `I`
pub struct InstanceEmit<I> {
    pub table: String,
    pub join_keys: Vec<Transform>,
    pub fields: Vec<FieldSpec>,
    pub builder: BuilderFactory<I>,
    /// Merge policy per resolved field name
    pub policies: IndexMap<String, MergePolicy>,
    /// Overrides the run-wide error mode for this emission
    pub error_mode: Option<ErrorMode>,
}

impl<I> InstanceEmit<I> {
    pub fn new(table: impl Into<String>, builder: BuilderFactory<I>) -> Self {
        InstanceEmit {
            table: table.into(),
            join_keys: Vec::new(),
            fields: Vec::new(),
            builder,
            policies: IndexMap::new(),
            error_mode: None,
        }
    }

    pub fn join_on(mut self, key: Transform) -> Self {
        self.join_keys.push(key);
        self
    }

    pub fn field(mut self, selector: impl Into<String>, transform: Transform) -> Self {
        self.fields.push(FieldSpec::new(selector, transform));
        self
    }

    pub fn policy(mut self, field: impl Into<String>, policy: MergePolicy) -> Self {
        self.policies.insert(field.into(), policy);
        self
    }

    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = Some(mode);
        self
    }
}

impl<I> Clone for InstanceEmit<I> {
    fn clone(&self) -> Self {
        InstanceEmit {
            table: self.table.clone(),
            join_keys: self.join_keys.clone(),
            fields: self.fields.clone(),
            builder: self.builder.clone(),
            policies: self.policies.clone(),
            error_mode: self.error_mode,
        }
    }
}

/// One declared emission, dispatched on by the executor
pub enum Emit<I> {
    Row(RowEmit),
    Instance(InstanceEmit<I>),
}

impl<I> Emit<I> {
    pub fn table(&self) -> &str {
        match self {
            Emit::Row(e) => &e.table,
            Emit::Instance(e) => &e.table,
        }
    }

    pub fn join_keys(&self) -> &[Transform] {
        match self {
            Emit::Row(e) => &e.join_keys,
            Emit::Instance(e) => &e.join_keys,
        }
    }
}

impl<I> Clone for Emit<I> {
    fn clone(&self) -> Self {
        match self {
            Emit::Row(e) => Emit::Row(e.clone()),
            Emit::Instance(e) => Emit::Instance(e.clone()),
        }
    }
}

impl<I> From<RowEmit> for Emit<I> {
    fn from(emit: RowEmit) -> Self {
        Emit::Row(emit)
    }
}

impl<I> From<InstanceEmit<I>> for Emit<I> {
    fn from(emit: InstanceEmit<I>) -> Self {
        Emit::Instance(emit)
    }
}

impl<I> fmt::Debug for Emit<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Emit::Row(e) => f
                .debug_struct("RowEmit")
                .field("table", &e.table)
                .field("fields", &e.fields.iter().map(|x| &x.name).collect::<Vec<_>>())
                .field("join_keys", &e.join_keys.len())
                .finish(),
            Emit::Instance(e) => f
                .debug_struct("InstanceEmit")
                .field("table", &e.table)
                .field("fields", &e.fields.iter().map(|x| &x.selector).collect::<Vec<_>>())
                .field("join_keys", &e.join_keys.len())
                .field("policies", &e.policies)
                .finish(),
        }
    }
}
