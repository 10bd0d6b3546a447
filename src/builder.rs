//! Instance builders: turn accumulated field updates into finished instances
//!
//! The executor talks to builders only through [`InstanceBuilder`]. A builder
//! receives incremental updates per join key, possibly from many contexts and
//! many roots, and converts every key into one instance in a single
//! finalization pass. Finalization failures are reported per key.
//!
//! Three builders ship with the crate:
//!
//! - [`MapBuilder`]: plain mappings ([`Row`]), with optional required and
//!   allowed field lists
//! - [`ConstructorBuilder`]: hands the accumulated row to a user constructor
//! - [`SerdeBuilder`]: deserializes the accumulated row into any
//!   `T: DeserializeOwned`, so serde does the validation

use crate::key::JoinKey;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// An ordered field-name to value mapping
pub type Row = IndexMap<String, Value>;

/// Outcome of finalizing every key of one builder
pub type Finalized<I> = IndexMap<JoinKey, Result<I, Vec<BuildError>>>;

/// A builder rejected a selector, an update, or could not finish a key
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct BuildError {
    pub field: Option<String>,
    pub message: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        BuildError {
            field: None,
            message: message.into(),
        }
    }

    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        BuildError {
            message: format!("{}: {}", field, message.into()),
            field: Some(field),
        }
    }
}

/// Capability the executor uses to build instances of type `I`
pub trait InstanceBuilder<I> {
    /// The field name updates for `selector` are recorded under
    fn resolve_field_name(&self, selector: &str) -> Result<String, BuildError> {
        Ok(selector.to_string())
    }

    /// Record field updates for `key`. Updates carry merge-policy-resolved
    /// values, so re-applying one must not change the outcome.
    fn update(&mut self, key: &JoinKey, updates: Row) -> Result<(), BuildError>;

    /// Convert every key that received an update into an instance
    fn finalize_all(&mut self) -> Finalized<I>;
}

/// Creates a fresh builder for each run, keeping mapping specs reusable
pub type BuilderFactory<I> = Arc<dyn Fn() -> Box<dyn InstanceBuilder<I>> + Send + Sync>;

/// Wrap a builder constructor as a [`BuilderFactory`]
pub fn factory<I, B, F>(make: F) -> BuilderFactory<I>
where
    B: InstanceBuilder<I> + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn InstanceBuilder<I>>)
}

/// Per-key accumulated rows shared by the stock builders
#[derive(Debug, Default)]
struct RowStore {
    rows: IndexMap<JoinKey, Row>,
}

impl RowStore {
    fn update(&mut self, key: &JoinKey, updates: Row) {
        let row = self.rows.entry(key.clone()).or_default();
        for (field, value) in updates {
            row.insert(field, value);
        }
    }

    fn drain(&mut self) -> IndexMap<JoinKey, Row> {
        std::mem::take(&mut self.rows)
    }
}

fn check_allowed(allowed: &Option<Vec<String>>, selector: &str) -> Result<String, BuildError> {
    match allowed {
        Some(fields) if !fields.iter().any(|f| f == selector) => {
            Err(BuildError::for_field(selector, "unknown field"))
        }
        _ => Ok(selector.to_string()),
    }
}

/// Builds plain [`Row`] mappings
#[derive(Debug, Default)]
pub struct MapBuilder {
    store: RowStore,
    required: Vec<String>,
    allowed: Option<Vec<String>>,
}

impl MapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields that must be present and non-null at finalization
    pub fn with_required<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.required = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    /// Restrict selectors to a fixed set of field names
    pub fn with_allowed<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.allowed = Some(fields.iter().map(|f| f.as_ref().to_string()).collect());
        self
    }

    pub fn factory() -> BuilderFactory<Row> {
        factory(MapBuilder::new)
    }
}

impl InstanceBuilder<Row> for MapBuilder {
    fn resolve_field_name(&self, selector: &str) -> Result<String, BuildError> {
        check_allowed(&self.allowed, selector)
    }

    fn update(&mut self, key: &JoinKey, updates: Row) -> Result<(), BuildError> {
        self.store.update(key, updates);
        Ok(())
    }

    fn finalize_all(&mut self) -> Finalized<Row> {
        self.store
            .drain()
            .into_iter()
            .map(|(key, row)| {
                let missing: Vec<BuildError> = self
                    .required
                    .iter()
                    .filter(|f| row.get(f.as_str()).map_or(true, Value::is_null))
                    .map(|f| BuildError::for_field(f.as_str(), "required field missing"))
                    .collect();
                let outcome = if missing.is_empty() { Ok(row) } else { Err(missing) };
                (key, outcome)
            })
            .collect()
    }
}

/// User constructor turning one accumulated row into an instance
pub type Constructor<I> = Arc<dyn Fn(&Row) -> Result<I, Vec<BuildError>> + Send + Sync>;

/// Hands each accumulated row to a constructor function
pub struct ConstructorBuilder<I> {
    store: RowStore,
    construct: Constructor<I>,
}

impl<I: 'static> ConstructorBuilder<I> {
    pub fn new(construct: Constructor<I>) -> Self {
        ConstructorBuilder {
            store: RowStore::default(),
            construct,
        }
    }

    pub fn factory<F>(construct: F) -> BuilderFactory<I>
    where
        F: Fn(&Row) -> Result<I, Vec<BuildError>> + Send + Sync + 'static,
    {
        let construct: Constructor<I> = Arc::new(construct);
        factory(move || ConstructorBuilder::new(construct.clone()))
    }
}

impl<I> InstanceBuilder<I> for ConstructorBuilder<I> {
    fn update(&mut self, key: &JoinKey, updates: Row) -> Result<(), BuildError> {
        self.store.update(key, updates);
        Ok(())
    }

    fn finalize_all(&mut self) -> Finalized<I> {
        self.store
            .drain()
            .into_iter()
            .map(|(key, row)| {
                let outcome = (self.construct)(&row);
                (key, outcome)
            })
            .collect()
    }
}

/// Validating builder: deserializes the accumulated row into `T`
pub struct SerdeBuilder<T> {
    store: RowStore,
    fields: Option<Vec<String>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + 'static> SerdeBuilder<T> {
    pub fn new() -> Self {
        SerdeBuilder {
            store: RowStore::default(),
            fields: None,
            _marker: PhantomData,
        }
    }

    /// Reject selectors outside `fields` as soon as they are used
    pub fn with_fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.fields = Some(fields.iter().map(|f| f.as_ref().to_string()).collect());
        self
    }

    pub fn factory() -> BuilderFactory<T> {
        factory(SerdeBuilder::<T>::new)
    }
}

impl<T: DeserializeOwned + 'static> Default for SerdeBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> InstanceBuilder<T> for SerdeBuilder<T> {
    fn resolve_field_name(&self, selector: &str) -> Result<String, BuildError> {
        check_allowed(&self.fields, selector)
    }

    fn update(&mut self, key: &JoinKey, updates: Row) -> Result<(), BuildError> {
        self.store.update(key, updates);
        Ok(())
    }

    fn finalize_all(&mut self) -> Finalized<T> {
        self.store
            .drain()
            .into_iter()
            .map(|(key, row)| {
                let object = Value::Object(row.into_iter().collect());
                let outcome = serde_json::from_value(object)
                    .map_err(|e| vec![BuildError::new(e.to_string())]);
                (key, outcome)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_map_builder_accumulates_and_checks_required() {
        let mut builder = MapBuilder::new().with_required(&["name"]);
        builder.update(&JoinKey::of(1), row(json!({"id": 1}))).unwrap();
        builder.update(&JoinKey::of(1), row(json!({"name": "Ada"}))).unwrap();
        builder.update(&JoinKey::of(2), row(json!({"id": 2}))).unwrap();

        let done = builder.finalize_all();
        assert_eq!(done[&JoinKey::of(1)].as_ref().unwrap(), &row(json!({"id": 1, "name": "Ada"})));
        let errors = done[&JoinKey::of(2)].as_ref().unwrap_err();
        assert_eq!(errors[0].field.as_deref(), Some("name"));

        // finalization drains the builder
        assert!(builder.finalize_all().is_empty());
    }

    #[test]
    fn test_allowed_fields() {
        let builder = MapBuilder::new().with_allowed(&["id"]);
        assert_eq!(builder.resolve_field_name("id").unwrap(), "id");
        assert!(builder.resolve_field_name("nmae").is_err());
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: String,
        email: String,
    }

    #[test]
    fn test_serde_builder_validates() {
        let mut builder = SerdeBuilder::<User>::new().with_fields(&["id", "email"]);
        builder.update(&JoinKey::of("u1"), row(json!({"id": "u1", "email": "ada@example.com"}))).unwrap();
        builder.update(&JoinKey::of("u2"), row(json!({"id": "u2"}))).unwrap();

        let done = builder.finalize_all();
        assert_eq!(
            done[&JoinKey::of("u1")].as_ref().unwrap(),
            &User { id: "u1".into(), email: "ada@example.com".into() }
        );
        assert!(done[&JoinKey::of("u2")].is_err());
        assert!(builder.resolve_field_name("age").is_err());
    }

    #[test]
    fn test_constructor_builder() {
        let make = ConstructorBuilder::factory(|row: &Row| {
            row.get("n")
                .and_then(Value::as_i64)
                .ok_or_else(|| vec![BuildError::for_field("n", "expected integer")])
        });
        let mut builder = make();
        builder.update(&JoinKey::of("a"), row(json!({"n": 4}))).unwrap();
        builder.update(&JoinKey::of("b"), row(json!({"n": "x"}))).unwrap();

        let done = builder.finalize_all();
        assert_eq!(done[&JoinKey::of("a")], Ok(4));
        assert!(done[&JoinKey::of("b")].is_err());
    }
}
