//! Mapping documents: a JSON form of a mapping, compiled into
//! [`MappingSpec`] and relationship specs producing plain [`Row`]s.
//!
//! ```json
//! {
//!   "traversals": [{
//!     "path": "users",
//!     "mode": "elements",
//!     "emits": [{
//!       "kind": "instance",
//!       "table": "users",
//!       "join_on": [{"get": "id"}],
//!       "fields": {"id": {"get": "id"}, "name": {"get": "name"}},
//!       "required": ["name"]
//!     }]
//!   }],
//!   "relationships": [{
//!     "child": "posts", "parent": "users", "attr": "user_id",
//!     "key": [{"get": "user_id"}], "required": true
//!   }]
//! }
//! ```

use crate::builder::{factory, MapBuilder, Row};
use crate::config::ErrorMode;
use crate::emit::{Emit, InstanceEmit, RowEmit};
use crate::executor::MappingSpec;
use crate::merge::MergePolicy;
use crate::path::parse_path;
use crate::relationships::ManyToOneSpec;
use crate::transform::{self, Transform};
use crate::traversal::{IterationMode, TraversalSpec};
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct MappingDocument {
    pub traversals: Vec<TraversalDoc>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraversalDoc {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub mode: IterationMode,
    pub inner_path: Option<String>,
    #[serde(default)]
    pub inner_mode: IterationMode,
    #[serde(default)]
    pub slots: IndexMap<String, Value>,
    pub emits: Vec<EmitDoc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmitDoc {
    Row {
        table: String,
        join_on: Vec<TransformDoc>,
        #[serde(default)]
        fields: IndexMap<String, TransformDoc>,
    },
    Instance {
        table: String,
        join_on: Vec<TransformDoc>,
        #[serde(default)]
        fields: IndexMap<String, TransformDoc>,
        #[serde(default)]
        required: Vec<String>,
        /// Restrict accepted fields; every field is accepted when absent
        allowed: Option<Vec<String>>,
        #[serde(default)]
        policies: IndexMap<String, MergePolicy>,
        error_mode: Option<ErrorMode>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationshipDoc {
    pub child: String,
    pub parent: String,
    pub attr: String,
    pub key: Vec<TransformDoc>,
    #[serde(default)]
    pub required: bool,
}

/// A transform, written as `"key"` for argument-less transforms or
/// `{"get": "a.b"}` style objects otherwise
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformDoc {
    Node,
    Key,
    Index,
    Literal(Value),
    Get(String),
    GetFromRoot(String),
    GetFromParent {
        #[serde(default)]
        path: String,
        #[serde(default = "default_depth")]
        depth: usize,
    },
    ParentKey(usize),
    ParentIndex(usize),
    LenOf(Box<TransformDoc>),
    Concat(Vec<TransformDoc>),
    FormatId {
        parts: Vec<TransformDoc>,
        #[serde(default = "default_sep")]
        sep: String,
    },
    Coalesce(Vec<TransformDoc>),
    Slot(String),
}

fn default_depth() -> usize {
    1
}

fn default_sep() -> String {
    String::from("_")
}

impl TransformDoc {
    pub fn compile(&self) -> Transform {
        match self {
            TransformDoc::Node => transform::node(),
            TransformDoc::Key => transform::key(),
            TransformDoc::Index => transform::index(),
            TransformDoc::Literal(v) => transform::literal(v.clone()),
            TransformDoc::Get(p) => transform::get(p.as_str()),
            TransformDoc::GetFromRoot(p) => transform::get_from_root(p.as_str()),
            TransformDoc::GetFromParent { path, depth } => transform::get_from_parent(path.as_str(), *depth),
            TransformDoc::ParentKey(depth) => transform::parent_key(*depth),
            TransformDoc::ParentIndex(depth) => transform::parent_index(*depth),
            TransformDoc::LenOf(inner) => transform::len_of(inner.compile()),
            TransformDoc::Concat(parts) => transform::concat(compile_all(parts)),
            TransformDoc::FormatId { parts, sep } => transform::format_id(compile_all(parts), sep.clone()),
            TransformDoc::Coalesce(parts) => transform::coalesce(compile_all(parts)),
            TransformDoc::Slot(name) => transform::slot(name.clone()),
        }
    }
}

fn compile_all(docs: &[TransformDoc]) -> Vec<Transform> {
    docs.iter().map(TransformDoc::compile).collect()
}

impl EmitDoc {
    fn compile(&self) -> Emit<Row> {
        match self {
            EmitDoc::Row { table, join_on, fields } => {
                let mut emit = RowEmit::new(table.clone());
                emit.join_keys = compile_all(join_on);
                for (name, t) in fields {
                    emit = emit.field(name.clone(), t.compile());
                }
                emit.into()
            }
            EmitDoc::Instance {
                table,
                join_on,
                fields,
                required,
                allowed,
                policies,
                error_mode,
            } => {
                let (required, allowed) = (required.clone(), allowed.clone());
                let builder = factory(move || {
                    let builder = MapBuilder::new().with_required(&required);
                    match &allowed {
                        Some(allowed) => builder.with_allowed(allowed),
                        None => builder,
                    }
                });
                let mut emit = InstanceEmit::new(table.clone(), builder);
                emit.join_keys = compile_all(join_on);
                for (name, t) in fields {
                    emit = emit.field(name.clone(), t.compile());
                }
                for (name, policy) in policies {
                    emit = emit.policy(name.clone(), policy.clone());
                }
                if let Some(mode) = error_mode {
                    emit = emit.error_mode(*mode);
                }
                emit.into()
            }
        }
    }
}

impl MappingDocument {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse mapping document")
    }

    /// Build the mapping and its relationships, checking that the tables
    /// they reference are emitted somewhere
    pub fn compile(&self) -> Result<(MappingSpec<Row>, Vec<ManyToOneSpec>)> {
        let mut spec = MappingSpec::new();
        for (i, doc) in self.traversals.iter().enumerate() {
            if doc.emits.is_empty() {
                bail!("traversal {} ({:?}) emits nothing", i, doc.path);
            }
            let mut traversal = TraversalSpec::new(parse_path(&doc.path), doc.mode);
            if let Some(inner) = &doc.inner_path {
                traversal = traversal.inner(parse_path(inner), doc.inner_mode);
            }
            traversal.slots = doc.slots.clone();
            for emit in &doc.emits {
                traversal = traversal.emit(emit.compile());
            }
            spec = spec.traversal(traversal);
        }
        spec.validate()?;

        let tables = spec.tables();
        let mut relationships = Vec::with_capacity(self.relationships.len());
        for rel in &self.relationships {
            for table in [&rel.child, &rel.parent] {
                if !tables.contains(table) {
                    bail!("relationship {}.{} references unknown table {}", rel.child, rel.attr, table);
                }
            }
            let mut many_to_one = ManyToOneSpec::new(rel.child.clone(), rel.parent.clone(), rel.attr.clone())
                .required(rel.required);
            many_to_one.child_to_parent_key = compile_all(&rel.key);
            relationships.push(many_to_one);
        }
        Ok((spec, relationships))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::run_mapping;
    use crate::key::JoinKey;
    use serde_json::json;

    const BLOG: &str = r#"{
        "traversals": [
            {
                "path": "users",
                "mode": "elements",
                "emits": [{
                    "kind": "row",
                    "table": "users",
                    "join_on": [{"get": "id"}],
                    "fields": {"name": {"get": "name"}}
                }]
            },
            {
                "path": "users",
                "mode": "elements",
                "inner_path": "tags",
                "inner_mode": "elements",
                "slots": {"source": "feed"},
                "emits": [{
                    "kind": "instance",
                    "table": "tags",
                    "join_on": [{"format_id": {"parts": [{"get_from_parent": {"path": "id"}}, "node"], "sep": ":"}}],
                    "fields": {
                        "label": "node",
                        "seen": {"literal": 1},
                        "source": {"slot": "source"}
                    },
                    "policies": {"seen": "sum"}
                }]
            }
        ],
        "relationships": [
            {"child": "tags", "parent": "users", "attr": "user_id", "key": [{"get_from_parent": {"path": "id"}}]}
        ]
    }"#;

    #[test]
    fn test_compile_and_run() {
        let doc = MappingDocument::from_json(BLOG).unwrap();
        let (spec, rels) = doc.compile().unwrap();
        assert_eq!(spec.tables(), vec!["users", "tags"]);
        assert_eq!(rels[0].attr, "user_id");

        let data = json!({"users": [
            {"id": 1, "name": "Alice", "tags": ["a", "b", "a"]},
            {"id": 2, "name": "Bob", "tags": []}
        ]});
        let result = run_mapping(&data, &spec).unwrap();

        assert_eq!(result.rows("users").unwrap().len(), 2);
        let tags = result.instances("tags").unwrap();
        assert_eq!(tags.len(), 2);
        let a = &tags[&JoinKey::of("1:a")];
        assert_eq!(a["seen"], json!(2));
        assert_eq!(a["source"], json!("feed"));
    }

    #[test]
    fn test_unknown_relationship_table() {
        let doc: MappingDocument = serde_json::from_value(json!({
            "traversals": [{"path": "a", "emits": [{"kind": "row", "table": "a", "join_on": ["index"]}]}],
            "relationships": [{"child": "a", "parent": "b", "attr": "b_id", "key": [{"get": "b"}]}]
        }))
        .unwrap();
        let err = doc.compile().unwrap_err();
        assert!(err.to_string().contains("unknown table b"));
    }

    #[test]
    fn test_rejects_unknown_transform() {
        let text = r#"{"traversals": [{"emits": [{"kind": "row", "table": "a", "join_on": [{"explode": 1}]}]}]}"#;
        assert!(MappingDocument::from_json(text).is_err());
    }
}
