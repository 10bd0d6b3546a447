//! # Ingot - declarative JSON to relational mapping
//!
//! Ingot walks nested JSON with declared traversals, emits rows or
//! builder-managed instances keyed by composite join keys, merges everything
//! emitted for the same key, and then resolves many-to-one relationships
//! between the resulting tables.
//!
//! ## Modules
//!
//! - **traversal**: which nodes of a tree to visit and in what order
//! - **transform**: small functions computing values from a visit
//! - **executor**: runs a mapping over one or more roots
//! - **relationships**: child to parent key resolution and in-memory binding
//! - **sequencer**: dependency-ordered persistence through a [`Session`]
//! - **document**: the JSON form of a mapping, used by `ingot-map`
//!
//! ## Quick Start
//!
//! ```rust
//! use ingot::{get, run_mapping, IterationMode, JoinKey, MappingSpec, RowEmit, TraversalSpec};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let data = json!({
//!     "users": [
//!         {"id": 1, "name": "Alice"},
//!         {"id": 2, "name": "Bob"}
//!     ]
//! });
//!
//! let spec: MappingSpec = MappingSpec::new().traversal(
//!     TraversalSpec::new("users", IterationMode::Elements)
//!         .emit(RowEmit::new("users").join_on(get("id")).field("name", get("name"))),
//! );
//!
//! let result = run_mapping(&data, &spec)?;
//! let users = result.rows("users").unwrap();
//! assert_eq!(users[&JoinKey::of(2)]["name"], json!("Bob"));
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::BufRead;

pub mod builder;
pub mod config;
pub mod context;
pub mod document;
pub mod emit;
pub mod error;
pub mod executor;
pub mod key;
pub mod merge;
pub mod path;
pub mod relationships;
pub mod sequencer;
pub mod session;
pub mod transform;
pub mod traversal;
pub mod writer;

// Re-export commonly used types for convenience
pub use builder::{factory, BuildError, ConstructorBuilder, InstanceBuilder, MapBuilder, Row, SerdeBuilder};
pub use config::{ErrorMode, RunConfig};
pub use context::Context as TraversalContext;
pub use document::MappingDocument;
pub use emit::{Emit, InstanceEmit, RowEmit};
pub use error::{Error, ErrorReport};
pub use executor::{run_mapping, run_mapping_many, MappingResult, MappingSpec, TableOutput};
pub use key::JoinKey;
pub use merge::MergePolicy;
pub use path::{parse_path, PathSegment};
pub use relationships::{bind_many_to_one, compute_relationship_keys, KeyMap, ManyToOneSpec, Record};
pub use sequencer::{flush_order, load, LoadReport};
pub use session::{MemorySession, PersistError, Session};
pub use transform::{
    coalesce, concat, format_id, get, get_from_parent, get_from_root, index, key, len_of, literal, node,
    parent_index, parent_key, slot, transform, Transform,
};
pub use traversal::{traverse, IterationMode, TraversalSpec};
pub use writer::{SingleWriter, TableWriter};

/// Map a stream of newline-delimited JSON roots with `spec`.
///
/// All roots are mapped in one run, so rows from different lines that share
/// a join key are merged.
pub fn map_json<R: BufRead>(
    reader: R,
    spec: &MappingSpec<Row>,
    config: &RunConfig,
) -> Result<MappingResult<Row>> {
    let mut roots = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line")?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).context("Failed to parse JSON")?;
        roots.push(value);
    }

    Ok(run_mapping_many(&roots, spec, config)?)
}
