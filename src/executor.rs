//! Execution loop and join-key merge index
//!
//! Every traversal of a [`MappingSpec`] is walked, and every emission runs once
//! per produced context. Row emissions accumulate into a per-table index keyed
//! by composite join key; instance emissions feed a builder per table, with
//! merge policies resolved against a shadow copy of what was already written.

use crate::builder::{InstanceBuilder, Row};
use crate::config::{ErrorMode, RunConfig};
use crate::context::Context;
use crate::emit::{Emit, InstanceEmit, RowEmit};
use crate::error::{Error, ErrorReport};
use crate::key::JoinKey;
use crate::merge::MergePolicy;
use crate::traversal::{traverse, TraversalSpec};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

/// An ordered list of traversals, reusable across runs
pub struct MappingSpec<I = Row> {
    pub traversals: Vec<TraversalSpec<I>>,
}

impl<I> Default for MappingSpec<I> {
    fn default() -> Self {
        MappingSpec { traversals: Vec::new() }
    }
}

impl<I> std::fmt::Debug for MappingSpec<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingSpec")
            .field("traversals", &self.traversals)
            .finish()
    }
}

impl<I> MappingSpec<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traversal(mut self, traversal: TraversalSpec<I>) -> Self {
        self.traversals.push(traversal);
        self
    }

    /// Every table any emission writes to, in declaration order
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for emit in self.emits() {
            if !tables.iter().any(|t| t == emit.table()) {
                tables.push(emit.table().to_string());
            }
        }
        tables
    }

    pub(crate) fn emits(&self) -> impl Iterator<Item = &Emit<I>> {
        self.traversals.iter().flat_map(|t| t.emits.iter())
    }

    /// Reject specs that write rows and instances into the same table
    pub fn validate(&self) -> Result<(), Error> {
        let mut kinds: IndexMap<&str, bool> = IndexMap::new();
        for emit in self.emits() {
            let is_row = matches!(emit, Emit::Row(_));
            if let Some(seen) = kinds.insert(emit.table(), is_row) {
                if seen != is_row {
                    return Err(Error::TableKindConflict {
                        table: emit.table().to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// One finished output table
#[derive(Debug, Clone, PartialEq)]
pub enum TableOutput<I> {
    Rows(IndexMap<JoinKey, Row>),
    Instances(IndexMap<JoinKey, I>),
}

impl<I> TableOutput<I> {
    pub fn rows(&self) -> Option<&IndexMap<JoinKey, Row>> {
        match self {
            TableOutput::Rows(rows) => Some(rows),
            TableOutput::Instances(_) => None,
        }
    }

    pub fn instances(&self) -> Option<&IndexMap<JoinKey, I>> {
        match self {
            TableOutput::Instances(instances) => Some(instances),
            TableOutput::Rows(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TableOutput::Rows(rows) => rows.len(),
            TableOutput::Instances(instances) => instances.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a run produced: finished tables plus the collected error report
#[derive(Debug, Clone, PartialEq)]
pub struct MappingResult<I = Row> {
    pub tables: IndexMap<String, TableOutput<I>>,
    pub errors: ErrorReport,
}

impl<I> MappingResult<I> {
    pub fn table(&self, name: &str) -> Option<&TableOutput<I>> {
        self.tables.get(name)
    }

    pub fn rows(&self, name: &str) -> Option<&IndexMap<JoinKey, Row>> {
        self.table(name).and_then(TableOutput::rows)
    }

    pub fn instances(&self, name: &str) -> Option<&IndexMap<JoinKey, I>> {
        self.table(name).and_then(TableOutput::instances)
    }
}

/// Run `spec` against a single root with the default configuration
pub fn run_mapping<I>(root: &Value, spec: &MappingSpec<I>) -> Result<MappingResult<I>, Error> {
    run_mapping_many(std::slice::from_ref(root), spec, &RunConfig::default())
}

/// Run `spec` against every root, accumulating into one shared index and
/// builder set.
///
/// In collect mode this only fails on configuration errors; in fail-fast mode
/// the first builder or merge error aborts the run.
pub fn run_mapping_many<I>(
    roots: &[Value],
    spec: &MappingSpec<I>,
    config: &RunConfig,
) -> Result<MappingResult<I>, Error> {
    spec.validate()?;
    let mut executor = Executor::new(spec, config);
    for root in roots {
        executor.run_root(root)?;
    }
    debug!(
        roots = roots.len(),
        contexts = executor.contexts,
        skipped = executor.skipped,
        "mapping pass complete"
    );
    executor.finish()
}

/// Per-table state of an instance emission
struct InstanceTable<I> {
    builder: Box<dyn InstanceBuilder<I>>,
    /// Last value written per key and field, for merge policies
    shadow: IndexMap<JoinKey, Row>,
    policies: IndexMap<String, MergePolicy>,
    error_mode: ErrorMode,
}

struct Executor<'s, I> {
    spec: &'s MappingSpec<I>,
    config: &'s RunConfig,
    rows: IndexMap<String, IndexMap<JoinKey, Row>>,
    instances: IndexMap<String, InstanceTable<I>>,
    errors: ErrorReport,
    contexts: usize,
    skipped: usize,
}

impl<'s, I> Executor<'s, I> {
    fn new(spec: &'s MappingSpec<I>, config: &'s RunConfig) -> Self {
        let mut rows = IndexMap::new();
        let mut instances: IndexMap<String, InstanceTable<I>> = IndexMap::new();
        for emit in spec.emits() {
            match emit {
                Emit::Row(e) => {
                    rows.entry(e.table.clone()).or_insert_with(IndexMap::new);
                }
                Emit::Instance(e) => {
                    let table = instances.entry(e.table.clone()).or_insert_with(|| InstanceTable {
                        builder: (e.builder)(),
                        shadow: IndexMap::new(),
                        policies: IndexMap::new(),
                        error_mode: config.error_mode,
                    });
                    if let Some(mode) = e.error_mode {
                        table.error_mode = mode;
                    }
                    // Declaration order: a later emission's policy for a field wins
                    for (field, policy) in &e.policies {
                        table.policies.insert(field.clone(), policy.clone());
                    }
                }
            }
        }

        Executor {
            spec,
            config,
            rows,
            instances,
            errors: ErrorReport::default(),
            contexts: 0,
            skipped: 0,
        }
    }

    fn run_root(&mut self, root: &Value) -> Result<(), Error> {
        let spec = self.spec;
        for traversal in &spec.traversals {
            for ctx in traverse(root, traversal) {
                self.contexts += 1;
                for emit in &traversal.emits {
                    let Some(key) = JoinKey::compute(emit.join_keys(), &ctx) else {
                        self.skipped += 1;
                        trace!(table = emit.table(), at = %ctx.location(), "join key incomplete, emission skipped");
                        continue;
                    };
                    match emit {
                        Emit::Row(e) => self.emit_row(e, key, &ctx),
                        Emit::Instance(e) => self.emit_instance(e, key, &ctx)?,
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_row(&mut self, emit: &RowEmit, key: JoinKey, ctx: &Context<'_>) {
        let row = self
            .rows
            .entry(emit.table.clone())
            .or_default()
            .entry(key)
            .or_default();
        for field in &emit.fields {
            row.insert(field.name.clone(), (field.transform)(ctx));
        }
    }

    fn emit_instance(&mut self, emit: &InstanceEmit<I>, key: JoinKey, ctx: &Context<'_>) -> Result<(), Error> {
        let mode = emit.error_mode.unwrap_or(self.config.error_mode);
        let table = self
            .instances
            .entry(emit.table.clone())
            .or_insert_with(|| InstanceTable {
                builder: (emit.builder)(),
                shadow: IndexMap::new(),
                policies: IndexMap::new(),
                error_mode: mode,
            });
        let InstanceTable { builder, shadow, policies, .. } = table;

        let seen = shadow.entry(key.clone()).or_default();
        let mut updates = Row::new();
        for spec in &emit.fields {
            let name = match builder.resolve_field_name(&spec.selector) {
                Ok(name) => name,
                Err(err) => {
                    let err = update_error(&emit.table, &key, err.to_string());
                    record(&mut self.errors, mode, err)?;
                    continue;
                }
            };
            let mut value = (spec.transform)(ctx);
            if let Some(policy) = policies.get(&name) {
                value = match policy.merge(seen.get(&name), value) {
                    Ok(merged) => merged,
                    Err(err) => {
                        let err = update_error(&emit.table, &key, err.to_string());
                        record(&mut self.errors, mode, err)?;
                        continue;
                    }
                };
            }
            seen.insert(name.clone(), value.clone());
            updates.insert(name, value);
        }

        if let Err(err) = builder.update(&key, updates) {
            let err = update_error(&emit.table, &key, err.to_string());
            record(&mut self.errors, mode, err)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<MappingResult<I>, Error> {
        let mut tables = IndexMap::new();
        for name in self.spec.tables() {
            if let Some(index) = self.rows.shift_remove(&name) {
                let rows = materialize_rows(index, &self.config.id_field);
                debug!(table = %name, rows = rows.len(), "materialized row table");
                tables.insert(name, TableOutput::Rows(rows));
            } else if let Some(mut table) = self.instances.shift_remove(&name) {
                let mut built = IndexMap::new();
                for (key, outcome) in table.builder.finalize_all() {
                    match outcome {
                        Ok(instance) => {
                            built.insert(key, instance);
                        }
                        Err(errors) => {
                            let err = Error::BuilderFinalize {
                                table: name.clone(),
                                key,
                                messages: errors.iter().map(ToString::to_string).collect(),
                            };
                            record(&mut self.errors, table.error_mode, err)?;
                        }
                    }
                }
                debug!(table = %name, instances = built.len(), "finalized instance table");
                tables.insert(name, TableOutput::Instances(built));
            }
        }

        Ok(MappingResult {
            tables,
            errors: self.errors,
        })
    }
}

/// One row per key; single-component keys inject `id_field` unless set
fn materialize_rows(index: IndexMap<JoinKey, Row>, id_field: &str) -> IndexMap<JoinKey, Row> {
    index
        .into_iter()
        .map(|(key, mut row)| {
            if let Some(id) = key.single() {
                if !row.contains_key(id_field) {
                    row.insert(id_field.to_string(), id.clone());
                }
            }
            (key, row)
        })
        .collect()
}

fn update_error(table: &str, key: &JoinKey, message: String) -> Error {
    Error::BuilderUpdate {
        table: table.to_string(),
        key: key.clone(),
        message,
    }
}

fn record(errors: &mut ErrorReport, mode: ErrorMode, err: Error) -> Result<(), Error> {
    match mode {
        ErrorMode::FailFast => Err(err),
        ErrorMode::Collect => {
            warn!(%err, "collected mapping error");
            errors.push(err);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{factory, BuildError, MapBuilder};
    use crate::transform::{get, get_from_parent, key, literal, parent_key};
    use crate::traversal::IterationMode;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    fn users_spec() -> MappingSpec {
        MappingSpec::new().traversal(
            TraversalSpec::new("users", IterationMode::Elements)
                .emit(RowEmit::new("users").join_on(get("id")).field("name", get("name"))),
        )
    }

    #[test]
    fn test_users_rows() {
        let data = json!({"users": [{"id": 1, "name": "Alice"}, {"id": 2, "name": "Bob"}]});
        let result = run_mapping(&data, &users_spec()).unwrap();

        let users = result.rows("users").unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[&JoinKey::of(1)], row(json!({"name": "Alice", "id": 1})));
        assert_eq!(users[&JoinKey::of(2)], row(json!({"name": "Bob", "id": 2})));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_blank_key_component_skips_row() {
        let data = json!({"users": [
            {"id": 1, "name": "Alice"},
            {"name": "Nobody"},
            {"id": "", "name": "Empty"},
            {"id": null, "name": "Null"}
        ]});
        let result = run_mapping(&data, &users_spec()).unwrap();
        assert_eq!(result.rows("users").unwrap().len(), 1);
    }

    #[test]
    fn test_id_injection_only_for_single_component_keys() {
        let data = json!({"groups": {"g1": [{"uid": "u1"}], "g2": [{"uid": "u1"}]}});
        let spec: MappingSpec = MappingSpec::new().traversal(
            TraversalSpec::new("groups", IterationMode::Items)
                .inner("", IterationMode::Elements)
                .emit(
                    RowEmit::new("memberships")
                        .join_on(parent_key(1))
                        .join_on(get("uid"))
                        .field("group", parent_key(1)),
                )
                .emit(RowEmit::new("explicit").join_on(get("uid")).field("id", literal("custom"))),
        );
        let result = run_mapping(&data, &spec).unwrap();

        let memberships = result.rows("memberships").unwrap();
        assert_eq!(memberships.len(), 2);
        assert!(memberships.values().all(|r| !r.contains_key("id")));

        let explicit = result.rows("explicit").unwrap();
        assert_eq!(explicit[&JoinKey::of("u1")]["id"], json!("custom"));
    }

    #[test]
    fn test_repeated_key_merges_fields_across_traversals() {
        let data = json!({
            "users": [{"id": 1, "name": "Alice"}],
            "emails": {"1": "alice@example.com"}
        });
        let spec: MappingSpec = users_spec().traversal(
            TraversalSpec::new("emails", IterationMode::Items)
                .emit(RowEmit::new("users").join_on(key()).field("email", get(""))),
        );
        let result = run_mapping(&data, &spec).unwrap();
        let users = result.rows("users").unwrap();

        // the email traversal keys by the string "1", the users one by the number 1
        assert_eq!(users.len(), 2);
        assert_eq!(users[&JoinKey::of("1")]["email"], json!("alice@example.com"));
    }

    fn counts_spec(policy: Option<MergePolicy>) -> MappingSpec {
        let mut emit = InstanceEmit::new("user_counts", MapBuilder::factory())
            .join_on(get("uid"))
            .field("uid", get("uid"))
            .field("count", literal(1));
        if let Some(p) = policy {
            emit = emit.policy("count", p);
        }
        MappingSpec::new().traversal(TraversalSpec::new("events", IterationMode::Elements).emit(emit))
    }

    #[test]
    fn test_sum_policy_counts() {
        let data = json!({"events": [{"uid": 1}, {"uid": 1}, {"uid": 2}]});
        let result = run_mapping(&data, &counts_spec(Some(MergePolicy::Sum))).unwrap();
        let counts = result.instances("user_counts").unwrap();

        assert_eq!(counts[&JoinKey::of(1)]["count"], json!(2));
        assert_eq!(counts[&JoinKey::of(2)]["count"], json!(1));
    }

    #[test]
    fn test_no_policy_later_context_wins() {
        let data = json!({"events": [{"uid": 1, "v": "first"}, {"uid": 1, "v": "second"}]});
        let spec: MappingSpec = MappingSpec::new().traversal(
            TraversalSpec::new("events", IterationMode::Elements).emit(
                InstanceEmit::new("latest", MapBuilder::factory())
                    .join_on(get("uid"))
                    .field("v", get("v")),
            ),
        );
        let result = run_mapping(&data, &spec).unwrap();
        assert_eq!(result.instances("latest").unwrap()[&JoinKey::of(1)]["v"], json!("second"));
    }

    #[test]
    fn test_later_declared_policy_wins() {
        let data = json!({"a": [{"uid": 1, "n": 5}], "b": [{"uid": 1, "n": 3}, {"uid": 1, "n": 4}]});
        let emit = |policy| {
            InstanceEmit::new("stats", MapBuilder::factory())
                .join_on(get("uid"))
                .field("n", get("n"))
                .policy("n", policy)
        };
        let spec: MappingSpec = MappingSpec::new()
            .traversal(TraversalSpec::new("a", IterationMode::Elements).emit(emit(MergePolicy::Max)))
            .traversal(TraversalSpec::new("b", IterationMode::Elements).emit(emit(MergePolicy::Sum)));
        let result = run_mapping(&data, &spec).unwrap();

        // 5, then sum(5, 3) = 8, then sum(8, 4) = 12
        assert_eq!(result.instances("stats").unwrap()[&JoinKey::of(1)]["n"], json!(12));
    }

    #[test]
    fn test_later_declared_policy_wins_across_roots() {
        let emit = |policy| {
            InstanceEmit::new("stats", MapBuilder::factory())
                .join_on(get("uid"))
                .field("n", get("n"))
                .policy("n", policy)
        };
        let spec: MappingSpec = MappingSpec::new()
            .traversal(TraversalSpec::new("a", IterationMode::Elements).emit(emit(MergePolicy::Max)))
            .traversal(TraversalSpec::new("b", IterationMode::Elements).emit(emit(MergePolicy::Sum)));
        let roots = vec![
            json!({"a": [{"uid": 1, "n": 5}], "b": [{"uid": 1, "n": 3}]}),
            json!({"a": [{"uid": 1, "n": 1}]}),
        ];
        let result = run_mapping_many(&roots, &spec, &RunConfig::default()).unwrap();

        // the earlier-declared max never takes over: 5 + 3 + 1
        assert_eq!(result.instances("stats").unwrap()[&JoinKey::of(1)]["n"], json!(9));
    }

    fn strict_spec(mode: Option<ErrorMode>) -> MappingSpec {
        let builder = factory(|| MapBuilder::new().with_required(&["name"]));
        let mut emit = InstanceEmit::new("people", builder)
            .join_on(get("id"))
            .field("name", get("name"));
        emit.error_mode = mode;
        MappingSpec::new().traversal(TraversalSpec::new("people", IterationMode::Elements).emit(emit))
    }

    #[test]
    fn test_collect_mode_keeps_good_instances() {
        let data = json!({"people": [{"id": 1, "name": "Ada"}, {"id": 2}]});
        let result = run_mapping(&data, &strict_spec(None)).unwrap();

        assert_eq!(result.instances("people").unwrap().len(), 1);
        let missing = JoinKey::of(2);
        let errors: Vec<_> = result.errors.for_key("people", &missing).collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::BuilderFinalize { .. }));
    }

    #[test]
    fn test_fail_fast_aborts() {
        let data = json!({"people": [{"id": 1, "name": "Ada"}, {"id": 2}]});
        let err = run_mapping(&data, &strict_spec(Some(ErrorMode::FailFast))).unwrap_err();
        assert!(matches!(err, Error::BuilderFinalize { ref table, .. } if table == "people"));

        let config = RunConfig::fail_fast();
        let err = run_mapping_many(std::slice::from_ref(&data), &strict_spec(None), &config).unwrap_err();
        assert_eq!(err.key(), Some(&JoinKey::of(2)));
    }

    #[test]
    fn test_rejected_selector_is_collected() {
        let data = json!({"people": [{"id": 1, "name": "Ada"}]});
        let builder = factory(|| MapBuilder::new().with_allowed(&["name"]));
        let spec: MappingSpec = MappingSpec::new().traversal(
            TraversalSpec::new("people", IterationMode::Elements).emit(
                InstanceEmit::new("people", builder)
                    .join_on(get("id"))
                    .field("name", get("name"))
                    .field("nmae", get("name")),
            ),
        );
        let result = run_mapping(&data, &spec).unwrap();

        assert_eq!(result.instances("people").unwrap()[&JoinKey::of(1)], row(json!({"name": "Ada"})));
        assert!(matches!(result.errors.iter().next(), Some(Error::BuilderUpdate { .. })));
    }

    #[test]
    fn test_policy_type_error_reported_as_update_error() {
        let data = json!({"events": [{"uid": 1}, {"uid": 1}]});
        let spec: MappingSpec = MappingSpec::new().traversal(
            TraversalSpec::new("events", IterationMode::Elements).emit(
                InstanceEmit::new("totals", MapBuilder::factory())
                    .join_on(get("uid"))
                    .field("total", literal("not a number"))
                    .policy("total", MergePolicy::Sum),
            ),
        );
        let result = run_mapping(&data, &spec).unwrap();
        assert_eq!(result.errors.len(), 1);
        let err = result.errors.iter().next().unwrap();
        assert!(err.to_string().contains("sum cannot merge"));
    }

    #[test]
    fn test_multi_root_accumulates() {
        let roots = vec![
            json!({"events": [{"uid": 1}]}),
            json!({"events": [{"uid": 1}, {"uid": 3}]}),
        ];
        let result = run_mapping_many(&roots, &counts_spec(Some(MergePolicy::Sum)), &RunConfig::default()).unwrap();
        let counts = result.instances("user_counts").unwrap();
        assert_eq!(counts[&JoinKey::of(1)]["count"], json!(2));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_table_kind_conflict() {
        let spec: MappingSpec = users_spec().traversal(
            TraversalSpec::new("users", IterationMode::Elements)
                .emit(InstanceEmit::new("users", MapBuilder::factory()).join_on(get("id"))),
        );
        let err = run_mapping(&json!({}), &spec).unwrap_err();
        assert_eq!(err, Error::TableKindConflict { table: "users".into() });
    }

    #[test]
    fn test_declared_tables_present_even_when_empty() {
        let result = run_mapping(&json!({"users": []}), &users_spec()).unwrap();
        assert!(result.table("users").unwrap().is_empty());
    }

    #[test]
    fn test_parent_fields_inside_inner_iteration() {
        let data = json!({"posts_by_user": {"alice": [{"id": "p1"}, {"id": "p2"}]}});
        let spec: MappingSpec = MappingSpec::new().traversal(
            TraversalSpec::new("posts_by_user", IterationMode::Items)
                .inner("", IterationMode::Elements)
                .emit(
                    RowEmit::new("posts")
                        .join_on(get("id"))
                        .field("author", parent_key(1))
                        .field("siblings", crate::transform::len_of(get_from_parent("", 1))),
                ),
        );
        let result = run_mapping(&data, &spec).unwrap();
        let posts = result.rows("posts").unwrap();
        assert_eq!(posts[&JoinKey::of("p2")], row(json!({"author": "alice", "siblings": 2, "id": "p2"})));
    }

    #[test]
    fn test_builder_update_failure_is_collected() {
        struct Picky;
        impl InstanceBuilder<Row> for Picky {
            fn update(&mut self, key: &JoinKey, _updates: Row) -> Result<(), BuildError> {
                Err(BuildError::new(format!("no updates for {}", key)))
            }
            fn finalize_all(&mut self) -> crate::builder::Finalized<Row> {
                IndexMap::new()
            }
        }
        let data = json!({"xs": [{"id": 1}]});
        let spec: MappingSpec = MappingSpec::new().traversal(
            TraversalSpec::new("xs", IterationMode::Elements).emit(
                InstanceEmit::new("xs", factory::<Row, _, _>(|| Picky))
                    .join_on(get("id"))
                    .field("id", get("id")),
            ),
        );
        let result = run_mapping(&data, &spec).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.instances("xs").unwrap().is_empty());
    }
}
