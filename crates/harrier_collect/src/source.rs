//! Collect sources build the batch iterator a phase reads from.
//!
//! `SystemCollectSource` serves the shard-less catalog tables
//! (`information_schema`, `sys`, `pg_catalog`): records live in memory or
//! behind an async retrieval, and are projected into rows on the fly
//! through the table's reference resolver.

use std::collections::HashMap;
use std::sync::Arc;

use harrier_common::datum::{Datum, OwnedRow};
use harrier_common::error::{HarrierError, HarrierResult};
use harrier_common::future::SharedFuture;
use harrier_common::types::{DataType, RelationName};
use harrier_executor::batch::{BatchIterator, CollectingBatchIterator};

use crate::phase::CollectPhase;
use crate::task::CollectTask;

/// Builds a lazily-producing batch iterator for one collect phase.
/// `support_move_to_start` demands a restartable iterator; sources that
/// cannot naturally rewind must materialize the sequence.
pub trait CollectSource: Send + Sync {
    fn get_iterator(
        &self,
        phase: &CollectPhase,
        task: &CollectTask,
        support_move_to_start: bool,
    ) -> HarrierResult<Box<dyn BatchIterator>>;
}

/// One record of a system table: named fields, projected into a row by the
/// table's reference resolver.
#[derive(Debug, Clone, Default)]
pub struct SysRecord {
    fields: HashMap<String, Datum>,
}

impl SysRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Datum) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.fields.get(name)
    }
}

type RecordRetriever = Arc<dyn Fn(&str) -> SharedFuture<Vec<SysRecord>> + Send + Sync>;
type ReferenceResolver = Arc<dyn Fn(&SysRecord, &str) -> Datum + Send + Sync>;

/// Static definition of one catalog table: its columns, how to retrieve
/// records for a user, and how to resolve a column against a record.
pub struct StaticTableDefinition {
    columns: Vec<(String, DataType)>,
    retriever: RecordRetriever,
    resolver: ReferenceResolver,
}

impl std::fmt::Debug for StaticTableDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTableDefinition")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl StaticTableDefinition {
    pub fn new(columns: Vec<(&str, DataType)>, retriever: RecordRetriever) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, dt)| (name.to_string(), dt))
                .collect(),
            retriever,
            resolver: Arc::new(|record, column| {
                record.get(column).cloned().unwrap_or(Datum::Null)
            }),
        }
    }

    pub fn with_resolver(mut self, resolver: ReferenceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn columns(&self) -> &[(String, DataType)] {
        &self.columns
    }

    pub fn output_types(&self) -> Vec<DataType> {
        self.columns.iter().map(|(_, dt)| dt.clone()).collect()
    }

    /// Retrieve the records visible to `user`. May resolve immediately for
    /// local data or later for a remote call.
    pub fn retrieve_records(&self, user: &str) -> SharedFuture<Vec<SysRecord>> {
        (self.retriever)(user)
    }

    /// Project records into rows, one cell per column in definition order.
    pub fn records_to_rows(&self, records: &[SysRecord]) -> Vec<OwnedRow> {
        records
            .iter()
            .map(|record| {
                OwnedRow::new(
                    self.columns
                        .iter()
                        .map(|(name, _)| (self.resolver)(record, name))
                        .collect(),
                )
            })
            .collect()
    }
}

fn local_records(records: Vec<SysRecord>) -> RecordRetriever {
    Arc::new(move |_user| SharedFuture::completed(records.clone()))
}

/// Serves catalog tables that have no shards. Records are converted
/// on the fly into rows.
pub struct SystemCollectSource {
    local_node_id: String,
    information_schema: HashMap<RelationName, Arc<StaticTableDefinition>>,
    sys: HashMap<RelationName, Arc<StaticTableDefinition>>,
    pg_catalog: HashMap<RelationName, Arc<StaticTableDefinition>>,
}

impl SystemCollectSource {
    pub fn new(local_node_id: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        let local_node_id = local_node_id.into();
        let cluster_name = cluster_name.into();

        let mut sys = HashMap::new();
        sys.insert(
            RelationName::new("sys", "cluster"),
            Arc::new(StaticTableDefinition::new(
                vec![("name", DataType::Text), ("master_node", DataType::Text)],
                local_records(vec![SysRecord::new()
                    .with("name", Datum::Text(cluster_name.clone()))
                    .with("master_node", Datum::Text(local_node_id.clone()))]),
            )),
        );
        sys.insert(
            RelationName::new("sys", "nodes"),
            Arc::new(StaticTableDefinition::new(
                vec![("id", DataType::Text), ("name", DataType::Text)],
                local_records(vec![SysRecord::new()
                    .with("id", Datum::Text(local_node_id.clone()))
                    .with("name", Datum::Text(format!("node-{local_node_id}")))]),
            )),
        );

        let mut information_schema = HashMap::new();
        information_schema.insert(
            RelationName::new("information_schema", "tables"),
            Arc::new(StaticTableDefinition::new(
                vec![("table_schema", DataType::Text), ("table_name", DataType::Text)],
                local_records(vec![
                    SysRecord::new()
                        .with("table_schema", Datum::Text("sys".into()))
                        .with("table_name", Datum::Text("cluster".into())),
                    SysRecord::new()
                        .with("table_schema", Datum::Text("sys".into()))
                        .with("table_name", Datum::Text("nodes".into())),
                    SysRecord::new()
                        .with("table_schema", Datum::Text("information_schema".into()))
                        .with("table_name", Datum::Text("tables".into())),
                    SysRecord::new()
                        .with("table_schema", Datum::Text("pg_catalog".into()))
                        .with("table_name", Datum::Text("pg_type".into())),
                ]),
            )),
        );

        let mut pg_catalog = HashMap::new();
        pg_catalog.insert(
            RelationName::new("pg_catalog", "pg_type"),
            Arc::new(StaticTableDefinition::new(
                vec![("oid", DataType::Int32), ("typname", DataType::Text)],
                local_records(vec![
                    SysRecord::new()
                        .with("oid", Datum::Int32(16))
                        .with("typname", Datum::Text("bool".into())),
                    SysRecord::new()
                        .with("oid", Datum::Int32(20))
                        .with("typname", Datum::Text("int8".into())),
                    SysRecord::new()
                        .with("oid", Datum::Int32(25))
                        .with("typname", Datum::Text("text".into())),
                ]),
            )),
        );

        Self {
            local_node_id,
            information_schema,
            sys,
            pg_catalog,
        }
    }

    /// Register or replace a table definition, e.g. for tests or plug-ins.
    pub fn register(&mut self, relation: RelationName, definition: Arc<StaticTableDefinition>) {
        let registry = match relation.schema() {
            "information_schema" => &mut self.information_schema,
            "sys" => &mut self.sys,
            "pg_catalog" => &mut self.pg_catalog,
            other => {
                tracing::error!(schema = other, "cannot register table in unknown schema");
                return;
            }
        };
        registry.insert(relation, definition);
    }

    /// Resolve a relation to its static definition. Unknown schema and
    /// unknown relation are distinct user errors.
    pub fn table_definition(&self, relation: &RelationName) -> HarrierResult<Arc<StaticTableDefinition>> {
        let registry = match relation.schema() {
            "information_schema" => &self.information_schema,
            "sys" => &self.sys,
            "pg_catalog" => &self.pg_catalog,
            other => return Err(HarrierError::SchemaUnknown(other.to_string())),
        };
        registry
            .get(relation)
            .cloned()
            .ok_or_else(|| HarrierError::RelationUnknown(relation.fqn()))
    }
}

impl CollectSource for SystemCollectSource {
    /// Kill is a no-op at this layer: either the records are already local
    /// (the wrapping iterator handles cancellation) or the retrieval is a
    /// remote call that cannot be interrupted.
    fn get_iterator(
        &self,
        phase: &CollectPhase,
        task: &CollectTask,
        _support_move_to_start: bool,
    ) -> HarrierResult<Box<dyn BatchIterator>> {
        let CollectPhase::Routed(routed) = phase else {
            return Err(HarrierError::Internal(
                "system collect requires a routed phase".into(),
            ));
        };
        let tables = routed
            .routing
            .tables_on_node(&self.local_node_id)
            .ok_or_else(|| {
                HarrierError::Internal(format!(
                    "phase {} is not routed to node {}",
                    routed.phase_id, self.local_node_id
                ))
            })?;
        let mut names = tables.keys();
        let (Some(table), None) = (names.next(), names.next()) else {
            return Err(HarrierError::Internal(format!(
                "system collect expects exactly one table on node {}, got {}",
                self.local_node_id,
                tables.len()
            )));
        };
        let relation = RelationName::from_fqn(table);
        let definition = self.table_definition(&relation)?;

        let ram = Arc::clone(task.ram_accounting());
        let user = routed.user.clone();
        let loader = Box::new(move || {
            let rows_future: SharedFuture<Vec<OwnedRow>> = SharedFuture::new();
            let resolved = rows_future.clone();
            let records_future = definition.retrieve_records(&user);
            records_future.on_done(move |result| match result {
                    Ok(records) => {
                        let rows = definition.records_to_rows(records);
                        for row in &rows {
                            if let Err(e) = ram.record(row.size_bytes()) {
                                resolved.fail(e);
                                return;
                            }
                        }
                        resolved.complete(rows);
                    }
                    Err(e) => {
                        resolved.fail(e.clone());
                    }
                });
            rows_future
        });
        Ok(Box::new(CollectingBatchIterator::new(loader)))
    }
}
