//! Collect-phase descriptions handed down by the planner.
//!
//! Planning itself is out of scope here; these types carry just enough for
//! the execution core: identity, routing, row granularity and output types.

use std::collections::HashMap;

use harrier_common::types::{DataType, PhaseId, ShardId};

/// Granularity of the rows a phase produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowGranularity {
    Cluster,
    Node,
    Shard,
    Doc,
    Partition,
}

/// Where a phase executes: node id → table fqn → shards on that node.
#[derive(Debug, Clone, Default)]
pub struct Routing {
    locations: HashMap<String, HashMap<String, Vec<ShardId>>>,
}

impl Routing {
    pub fn new(locations: HashMap<String, HashMap<String, Vec<ShardId>>>) -> Self {
        Self { locations }
    }

    /// Routing for a single shard-less table on one node.
    pub fn for_local_table(node_id: impl Into<String>, table_fqn: impl Into<String>) -> Self {
        let mut tables = HashMap::new();
        tables.insert(table_fqn.into(), Vec::new());
        let mut locations = HashMap::new();
        locations.insert(node_id.into(), tables);
        Self { locations }
    }

    pub fn locations(&self) -> &HashMap<String, HashMap<String, Vec<ShardId>>> {
        &self.locations
    }

    pub fn tables_on_node(&self, node_id: &str) -> Option<&HashMap<String, Vec<ShardId>>> {
        self.locations.get(node_id)
    }
}

/// A collect phase routed to specific nodes and shards.
#[derive(Debug, Clone)]
pub struct RoutedCollectPhase {
    pub phase_id: PhaseId,
    pub name: String,
    pub routing: Routing,
    pub max_row_granularity: RowGranularity,
    pub output_types: Vec<DataType>,
    /// The user on whose behalf records are retrieved.
    pub user: String,
}

/// A collect phase without routing (e.g. a table function evaluated
/// wherever the phase happens to run).
#[derive(Debug, Clone)]
pub struct UnroutedCollectPhase {
    pub phase_id: PhaseId,
    pub name: String,
    pub output_types: Vec<DataType>,
}

#[derive(Debug, Clone)]
pub enum CollectPhase {
    Routed(RoutedCollectPhase),
    Unrouted(UnroutedCollectPhase),
}

impl CollectPhase {
    pub fn phase_id(&self) -> PhaseId {
        match self {
            CollectPhase::Routed(p) => p.phase_id,
            CollectPhase::Unrouted(p) => p.phase_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CollectPhase::Routed(p) => &p.name,
            CollectPhase::Unrouted(p) => &p.name,
        }
    }

    pub fn output_types(&self) -> &[DataType] {
        match self {
            CollectPhase::Routed(p) => &p.output_types,
            CollectPhase::Unrouted(p) => &p.output_types,
        }
    }
}
