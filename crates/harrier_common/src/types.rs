use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one execution phase within a job. Unique per node and job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseId(pub u32);

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a shard hosting part of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scalar data types supported by the collect core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Text,
    /// Microseconds since the Unix epoch.
    Timestamp,
    Bytea,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Text => "text",
            DataType::Timestamp => "timestamp",
            DataType::Bytea => "bytea",
        };
        write!(f, "{name}")
    }
}

/// Fully qualified name of a relation: `schema.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationName {
    schema: String,
    name: String,
}

impl RelationName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse a fully qualified name. A name without a schema part is placed
    /// in the default `doc` schema.
    pub fn from_fqn(fqn: &str) -> Self {
        match fqn.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("doc", fqn),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fqn(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_name_from_fqn() {
        let rel = RelationName::from_fqn("sys.nodes");
        assert_eq!(rel.schema(), "sys");
        assert_eq!(rel.name(), "nodes");
        assert_eq!(rel.fqn(), "sys.nodes");
    }

    #[test]
    fn test_relation_name_default_schema() {
        let rel = RelationName::from_fqn("users");
        assert_eq!(rel.schema(), "doc");
        assert_eq!(rel.name(), "users");
    }

    #[test]
    fn test_phase_id_display() {
        assert_eq!(PhaseId(7).to_string(), "7");
    }
}
