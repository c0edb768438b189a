//! Row changes and their tracking metadata.

use crate::{ScopeId, TableName, Timestamp};
use serde::{Deserialize, Serialize};

/// Column values of one row, keyed by column name.
pub type RowValues = serde_json::Map<String, serde_json::Value>;

/// State of a changed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RowState {
    /// Inserted or updated
    Modified,
    /// Deleted (a tombstone on the origin side)
    Deleted,
}

impl std::fmt::Display for RowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowState::Modified => write!(f, "Modified"),
            RowState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Identity of a row within its table: the primary key values, in key order,
/// rendered as a compact JSON array.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    pub(crate) fn from_values(values: &[&serde_json::Value]) -> Self {
        let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Self(format!("[{}]", rendered.join(",")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tracking metadata kept for every row a replica has ever held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowMetadata {
    /// Logical timestamp of the last write
    pub timestamp: Timestamp,
    /// Scope that produced the last write; `None` for local writes
    pub update_scope_id: Option<ScopeId>,
    /// Whether the row is currently deleted
    pub is_tombstone: bool,
}

/// One changed row as exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRow {
    /// Table the row belongs to
    pub table: TableName,
    /// Column values; only the primary key columns for deletes
    pub values: RowValues,
    /// Modified or deleted
    pub state: RowState,
    /// Origin logical timestamp of the change; 0 when the origin holds no
    /// tracking entry for the row
    pub timestamp: Timestamp,
    /// Scope that last wrote the row at its origin
    #[serde(default)]
    pub update_scope_id: Option<ScopeId>,
}

impl SyncRow {
    /// A modified row (insert or update).
    pub fn modified(table: impl Into<TableName>, values: RowValues) -> Self {
        Self {
            table: table.into(),
            values,
            state: RowState::Modified,
            timestamp: 0,
            update_scope_id: None,
        }
    }

    /// A deleted row carrying its key values.
    pub fn deleted(table: impl Into<TableName>, values: RowValues) -> Self {
        Self {
            table: table.into(),
            values,
            state: RowState::Deleted,
            timestamp: 0,
            update_scope_id: None,
        }
    }

    /// Builder-style method to set the origin timestamp.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Builder-style method to set the writing scope.
    pub fn from_scope(mut self, scope_id: Option<ScopeId>) -> Self {
        self.update_scope_id = scope_id;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.state == RowState::Deleted
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.values.get(column)
    }
}
