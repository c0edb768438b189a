//! Change batches staged for one round.

use crate::{RowState, SyncRow, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The rows of one round, grouped per table.
///
/// Row order within a table is preserved; rows of both states may be mixed
/// and are split again by [`ChangeBatch::rows_for`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub tables: BTreeMap<TableName, Vec<SyncRow>>,
}

impl ChangeBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a row under its table.
    pub fn add_row(&mut self, row: SyncRow) {
        self.tables.entry(row.table.clone()).or_default().push(row);
    }

    /// Stage many rows.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = SyncRow>) {
        for row in rows {
            self.add_row(row);
        }
    }

    /// Whether any row is staged.
    pub fn has_data(&self) -> bool {
        self.tables.values().any(|rows| !rows.is_empty())
    }

    /// Rows of one table in one state, in staging order.
    pub fn rows_for(&self, table: &str, state: RowState) -> Vec<SyncRow> {
        self.tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| r.state == state).cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

/// Number of rows selected for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChangesSelected {
    pub table: TableName,
    pub deletes: usize,
    pub upserts: usize,
}

/// Rows selected on one side for a round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseChangesSelected {
    pub table_changes_selected: Vec<TableChangesSelected>,
}

impl DatabaseChangesSelected {
    /// Tally a batch, one entry per table in the batch.
    pub fn from_batch(batch: &ChangeBatch) -> Self {
        let table_changes_selected = batch
            .tables
            .iter()
            .map(|(table, rows)| {
                let deletes = rows.iter().filter(|r| r.is_deleted()).count();
                TableChangesSelected {
                    table: table.clone(),
                    deletes,
                    upserts: rows.len() - deletes,
                }
            })
            .collect();
        Self {
            table_changes_selected,
        }
    }

    pub fn total_changes_selected(&self) -> usize {
        self.table_changes_selected
            .iter()
            .map(|t| t.deletes + t.upserts)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(table: &str, id: i64, deleted: bool) -> SyncRow {
        let values = json!({ "id": id }).as_object().cloned().unwrap();
        if deleted {
            SyncRow::deleted(table, values)
        } else {
            SyncRow::modified(table, values)
        }
    }

    #[test]
    fn empty_batch_has_no_data() {
        let mut batch = ChangeBatch::new();
        assert!(!batch.has_data());
        batch.tables.insert("Category".into(), Vec::new());
        assert!(!batch.has_data());
    }

    #[test]
    fn rows_split_by_state() {
        let mut batch = ChangeBatch::new();
        batch.extend([
            row("Product", 1, false),
            row("Product", 2, true),
            row("Product", 3, false),
            row("Category", 1, true),
        ]);

        assert!(batch.has_data());
        assert_eq!(batch.total_rows(), 4);
        let upserts = batch.rows_for("Product", RowState::Modified);
        assert_eq!(upserts.len(), 2);
        assert_eq!(upserts[0].get("id"), Some(&json!(1)));
        assert_eq!(upserts[1].get("id"), Some(&json!(3)));
        assert_eq!(batch.rows_for("Category", RowState::Modified).len(), 0);
        assert_eq!(batch.rows_for("Missing", RowState::Deleted).len(), 0);

        let selected = DatabaseChangesSelected::from_batch(&batch);
        assert_eq!(selected.total_changes_selected(), 4);

        batch.clear();
        assert!(!batch.has_data());
    }
}
