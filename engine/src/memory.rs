//! In-memory change tracking store.
//!
//! [`MemoryStore`] keeps table rows next to a tracking entry per row, the way
//! a database with change tracking triggers would. Every write, local or
//! applied by a round, takes a fresh value from the store's logical clock.
//! Deleted rows leave a tombstone in the tracking table.
//!
//! A transaction is a snapshot of the whole state, restored on rollback.
//! Scope records live in the same state, so a scope saved inside a round is
//! discarded together with the round's writes.

use crate::{
    adapter::{RowWrite, ScopeRegistry, SyncAdapter},
    error::Result,
    row::{RowKey, RowMetadata},
    Error, LogicalClock, RowState, RowValues, ScopeId, ScopeInfo, SyncRow, SyncSchema,
    TableDescription, TableName, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Kind of a recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteKind {
    Upsert,
    Delete,
    Reset,
}

/// One physical write made to the store, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteEvent {
    pub table: TableName,
    /// Affected row; `None` for a table reset
    pub key: Option<RowKey>,
    pub kind: WriteKind,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackingEntry {
    key_values: RowValues,
    metadata: RowMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryTable {
    rows: BTreeMap<RowKey, RowValues>,
    tracking: BTreeMap<RowKey, TrackingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct State {
    tables: HashMap<TableName, MemoryTable>,
    clock: LogicalClock,
    constraints_enabled: bool,
    scopes: HashMap<String, ScopeInfo>,
    write_log: Vec<WriteEvent>,
}

/// A replica held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    schema: SyncSchema,
    state: State,
    /// State at `begin_transaction`, while a transaction is open
    snapshot: Option<State>,
    bulk_operations: bool,
}

impl MemoryStore {
    /// Create an empty store holding the tables of `schema`.
    pub fn new(name: impl Into<String>, schema: SyncSchema) -> Self {
        let tables = schema
            .tables
            .iter()
            .map(|t| (t.name.clone(), MemoryTable::default()))
            .collect();
        Self {
            name: name.into(),
            schema,
            state: State {
                tables,
                clock: LogicalClock::new(),
                constraints_enabled: true,
                scopes: HashMap::new(),
                write_log: Vec::new(),
            },
            snapshot: None,
            bulk_operations: true,
        }
    }

    /// Builder-style method to toggle native bulk writes.
    pub fn with_bulk_operations(mut self, enabled: bool) -> Self {
        self.bulk_operations = enabled;
        self
    }

    pub fn schema(&self) -> &SyncSchema {
        &self.schema
    }

    pub fn clock(&self) -> LogicalClock {
        self.state.clock
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn constraints_enabled(&self) -> bool {
        self.state.constraints_enabled
    }

    /// Every write made so far, oldest first.
    pub fn write_log(&self) -> &[WriteEvent] {
        &self.state.write_log
    }

    /// Insert or update a row as the application would, outside any round.
    ///
    /// Constraint violations are errors here; there is nobody to resolve them.
    pub fn upsert(&mut self, table: &str, values: RowValues) -> Result<Timestamp> {
        let desc = self.schema.table(table)?.clone();
        desc.validate_row(&values)?;
        let key = desc.row_key(&values)?;
        if let Some(message) = self.unique_violation(&desc, &key, &values) {
            return Err(Error::ConstraintViolation {
                table: desc.name.clone(),
                message,
            });
        }
        self.check_parents(&desc, &values)?;
        Ok(self.write_upsert(&desc, key, values, None))
    }

    /// Delete a row as the application would. Returns false if it was absent.
    pub fn delete(&mut self, table: &str, key_values: RowValues) -> Result<bool> {
        let desc = self.schema.table(table)?.clone();
        let key = desc.row_key(&key_values)?;
        let Some(values) = self.table(&desc.name)?.rows.get(&key).cloned() else {
            return Ok(false);
        };
        self.check_children(&desc, &values)?;
        self.write_delete(&desc, key, None);
        Ok(true)
    }

    /// Current values of a row.
    pub fn get(&self, table: &str, key_values: &RowValues) -> Option<&RowValues> {
        let desc = self.schema.get_table(table)?;
        let key = desc.row_key(key_values).ok()?;
        self.state.tables.get(table)?.rows.get(&key)
    }

    /// All live rows of a table, in key order.
    pub fn rows(&self, table: &str) -> Vec<&RowValues> {
        self.state
            .tables
            .get(table)
            .map(|t| t.rows.values().collect())
            .unwrap_or_default()
    }

    /// Tracking metadata of a row, including tombstones.
    pub fn metadata(&self, table: &str, key_values: &RowValues) -> Option<RowMetadata> {
        let desc = self.schema.get_table(table)?;
        let key = desc.row_key(key_values).ok()?;
        self.state
            .tables
            .get(table)?
            .tracking
            .get(&key)
            .map(|e| e.metadata)
    }

    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.state
            .tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.state
            .tables
            .get_mut(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn write_upsert(
        &mut self,
        desc: &TableDescription,
        key: RowKey,
        values: RowValues,
        scope_id: Option<ScopeId>,
    ) -> Timestamp {
        let timestamp = self.state.clock.tick();
        let key_values = desc.key_values(&values);
        let table = self.state.tables.entry(desc.name.clone()).or_default();
        table.rows.insert(key.clone(), values);
        table.tracking.insert(
            key.clone(),
            TrackingEntry {
                key_values,
                metadata: RowMetadata {
                    timestamp,
                    update_scope_id: scope_id,
                    is_tombstone: false,
                },
            },
        );
        self.log(desc, Some(key), WriteKind::Upsert, timestamp);
        timestamp
    }

    fn write_delete(&mut self, desc: &TableDescription, key: RowKey, scope_id: Option<ScopeId>) {
        let timestamp = self.state.clock.tick();
        let table = self.state.tables.entry(desc.name.clone()).or_default();
        let removed = table.rows.remove(&key);
        let key_values = match (table.tracking.get(&key), removed) {
            (Some(entry), _) => entry.key_values.clone(),
            (None, Some(values)) => desc.key_values(&values),
            (None, None) => RowValues::new(),
        };
        table.tracking.insert(
            key.clone(),
            TrackingEntry {
                key_values,
                metadata: RowMetadata {
                    timestamp,
                    update_scope_id: scope_id,
                    is_tombstone: true,
                },
            },
        );
        self.log(desc, Some(key), WriteKind::Delete, timestamp);
    }

    fn log(&mut self, desc: &TableDescription, key: Option<RowKey>, kind: WriteKind, ts: Timestamp) {
        trace!(store = %self.name, table = %desc.name, ?kind, ts, "write");
        self.state.write_log.push(WriteEvent {
            table: desc.name.clone(),
            key,
            kind,
            timestamp: ts,
        });
    }

    /// A message describing the first unique column `values` would duplicate.
    fn unique_violation(
        &self,
        desc: &TableDescription,
        key: &RowKey,
        values: &RowValues,
    ) -> Option<String> {
        let table = self.state.tables.get(&desc.name)?;
        for column in desc.unique_columns() {
            let Some(value) = values.get(&column.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let duplicate = table
                .rows
                .iter()
                .any(|(k, row)| k != key && row.get(&column.name) == Some(value));
            if duplicate {
                return Some(format!(
                    "duplicate value {} for unique column '{}'",
                    value, column.name
                ));
            }
        }
        None
    }

    /// Referenced parent rows must exist while constraints are enabled.
    fn check_parents(&self, desc: &TableDescription, values: &RowValues) -> Result<()> {
        if !self.state.constraints_enabled {
            return Ok(());
        }
        for fk in &desc.foreign_keys {
            let Some(value) = values.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let found = self
                .state
                .tables
                .get(&fk.parent_table)
                .map(|parent| {
                    parent
                        .rows
                        .values()
                        .any(|row| row.get(&fk.parent_column) == Some(value))
                })
                .unwrap_or(false);
            if !found {
                return Err(Error::ConstraintViolation {
                    table: desc.name.clone(),
                    message: format!(
                        "'{}' = {} has no matching row in '{}'",
                        fk.column, value, fk.parent_table
                    ),
                });
            }
        }
        Ok(())
    }

    /// A row may not be deleted while another row references it.
    fn check_children(&self, desc: &TableDescription, values: &RowValues) -> Result<()> {
        if !self.state.constraints_enabled {
            return Ok(());
        }
        for child in &self.schema.tables {
            for fk in child.foreign_keys.iter().filter(|fk| fk.parent_table == desc.name) {
                let Some(value) = values.get(&fk.parent_column) else {
                    continue;
                };
                let referenced = self
                    .state
                    .tables
                    .get(&child.name)
                    .map(|rows| {
                        rows.rows
                            .values()
                            .any(|row| row.get(&fk.column) == Some(value))
                    })
                    .unwrap_or(false);
                if referenced {
                    return Err(Error::ConstraintViolation {
                        table: desc.name.clone(),
                        message: format!(
                            "row is still referenced by '{}'.'{}'",
                            child.name, fk.column
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn write_row(
        &mut self,
        desc: &TableDescription,
        row: &SyncRow,
        scope_id: ScopeId,
        reference: Timestamp,
        force: bool,
    ) -> Result<RowWrite> {
        let key = desc.row_key(&row.values)?;
        let table = self.table(&desc.name)?;
        let tracking = table.tracking.get(&key).map(|e| e.metadata);
        let same_scope = tracking.is_some_and(|m| m.update_scope_id == Some(scope_id));

        let permitted = force
            || match tracking {
                None => true,
                Some(m) => m.timestamp <= reference || same_scope,
            };
        if !permitted {
            return Ok(RowWrite::NotApplied);
        }

        match row.state {
            RowState::Modified => {
                desc.validate_row(&row.values)?;
                let unchanged = table.rows.get(&key) == Some(&row.values);
                if same_scope && unchanged {
                    return Ok(RowWrite::Applied);
                }
                if let Some(message) = self.unique_violation(desc, &key, &row.values) {
                    return Ok(RowWrite::ConstraintViolation(message));
                }
                self.check_parents(desc, &row.values)?;
                self.write_upsert(desc, key, row.values.clone(), Some(scope_id));
                Ok(RowWrite::Applied)
            }
            RowState::Deleted => {
                let Some(values) = table.rows.get(&key).cloned() else {
                    let already_deleted = same_scope && tracking.is_some_and(|m| m.is_tombstone);
                    return Ok(if already_deleted {
                        RowWrite::Applied
                    } else {
                        RowWrite::NotApplied
                    });
                };
                self.check_children(desc, &values)?;
                self.write_delete(desc, key, Some(scope_id));
                Ok(RowWrite::Applied)
            }
        }
    }
}

#[async_trait]
impl SyncAdapter for MemoryStore {
    fn provider_name(&self) -> &str {
        "memory"
    }

    fn supports_bulk_operations(&self) -> bool {
        self.bulk_operations
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(Error::Transaction(format!(
                "store '{}' already has an open transaction",
                self.name
            )));
        }
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::Transaction("no open transaction to commit".into()))
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction to roll back".into()))?;
        self.state = snapshot;
        Ok(())
    }

    async fn current_timestamp(&mut self) -> Result<Timestamp> {
        Ok(self.state.clock.current())
    }

    async fn get_changes(
        &mut self,
        table: &TableDescription,
        since: Timestamp,
        excluded_scope: Option<ScopeId>,
    ) -> Result<Vec<SyncRow>> {
        let stored = self.table(&table.name)?;
        let mut changes: Vec<SyncRow> = stored
            .tracking
            .iter()
            .filter(|(_, entry)| entry.metadata.timestamp > since)
            .filter(|(_, entry)| {
                excluded_scope.is_none() || entry.metadata.update_scope_id != excluded_scope
            })
            .filter_map(|(key, entry)| {
                let row = if entry.metadata.is_tombstone {
                    SyncRow::deleted(table.name.clone(), entry.key_values.clone())
                } else {
                    SyncRow::modified(table.name.clone(), stored.rows.get(key)?.clone())
                };
                Some(
                    row.at(entry.metadata.timestamp)
                        .from_scope(entry.metadata.update_scope_id),
                )
            })
            .collect();
        changes.sort_by_key(|r| r.timestamp);
        Ok(changes)
    }

    async fn apply_row(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
        scope_id: ScopeId,
        reference: Timestamp,
        force: bool,
    ) -> Result<RowWrite> {
        self.write_row(table, row, scope_id, reference, force)
    }

    async fn apply_bulk(
        &mut self,
        table: &TableDescription,
        rows: &[SyncRow],
        scope_id: ScopeId,
        reference: Timestamp,
    ) -> Result<Vec<RowWrite>> {
        rows.iter()
            .map(|row| self.write_row(table, row, scope_id, reference, false))
            .collect()
    }

    async fn get_conflict_candidate(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
    ) -> Result<Option<SyncRow>> {
        let key = table.row_key(&row.values)?;
        let stored = self.table(&table.name)?;
        let Some(entry) = stored.tracking.get(&key) else {
            return Ok(stored
                .rows
                .get(&key)
                .map(|values| SyncRow::modified(table.name.clone(), values.clone())));
        };
        let candidate = match stored.rows.get(&key) {
            Some(values) => SyncRow::modified(table.name.clone(), values.clone()),
            None if entry.metadata.is_tombstone => {
                SyncRow::deleted(table.name.clone(), entry.key_values.clone())
            }
            None => return Ok(None),
        };
        Ok(Some(
            candidate
                .at(entry.metadata.timestamp)
                .from_scope(entry.metadata.update_scope_id),
        ))
    }

    async fn update_metadata(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
        scope_id: Option<ScopeId>,
    ) -> Result<bool> {
        let key = table.row_key(&row.values)?;
        if !self.table(&table.name)?.tracking.contains_key(&key) {
            return Ok(false);
        }
        let timestamp = self.state.clock.tick();
        if let Some(entry) = self.table_mut(&table.name)?.tracking.get_mut(&key) {
            entry.metadata.timestamp = timestamp;
            entry.metadata.update_scope_id = scope_id;
        }
        Ok(true)
    }

    async fn reset_table(&mut self, table: &TableDescription) -> Result<()> {
        let stored = self.table_mut(&table.name)?;
        stored.rows.clear();
        stored.tracking.clear();
        let timestamp = self.state.clock.current();
        self.log(table, None, WriteKind::Reset, timestamp);
        Ok(())
    }

    async fn delete_metadata(&mut self, table: &TableDescription, up_to: Timestamp) -> Result<usize> {
        let stored = self.table_mut(&table.name)?;
        let before = stored.tracking.len();
        stored
            .tracking
            .retain(|_, entry| !(entry.metadata.is_tombstone && entry.metadata.timestamp <= up_to));
        let purged = before - stored.tracking.len();
        trace!(table = %table.name, up_to, purged, "tombstones purged");
        Ok(purged)
    }

    async fn disable_constraints(&mut self) -> Result<()> {
        self.state.constraints_enabled = false;
        Ok(())
    }

    async fn enable_constraints(&mut self) -> Result<()> {
        self.state.constraints_enabled = true;
        Ok(())
    }
}

#[async_trait]
impl ScopeRegistry for MemoryStore {
    async fn load_scope(&mut self, name: &str) -> Result<Option<ScopeInfo>> {
        Ok(self.state.scopes.get(name).cloned())
    }

    async fn save_scope(&mut self, scope: &ScopeInfo) -> Result<()> {
        self.state.scopes.insert(scope.name.clone(), scope.clone());
        Ok(())
    }
}
