//! The change-application round.
//!
//! A round writes one batch to one side, inside a transaction the caller
//! opened:
//!
//! 1. A batch without rows is a no-op.
//! 2. A download in a reinitialize mode first empties the local tables.
//! 3. Deletes are applied walking the tables backwards, unless the target
//!    side is new and cannot hold anything to delete.
//! 4. Inserts and updates are applied walking the tables forwards.
//!
//! Any rollback requested while resolving a conflict aborts the round with
//! an error; the caller rolls the transaction back.

use crate::{
    adapter::{RowWrite, SyncAdapter},
    conflict::{classify, ConflictFacts},
    error::Result,
    interceptor::{
        DatabaseChangesAppliedArgs, DatabaseChangesApplyingArgs, TableChangesAppliedArgs,
        TableChangesApplyingArgs,
    },
    resolver::{ConflictResolver, Resolution},
    ChangeBatch, Conflict, ConflictResolutionPolicy, Interceptors, RowState, ScopeId,
    SyncContext, SyncRow, SyncSchema, SyncStage, SyncType, SyncWay, TableDescription,
    TableName, Timestamp,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Everything a round needs besides the adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyChangesMessage {
    /// Tables in dependency order
    pub schema: SyncSchema,
    pub changes: ChangeBatch,
    /// Scope whose changes are applied, recorded as the rows' last writer
    pub applying_scope_id: ScopeId,
    /// Stored rows newer than this are in conflict
    pub reference_timestamp: Timestamp,
    pub policy: ConflictResolutionPolicy,
    /// The target side holds no synced data yet
    pub is_new: bool,
    pub disable_constraints_on_apply_changes: bool,
    pub use_bulk_operations: bool,
}

/// Rows applied and failed for one table and one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChangesApplied {
    pub table: TableName,
    pub state: RowState,
    pub applied: usize,
    pub failed: usize,
}

/// Outcome of a round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseChangesApplied {
    pub table_changes_applied: Vec<TableChangesApplied>,
    /// Every conflict raised during the round, as resolved
    pub conflicts: Vec<Conflict>,
}

impl DatabaseChangesApplied {
    pub fn total_applied_changes(&self) -> usize {
        self.table_changes_applied.iter().map(|t| t.applied).sum()
    }

    pub fn total_applied_changes_failed(&self) -> usize {
        self.table_changes_applied.iter().map(|t| t.failed).sum()
    }

    /// Counts for one table and state.
    pub fn get(&self, table: &str, state: RowState) -> Option<&TableChangesApplied> {
        self.table_changes_applied
            .iter()
            .find(|t| t.table == table && t.state == state)
    }

    fn record(&mut self, table: &str, state: RowState, applied: usize, failed: usize) -> TableChangesApplied {
        let index = match self
            .table_changes_applied
            .iter()
            .position(|t| t.table == table && t.state == state)
        {
            Some(index) => index,
            None => {
                self.table_changes_applied.push(TableChangesApplied {
                    table: table.to_string(),
                    state,
                    applied: 0,
                    failed: 0,
                });
                self.table_changes_applied.len() - 1
            }
        };
        let entry = &mut self.table_changes_applied[index];
        entry.applied += applied;
        entry.failed += failed;
        entry.clone()
    }
}

/// Applies a batch to one side through its adapter.
pub struct ChangeApplier<'a, A: SyncAdapter + ?Sized> {
    adapter: &'a mut A,
    interceptors: &'a Interceptors,
}

impl<'a, A: SyncAdapter + ?Sized> ChangeApplier<'a, A> {
    pub fn new(adapter: &'a mut A, interceptors: &'a Interceptors) -> Self {
        Self {
            adapter,
            interceptors,
        }
    }

    /// Run one round. The batch is cleared once every row was handled.
    ///
    /// Errors carry the stage the round had reached.
    pub async fn apply_changes(
        &mut self,
        mut context: SyncContext,
        message: &mut ApplyChangesMessage,
    ) -> Result<(SyncContext, DatabaseChangesApplied)> {
        let mut applied = DatabaseChangesApplied::default();
        if !message.changes.has_data() {
            return Ok((context, applied));
        }

        match self.run(&mut context, message, &mut applied).await {
            Ok(()) => Ok((context, applied)),
            Err(e) => Err(e.at_stage(context.stage)),
        }
    }

    async fn run(
        &mut self,
        context: &mut SyncContext,
        message: &mut ApplyChangesMessage,
        applied: &mut DatabaseChangesApplied,
    ) -> Result<()> {
        context.stage = SyncStage::DatabaseChangesApplying;
        info!(
            provider = self.adapter.provider_name(),
            sync_way = ?context.sync_way,
            rows = message.changes.total_rows(),
            "applying changes"
        );
        self.interceptors
            .database_changes_applying
            .fire(&DatabaseChangesApplyingArgs {
                context: context.clone(),
                rows: message.changes.total_rows(),
            });

        if message.disable_constraints_on_apply_changes {
            self.adapter.disable_constraints().await?;
        }

        if context.sync_way == SyncWay::Download && context.sync_type != SyncType::Normal {
            for table in message.schema.tables.iter().rev() {
                if table.sync_direction.allows(SyncWay::Download) {
                    debug!(table = %table.name, "resetting table");
                    self.adapter.reset_table(table).await?;
                }
            }
        }

        if !message.is_new {
            for table in message.schema.tables.iter().rev() {
                self.apply_table(context, message, table, RowState::Deleted, applied)
                    .await?;
            }
        }

        for table in &message.schema.tables {
            self.apply_table(context, message, table, RowState::Modified, applied)
                .await?;
        }

        context.stage = SyncStage::DatabaseChangesApplied;
        self.interceptors
            .database_changes_applied
            .fire(&DatabaseChangesAppliedArgs {
                context: context.clone(),
                applied: applied.clone(),
            });

        if message.disable_constraints_on_apply_changes {
            self.adapter.enable_constraints().await?;
        }

        info!(
            applied = applied.total_applied_changes(),
            failed = applied.total_applied_changes_failed(),
            conflicts = applied.conflicts.len(),
            "changes applied"
        );
        message.changes.clear();
        Ok(())
    }

    async fn apply_table(
        &mut self,
        context: &mut SyncContext,
        message: &ApplyChangesMessage,
        table: &TableDescription,
        state: RowState,
        applied: &mut DatabaseChangesApplied,
    ) -> Result<()> {
        if !table.sync_direction.allows(context.sync_way) {
            return Ok(());
        }
        let rows = message.changes.rows_for(&table.name, state);
        if rows.is_empty() {
            return Ok(());
        }

        context.stage = SyncStage::TableChangesApplying;
        self.interceptors
            .table_changes_applying
            .fire(&TableChangesApplyingArgs {
                table: table.name.clone(),
                state,
                sync_way: context.sync_way,
                rows: rows.len(),
            });

        let outcomes = if message.use_bulk_operations && self.adapter.supports_bulk_operations() {
            self.adapter
                .apply_bulk(
                    table,
                    &rows,
                    message.applying_scope_id,
                    message.reference_timestamp,
                )
                .await?
        } else {
            let mut outcomes = Vec::with_capacity(rows.len());
            for row in &rows {
                outcomes.push(
                    self.adapter
                        .apply_row(
                            table,
                            row,
                            message.applying_scope_id,
                            message.reference_timestamp,
                            false,
                        )
                        .await?,
                );
            }
            outcomes
        };

        let mut rows_applied = outcomes.iter().filter(|o| o.is_applied()).count();
        let mut conflicts = Vec::new();
        for (row, outcome) in rows.iter().zip(&outcomes) {
            if !outcome.is_applied() {
                conflicts.push(self.build_conflict(table, row, outcome, message).await?);
            }
        }
        debug!(
            table = %table.name,
            %state,
            rows = rows.len(),
            applied = rows_applied,
            conflicts = conflicts.len(),
            "table batch written"
        );

        let mut resolver = ConflictResolver::new(
            &mut *self.adapter,
            self.interceptors,
            table,
            message.applying_scope_id,
            message.reference_timestamp,
        );
        for mut conflict in conflicts {
            let resolution = resolver.resolve(context, &mut conflict).await?;
            applied.conflicts.push(conflict);
            match resolution {
                Resolution::Resolved {
                    rows_applied: resolved_rows,
                    conflicts_resolved,
                } => {
                    rows_applied += resolved_rows;
                    context.total_sync_conflicts += conflicts_resolved;
                }
                Resolution::Rollback(error) => {
                    warn!(table = %table.name, %state, %error, "rolling back round");
                    return Err(error);
                }
            }
        }

        let failed = rows.len().saturating_sub(rows_applied);
        let summary = applied.record(&table.name, state, rows_applied, failed);

        context.stage = SyncStage::TableChangesApplied;
        self.interceptors
            .table_changes_applied
            .fire(&TableChangesAppliedArgs {
                sync_way: context.sync_way,
                applied: summary,
            });
        Ok(())
    }

    async fn build_conflict(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
        outcome: &RowWrite,
        message: &ApplyChangesMessage,
    ) -> Result<Conflict> {
        let local_row = self.adapter.get_conflict_candidate(table, row).await?;
        let constraint_error = match outcome {
            RowWrite::ConstraintViolation(message) => Some(message.clone()),
            _ => None,
        };
        let facts = ConflictFacts {
            local_exists: local_row.as_ref().is_some_and(|r| !r.is_deleted()),
            local_tombstoned: local_row.as_ref().is_some_and(SyncRow::is_deleted),
            remote_exists: !row.is_deleted(),
            // a delete without origin tracking lost its tombstone to a cleanup
            remote_tombstoned: row.is_deleted() && row.timestamp > 0,
            constraint_violation: constraint_error.is_some(),
        };

        Ok(Conflict {
            table: table.name.clone(),
            kind: classify(facts),
            local_row,
            remote_row: Some(row.clone()),
            policy: message.policy,
            applying_scope_id: message.applying_scope_id,
            error_message: constraint_error,
        })
    }
}
