//! Capability interfaces a backend implements to take part in a round.

use crate::{error::Result, ScopeId, ScopeInfo, SyncRow, TableDescription, Timestamp};
use async_trait::async_trait;

/// Outcome of one conditional row write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWrite {
    /// The row was written, or already held exactly this change
    Applied,
    /// The optimistic check failed or there was nothing to delete
    NotApplied,
    /// The write would break a unique constraint
    ConstraintViolation(String),
}

impl RowWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, RowWrite::Applied)
    }
}

/// A change tracking store the engine reads deltas from and writes rows to.
///
/// All calls between `begin_transaction` and `commit_transaction` belong to
/// one transaction; `rollback_transaction` discards every write since
/// `begin_transaction`.
#[async_trait]
pub trait SyncAdapter: Send {
    /// Short name used in logs.
    fn provider_name(&self) -> &str;

    /// Whether `apply_bulk` is a native batch write.
    fn supports_bulk_operations(&self) -> bool {
        false
    }

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit_transaction(&mut self) -> Result<()>;

    async fn rollback_transaction(&mut self) -> Result<()>;

    /// Current value of the store's logical clock.
    async fn current_timestamp(&mut self) -> Result<Timestamp>;

    /// Rows of `table` whose tracking timestamp is greater than `since`,
    /// leaving out rows last written by `excluded_scope`.
    ///
    /// Modified rows carry every column; deleted rows carry their key.
    async fn get_changes(
        &mut self,
        table: &TableDescription,
        since: Timestamp,
        excluded_scope: Option<ScopeId>,
    ) -> Result<Vec<SyncRow>>;

    /// Write one row if its tracking timestamp is at most `reference`, or
    /// unconditionally when `force` is set. A successful write records
    /// `scope_id` as the row's last writer.
    async fn apply_row(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
        scope_id: ScopeId,
        reference: Timestamp,
        force: bool,
    ) -> Result<RowWrite>;

    /// Conditionally write many rows of one state. Returns one outcome per
    /// row, in order.
    async fn apply_bulk(
        &mut self,
        table: &TableDescription,
        rows: &[SyncRow],
        scope_id: ScopeId,
        reference: Timestamp,
    ) -> Result<Vec<RowWrite>> {
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(self.apply_row(table, row, scope_id, reference, false).await?);
        }
        Ok(outcomes)
    }

    /// The locally stored version of the row `row` identifies.
    ///
    /// A row still in the table comes back `Modified`; a row only known
    /// through its tombstone comes back `Deleted`; an unknown row is `None`.
    async fn get_conflict_candidate(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
    ) -> Result<Option<SyncRow>>;

    /// Rewrite the tracking entry of a row with a fresh timestamp and the
    /// given last writer. Returns false if the row has no tracking entry.
    async fn update_metadata(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
        scope_id: Option<ScopeId>,
    ) -> Result<bool>;

    /// Remove every row and tracking entry of a table.
    async fn reset_table(&mut self, table: &TableDescription) -> Result<()>;

    /// Purge the tombstones of `table` written at or before `up_to`.
    /// Returns how many tracking entries were removed.
    async fn delete_metadata(&mut self, table: &TableDescription, up_to: Timestamp) -> Result<usize>;

    async fn disable_constraints(&mut self) -> Result<()>;

    async fn enable_constraints(&mut self) -> Result<()>;
}

/// Persistence for [`ScopeInfo`] records.
#[async_trait]
pub trait ScopeRegistry: Send {
    async fn load_scope(&mut self, name: &str) -> Result<Option<ScopeInfo>>;

    async fn save_scope(&mut self, scope: &ScopeInfo) -> Result<()>;
}
