//! Conflict resolution.
//!
//! The policy picks a resolution, apply-changes-failed interceptors may
//! replace it, and the resolution maps onto one of three actions. Only the
//! action and the conflict kind decide what gets written.

use crate::{
    adapter::{RowWrite, SyncAdapter},
    error::Result,
    interceptor::ApplyChangesFailedArgs,
    ApplyAction, Conflict, ConflictResolution, ConflictType, Error, Interceptors, RowState,
    ScopeId, SyncContext, SyncRow, TableDescription, Timestamp,
};
use tracing::{debug, warn};

/// Error text recorded on a conflict that rolled the round back.
pub const ROLLBACK_MESSAGE: &str = "Rollback action taken on conflict";

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved {
        /// Added to the table's applied count
        rows_applied: usize,
        /// Added to the round's conflict counter
        conflicts_resolved: usize,
    },
    /// The round must be aborted with this error
    Rollback(Error),
}

impl Resolution {
    fn resolved(rows_applied: usize, conflicts_resolved: usize) -> Self {
        Resolution::Resolved {
            rows_applied,
            conflicts_resolved,
        }
    }
}

/// Resolves conflicts raised while applying one table.
pub struct ConflictResolver<'a, A: SyncAdapter + ?Sized> {
    adapter: &'a mut A,
    interceptors: &'a Interceptors,
    table: &'a TableDescription,
    applying_scope_id: ScopeId,
    reference_timestamp: Timestamp,
}

impl<'a, A: SyncAdapter + ?Sized> ConflictResolver<'a, A> {
    pub fn new(
        adapter: &'a mut A,
        interceptors: &'a Interceptors,
        table: &'a TableDescription,
        applying_scope_id: ScopeId,
        reference_timestamp: Timestamp,
    ) -> Self {
        Self {
            adapter,
            interceptors,
            table,
            applying_scope_id,
            reference_timestamp,
        }
    }

    /// The action for a conflict, and the merge row if one was supplied.
    fn decide(&self, conflict: Conflict) -> (Conflict, ApplyAction, Option<SyncRow>) {
        let resolution = conflict.policy.resolution();
        let mut args = ApplyChangesFailedArgs::new(conflict, resolution);
        self.interceptors.fire_apply_changes_failed(&mut args);
        let (conflict, resolution) = args.into_parts();

        let action = ApplyAction::from(&resolution);
        let merge_row = match resolution {
            ConflictResolution::MergeRow(row) => Some(row),
            _ => None,
        };
        (conflict, action, merge_row)
    }

    /// Resolve one conflict, writing whatever the decision requires.
    ///
    /// The conflict is updated in place when the round is rolled back.
    pub async fn resolve(
        &mut self,
        context: &mut SyncContext,
        conflict: &mut Conflict,
    ) -> Result<Resolution> {
        let (decided, action, merge_row) = self.decide(conflict.clone());
        *conflict = decided;
        debug!(
            table = %conflict.table,
            kind = %conflict.kind,
            ?action,
            "resolving conflict"
        );

        match action {
            ApplyAction::Rollback => {
                conflict.kind = ConflictType::ErrorsOccurred;
                conflict.error_message = Some(ROLLBACK_MESSAGE.to_string());
                context.total_sync_errors += 1;
                warn!(table = %conflict.table, "conflict resolution requested a rollback");
                Ok(Resolution::Rollback(Error::Rollback(ROLLBACK_MESSAGE.to_string())))
            }
            ApplyAction::Continue => self.keep(conflict, merge_row).await,
            ApplyAction::RetryWithForceWrite => self.force(context, conflict).await,
        }
    }

    /// Keep the stored row, or write the merge row in its place.
    async fn keep(&mut self, conflict: &Conflict, merge_row: Option<SyncRow>) -> Result<Resolution> {
        let Some(merged) = merge_row else {
            // nothing stored means a concurrent round already settled the row
            let rows = usize::from(conflict.local_row.is_some());
            return Ok(Resolution::resolved(rows, 0));
        };

        let write = self
            .adapter
            .apply_row(
                self.table,
                &merged,
                self.applying_scope_id,
                self.reference_timestamp,
                true,
            )
            .await?;
        if !write.is_applied() {
            return Err(Error::MergeWriteFailed(self.table.name.clone()));
        }
        // no origin scope, so the merged row travels back to the other side
        if !self.adapter.update_metadata(self.table, &merged, None).await? {
            return Err(Error::MetadataNotFound(self.table.name.clone()));
        }
        Ok(Resolution::resolved(1, 0))
    }

    /// Push the incoming row through, whatever is stored.
    async fn force(&mut self, context: &mut SyncContext, conflict: &Conflict) -> Result<Resolution> {
        let Some(remote) = conflict.remote_row.as_ref() else {
            context.total_sync_errors += 1;
            return Ok(Resolution::Rollback(Error::UnresolvableConflict {
                table: conflict.table.clone(),
                kind: conflict.kind,
            }));
        };

        let (write, count) = match conflict.kind {
            ConflictType::RemoteExistsLocalExists
            | ConflictType::RemoteExistsLocalNotExists
            | ConflictType::RemoteExistsLocalIsDeleted
            | ConflictType::UniqueKeyConstraint => {
                let mut upsert = remote.clone();
                upsert.state = RowState::Modified;
                (Some(upsert), 1)
            }
            ConflictType::RemoteIsDeletedLocalIsDeleted
            | ConflictType::RemoteIsDeletedLocalNotExists => (None, 0),
            ConflictType::RemoteIsDeletedLocalExists => {
                let mut delete = remote.clone();
                delete.state = RowState::Deleted;
                (Some(delete), 1)
            }
            ConflictType::RemoteCleanedupDeleteLocalUpdate | ConflictType::ErrorsOccurred => {
                context.total_sync_errors += 1;
                let error = Error::UnresolvableConflict {
                    table: conflict.table.clone(),
                    kind: conflict.kind,
                };
                warn!(%error, "forced write is not possible");
                return Ok(Resolution::Rollback(error));
            }
        };

        let Some(row) = write else {
            return Ok(Resolution::resolved(0, 0));
        };

        let outcome = self
            .adapter
            .apply_row(
                self.table,
                &row,
                self.applying_scope_id,
                self.reference_timestamp,
                true,
            )
            .await?;
        match outcome {
            RowWrite::Applied => {}
            RowWrite::ConstraintViolation(message) => {
                warn!(table = %conflict.table, kind = %conflict.kind, %message, "forced write rejected");
                context.total_sync_errors += 1;
                return Err(Error::ConstraintViolation {
                    table: conflict.table.clone(),
                    message,
                });
            }
            RowWrite::NotApplied => {
                warn!(table = %conflict.table, kind = %conflict.kind, "forced write did not complete");
                context.total_sync_errors += 1;
                return Ok(Resolution::Rollback(Error::UnresolvableConflict {
                    table: conflict.table.clone(),
                    kind: conflict.kind,
                }));
            }
        }

        if !self
            .adapter
            .update_metadata(self.table, &row, Some(self.applying_scope_id))
            .await?
        {
            return Err(Error::MetadataNotFound(self.table.name.clone()));
        }
        Ok(Resolution::resolved(count, count))
    }
}
