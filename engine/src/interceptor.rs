//! Typed observers for round lifecycle events.
//!
//! Handlers run synchronously, in registration order, to completion. Only the
//! apply-changes-failed handlers can influence the round: they may replace
//! the resolution the policy picked for a conflict.

use crate::{
    Conflict, ConflictResolution, DatabaseChangesApplied, DatabaseChangesSelected, RowState,
    SyncContext, SyncWay, TableChangesApplied, TableName,
};

type Handler<A> = Box<dyn Fn(&A) + Send + Sync>;
type MutHandler<A> = Box<dyn Fn(&mut A) + Send + Sync>;

/// Handlers for one event kind.
pub struct HandlerList<A> {
    handlers: Vec<Handler<A>>,
}

impl<A> Default for HandlerList<A> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<A> HandlerList<A> {
    fn push(&mut self, handler: impl Fn(&A) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub(crate) fn fire(&self, args: &A) {
        for handler in &self.handlers {
            handler(args);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Raised when a session starts or ends.
#[derive(Debug, Clone)]
pub struct SessionArgs {
    pub context: SyncContext,
}

/// Raised once the changes of one side were read.
#[derive(Debug, Clone)]
pub struct ChangesSelectedArgs {
    pub context: SyncContext,
    pub changes: DatabaseChangesSelected,
}

/// Raised before a round writes anything.
#[derive(Debug, Clone)]
pub struct DatabaseChangesApplyingArgs {
    pub context: SyncContext,
    pub rows: usize,
}

/// Raised after a round finished writing, before commit.
#[derive(Debug, Clone)]
pub struct DatabaseChangesAppliedArgs {
    pub context: SyncContext,
    pub applied: DatabaseChangesApplied,
}

/// Raised before one table's rows of one state are written.
#[derive(Debug, Clone)]
pub struct TableChangesApplyingArgs {
    pub table: TableName,
    pub state: RowState,
    pub sync_way: SyncWay,
    pub rows: usize,
}

/// Raised after one table's rows of one state were written.
#[derive(Debug, Clone)]
pub struct TableChangesAppliedArgs {
    pub sync_way: SyncWay,
    pub applied: TableChangesApplied,
}

/// Raised for each conflict, before it is resolved.
#[derive(Debug)]
pub struct ApplyChangesFailedArgs {
    conflict: Conflict,
    /// Resolution picked by the policy; handlers may replace it
    pub resolution: ConflictResolution,
}

impl ApplyChangesFailedArgs {
    pub(crate) fn new(conflict: Conflict, resolution: ConflictResolution) -> Self {
        Self {
            conflict,
            resolution,
        }
    }

    pub fn conflict(&self) -> &Conflict {
        &self.conflict
    }

    pub(crate) fn into_parts(self) -> (Conflict, ConflictResolution) {
        (self.conflict, self.resolution)
    }
}

/// Registry of lifecycle handlers shared by the orchestrators of one side.
#[derive(Default)]
pub struct Interceptors {
    pub(crate) session_begin: HandlerList<SessionArgs>,
    pub(crate) session_end: HandlerList<SessionArgs>,
    pub(crate) table_changes_selected: HandlerList<ChangesSelectedArgs>,
    pub(crate) database_changes_applying: HandlerList<DatabaseChangesApplyingArgs>,
    pub(crate) database_changes_applied: HandlerList<DatabaseChangesAppliedArgs>,
    pub(crate) table_changes_applying: HandlerList<TableChangesApplyingArgs>,
    pub(crate) table_changes_applied: HandlerList<TableChangesAppliedArgs>,
    apply_changes_failed: Vec<MutHandler<ApplyChangesFailedArgs>>,
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_session_begin(&mut self, f: impl Fn(&SessionArgs) + Send + Sync + 'static) {
        self.session_begin.push(f);
    }

    pub fn on_session_end(&mut self, f: impl Fn(&SessionArgs) + Send + Sync + 'static) {
        self.session_end.push(f);
    }

    pub fn on_table_changes_selected(
        &mut self,
        f: impl Fn(&ChangesSelectedArgs) + Send + Sync + 'static,
    ) {
        self.table_changes_selected.push(f);
    }

    pub fn on_database_changes_applying(
        &mut self,
        f: impl Fn(&DatabaseChangesApplyingArgs) + Send + Sync + 'static,
    ) {
        self.database_changes_applying.push(f);
    }

    pub fn on_database_changes_applied(
        &mut self,
        f: impl Fn(&DatabaseChangesAppliedArgs) + Send + Sync + 'static,
    ) {
        self.database_changes_applied.push(f);
    }

    pub fn on_table_changes_applying(
        &mut self,
        f: impl Fn(&TableChangesApplyingArgs) + Send + Sync + 'static,
    ) {
        self.table_changes_applying.push(f);
    }

    pub fn on_table_changes_applied(
        &mut self,
        f: impl Fn(&TableChangesAppliedArgs) + Send + Sync + 'static,
    ) {
        self.table_changes_applied.push(f);
    }

    /// Register a conflict handler. Later handlers see the resolution set by
    /// earlier ones.
    pub fn on_apply_changes_failed(
        &mut self,
        f: impl Fn(&mut ApplyChangesFailedArgs) + Send + Sync + 'static,
    ) {
        self.apply_changes_failed.push(Box::new(f));
    }

    pub(crate) fn fire_apply_changes_failed(&self, args: &mut ApplyChangesFailedArgs) {
        for handler in &self.apply_changes_failed {
            handler(args);
        }
    }
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptors")
            .field("session_begin", &self.session_begin.len())
            .field("session_end", &self.session_end.len())
            .field("table_changes_selected", &self.table_changes_selected.len())
            .field(
                "database_changes_applying",
                &self.database_changes_applying.len(),
            )
            .field(
                "database_changes_applied",
                &self.database_changes_applied.len(),
            )
            .field("table_changes_applying", &self.table_changes_applying.len())
            .field("table_changes_applied", &self.table_changes_applied.len())
            .field("apply_changes_failed", &self.apply_changes_failed.len())
            .finish()
    }
}
