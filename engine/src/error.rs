//! Error types for the dualsync engine.

use crate::{ConflictType, ScopeId, SyncStage, TableName};
use thiserror::Error;

/// All possible errors from the dualsync engine.
///
/// Expected conflicts never show up here: they are classified and resolved
/// by the resolver. Only a deliberate rollback, an unresolvable conflict or
/// a genuine fault escapes a round, annotated with the stage it happened in.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema and row validation errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("missing primary key column '{column}' in table '{table}'")]
    MissingPrimaryKey { table: TableName, column: String },

    #[error("missing required column: {0}")]
    MissingRequiredColumn(String),

    #[error("type mismatch for column '{column}': expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: String,
    },

    // Apply errors
    #[error("rollback: {0}")]
    Rollback(String),

    #[error("conflict {kind} on table '{table}' cannot be resolved")]
    UnresolvableConflict { table: TableName, kind: ConflictType },

    #[error("constraint violation on table '{table}': {message}")]
    ConstraintViolation { table: TableName, message: String },

    #[error("merge row could not be written to table '{0}'")]
    MergeWriteFailed(TableName),

    #[error("no tracking metadata found for row in table '{0}'")]
    MetadataNotFound(TableName),

    // Store, transaction and remote errors
    #[error("store error: {0}")]
    Store(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("remote error: {0}")]
    Remote(String),

    // Orchestration errors
    #[error("a sync round is already in progress for scope {0}")]
    ScopeBusy(ScopeId),

    #[error("sync cancelled")]
    Cancelled,

    #[error("{source} (stage: {stage})")]
    Staged {
        stage: SyncStage,
        source: Box<Error>,
    },
}

impl Error {
    /// Annotate this error with the stage it surfaced in.
    ///
    /// The innermost stage wins: an error that is already annotated keeps
    /// its original stage.
    pub fn at_stage(self, stage: SyncStage) -> Self {
        match self {
            Error::Staged { .. } => self,
            other => Error::Staged {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was annotated with, if any.
    pub fn stage(&self) -> Option<SyncStage> {
        match self {
            Error::Staged { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error without its stage annotation.
    pub fn root(&self) -> &Error {
        match self {
            Error::Staged { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the round was aborted deliberately (rollback signal or
    /// unresolvable conflict) rather than by a fault.
    pub fn is_rollback(&self) -> bool {
        matches!(
            self.root(),
            Error::Rollback(_) | Error::UnresolvableConflict { .. }
        )
    }

    /// Whether the round was aborted by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
