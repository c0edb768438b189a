//! Conflict classification and resolution policy.
//!
//! A conflict is raised whenever a conditional row write affects zero rows.
//! Classification only looks at a handful of facts about the two sides of
//! the row, so it is a pure function that can be tested exhaustively.
//!
//! # Classification
//!
//! 1. A unique constraint violation dominates everything.
//! 2. A remote tombstone dominates remote existence.
//! 3. The local side is triaged the same way: tombstoned, exists, absent.
//! 4. A remote row that neither exists nor is tombstoned was cleaned up on
//!    the remote side; it only makes sense if the local side still knows it.

use crate::{ScopeId, SyncRow, TableName};
use serde::{Deserialize, Serialize};

/// Kind of conflict between a remote change and the local state of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    RemoteExistsLocalExists,
    RemoteExistsLocalNotExists,
    RemoteExistsLocalIsDeleted,
    RemoteIsDeletedLocalExists,
    RemoteIsDeletedLocalIsDeleted,
    RemoteIsDeletedLocalNotExists,
    UniqueKeyConstraint,
    RemoteCleanedupDeleteLocalUpdate,
    ErrorsOccurred,
}

impl ConflictType {
    /// Every kind, in declaration order.
    pub const ALL: [ConflictType; 9] = [
        ConflictType::RemoteExistsLocalExists,
        ConflictType::RemoteExistsLocalNotExists,
        ConflictType::RemoteExistsLocalIsDeleted,
        ConflictType::RemoteIsDeletedLocalExists,
        ConflictType::RemoteIsDeletedLocalIsDeleted,
        ConflictType::RemoteIsDeletedLocalNotExists,
        ConflictType::UniqueKeyConstraint,
        ConflictType::RemoteCleanedupDeleteLocalUpdate,
        ConflictType::ErrorsOccurred,
    ];
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConflictType::RemoteExistsLocalExists => "RemoteExistsLocalExists",
            ConflictType::RemoteExistsLocalNotExists => "RemoteExistsLocalNotExists",
            ConflictType::RemoteExistsLocalIsDeleted => "RemoteExistsLocalIsDeleted",
            ConflictType::RemoteIsDeletedLocalExists => "RemoteIsDeletedLocalExists",
            ConflictType::RemoteIsDeletedLocalIsDeleted => "RemoteIsDeletedLocalIsDeleted",
            ConflictType::RemoteIsDeletedLocalNotExists => "RemoteIsDeletedLocalNotExists",
            ConflictType::UniqueKeyConstraint => "UniqueKeyConstraint",
            ConflictType::RemoteCleanedupDeleteLocalUpdate => "RemoteCleanedupDeleteLocalUpdate",
            ConflictType::ErrorsOccurred => "ErrorsOccurred",
        };
        f.write_str(name)
    }
}

/// What is known about both sides of a conflicting row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConflictFacts {
    pub local_exists: bool,
    pub local_tombstoned: bool,
    pub remote_exists: bool,
    pub remote_tombstoned: bool,
    /// The write hit a unique constraint
    pub constraint_violation: bool,
}

/// Classify a conflict. Total over every combination of facts.
pub fn classify(facts: ConflictFacts) -> ConflictType {
    use ConflictType::*;

    if facts.constraint_violation {
        return UniqueKeyConstraint;
    }

    let local = if facts.local_tombstoned {
        LocalSide::Deleted
    } else if facts.local_exists {
        LocalSide::Exists
    } else {
        LocalSide::Absent
    };

    if facts.remote_tombstoned {
        match local {
            LocalSide::Deleted => RemoteIsDeletedLocalIsDeleted,
            LocalSide::Exists => RemoteIsDeletedLocalExists,
            LocalSide::Absent => RemoteIsDeletedLocalNotExists,
        }
    } else if facts.remote_exists {
        match local {
            LocalSide::Deleted => RemoteExistsLocalIsDeleted,
            LocalSide::Exists => RemoteExistsLocalExists,
            LocalSide::Absent => RemoteExistsLocalNotExists,
        }
    } else {
        match local {
            LocalSide::Absent => ErrorsOccurred,
            _ => RemoteCleanedupDeleteLocalUpdate,
        }
    }
}

#[derive(Clone, Copy)]
enum LocalSide {
    Exists,
    Deleted,
    Absent,
}

/// Which side wins a conflict when nobody overrides the decision.
///
/// The policy is stated from the remote (server) point of view; the local
/// leg of a round always applies the complement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolutionPolicy {
    #[default]
    ServerWins,
    ClientWins,
}

impl ConflictResolutionPolicy {
    /// The policy the other side applies.
    pub fn complement(self) -> Self {
        match self {
            ConflictResolutionPolicy::ServerWins => ConflictResolutionPolicy::ClientWins,
            ConflictResolutionPolicy::ClientWins => ConflictResolutionPolicy::ServerWins,
        }
    }

    /// The resolution this policy picks by itself.
    pub fn resolution(self) -> ConflictResolution {
        match self {
            ConflictResolutionPolicy::ServerWins => ConflictResolution::ServerWins,
            ConflictResolutionPolicy::ClientWins => ConflictResolution::ClientWins,
        }
    }
}

impl std::str::FromStr for ConflictResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "serverwins" => Ok(ConflictResolutionPolicy::ServerWins),
            "clientwins" => Ok(ConflictResolutionPolicy::ClientWins),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Decision taken for one conflict.
///
/// `ServerWins` keeps the row as stored on the applying side; `ClientWins`
/// forces the incoming row through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    ServerWins,
    ClientWins,
    /// Write this row instead of either side
    MergeRow(SyncRow),
    /// Abort the whole round
    Rollback,
}

/// What the resolver does with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyAction {
    Continue,
    RetryWithForceWrite,
    Rollback,
}

impl From<&ConflictResolution> for ApplyAction {
    fn from(resolution: &ConflictResolution) -> Self {
        match resolution {
            ConflictResolution::ServerWins | ConflictResolution::MergeRow(_) => {
                ApplyAction::Continue
            }
            ConflictResolution::ClientWins => ApplyAction::RetryWithForceWrite,
            ConflictResolution::Rollback => ApplyAction::Rollback,
        }
    }
}

/// A conflict raised while applying a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub table: TableName,
    pub kind: ConflictType,
    /// Row as currently stored on the applying side
    pub local_row: Option<SyncRow>,
    /// Row being applied
    pub remote_row: Option<SyncRow>,
    /// Policy in effect on the applying side
    pub policy: ConflictResolutionPolicy,
    /// Scope whose changes are being applied
    pub applying_scope_id: ScopeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
