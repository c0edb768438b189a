//! Messages exchanged between the local and the remote side.

use crate::{
    ChangeBatch, DatabaseChangesApplied, DatabaseChangesSelected, ScopeInfo, SyncContext,
    SyncSchema, TableName, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Ask the remote side for the authoritative schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureSchemaRequest {
    pub context: SyncContext,
    pub scope_name: String,
    /// Tables the caller wants; empty for all
    #[serde(default)]
    pub tables: Vec<TableName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureSchemaResponse {
    pub context: SyncContext,
    pub schema: SyncSchema,
}

/// Local changes sent to the remote side, with the sender's scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChangesRequest {
    pub context: SyncContext,
    pub scope: ScopeInfo,
    pub changes: ChangeBatch,
}

/// Remote changes for the sender, and the remote watermark to store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChangesResponse {
    pub context: SyncContext,
    pub changes: ChangeBatch,
    /// Remote logical time captured before the remote changes were read
    pub server_timestamp: Timestamp,
    /// How the sender's changes were applied on the remote side
    pub changes_applied: DatabaseChangesApplied,
    pub changes_selected: DatabaseChangesSelected,
}
