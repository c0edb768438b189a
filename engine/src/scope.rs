//! Scope identity, round context and session state.

use crate::{ScopeId, SyncSchema, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stage of a round, recorded on the context and attached to errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStage {
    #[default]
    None,
    BeginSession,
    ScopeLoading,
    SchemaReading,
    TableChangesSelecting,
    TableChangesSelected,
    RemoteChangesExchanging,
    DatabaseChangesApplying,
    TableChangesApplying,
    TableChangesApplied,
    DatabaseChangesApplied,
    MetadataCleaning,
    ScopeWriting,
    EndSession,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncStage::None => "None",
            SyncStage::BeginSession => "BeginSession",
            SyncStage::ScopeLoading => "ScopeLoading",
            SyncStage::SchemaReading => "SchemaReading",
            SyncStage::TableChangesSelecting => "TableChangesSelecting",
            SyncStage::TableChangesSelected => "TableChangesSelected",
            SyncStage::RemoteChangesExchanging => "RemoteChangesExchanging",
            SyncStage::DatabaseChangesApplying => "DatabaseChangesApplying",
            SyncStage::TableChangesApplying => "TableChangesApplying",
            SyncStage::TableChangesApplied => "TableChangesApplied",
            SyncStage::DatabaseChangesApplied => "DatabaseChangesApplied",
            SyncStage::MetadataCleaning => "MetadataCleaning",
            SyncStage::ScopeWriting => "ScopeWriting",
            SyncStage::EndSession => "EndSession",
        };
        f.write_str(name)
    }
}

/// Direction of the leg currently running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncWay {
    /// Local changes applied on the remote side
    #[default]
    Upload,
    /// Remote changes applied on the local side
    Download,
}

/// Mode of a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncType {
    #[default]
    Normal,
    /// Drop local data and download everything; local changes are lost
    Reinitialize,
    /// Upload local changes, then drop local data and download everything
    ReinitializeWithUpload,
}

/// Whether an agent is currently running a round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Ready,
    Synchronizing,
}

/// Transient state of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncContext {
    pub session_id: Uuid,
    pub sync_way: SyncWay,
    pub sync_type: SyncType,
    pub stage: SyncStage,
    pub start_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub total_changes_uploaded: usize,
    pub total_changes_downloaded: usize,
    pub total_sync_conflicts: usize,
    pub total_sync_errors: usize,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new(SyncType::Normal)
    }
}

impl SyncContext {
    /// A fresh context with a new session id.
    pub fn new(sync_type: SyncType) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            sync_way: SyncWay::Upload,
            sync_type,
            stage: SyncStage::None,
            start_time: Utc::now(),
            complete_time: None,
            total_changes_uploaded: 0,
            total_changes_downloaded: 0,
            total_sync_conflicts: 0,
            total_sync_errors: 0,
        }
    }

    /// Wall-clock duration of the round, once complete.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.complete_time.map(|end| end - self.start_time)
    }
}

impl std::fmt::Display for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "session {}: {} uploaded, {} downloaded, {} conflicts, {} errors",
            self.session_id,
            self.total_changes_uploaded,
            self.total_changes_downloaded,
            self.total_sync_conflicts,
            self.total_sync_errors
        )?;
        if let Some(duration) = self.duration() {
            write!(f, " in {}ms", duration.num_milliseconds())?;
        }
        Ok(())
    }
}

/// Sync identity and watermarks of one replica for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInfo {
    pub id: ScopeId,
    pub name: String,
    /// Schema learned from the remote side, cached after the first round
    pub schema: Option<SyncSchema>,
    /// True until the first round completes
    pub is_new_scope: bool,
    /// Local logical time captured before the last successful selection
    pub last_sync_timestamp: Timestamp,
    /// Remote logical time returned by the last successful round
    pub last_server_sync_timestamp: Timestamp,
    /// Local tombstones at or below this timestamp have been purged
    #[serde(default)]
    pub last_cleanup_timestamp: Timestamp,
    /// Wall-clock instant of the last success, informational only
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_duration_ms: i64,
}

impl ScopeInfo {
    /// A scope for first contact, with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schema: None,
            is_new_scope: true,
            last_sync_timestamp: 0,
            last_server_sync_timestamp: 0,
            last_cleanup_timestamp: 0,
            last_sync: None,
            last_sync_duration_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_scope_starts_from_zero() {
        let scope = ScopeInfo::new("DefaultScope");
        assert!(scope.is_new_scope);
        assert_eq!(scope.last_sync_timestamp, 0);
        assert_eq!(scope.last_server_sync_timestamp, 0);
        assert_eq!(scope.last_cleanup_timestamp, 0);
        assert!(scope.schema.is_none());
        assert_ne!(scope.id, ScopeInfo::new("DefaultScope").id);
    }

    #[test]
    fn context_summary() {
        let mut context = SyncContext::new(SyncType::Normal);
        context.total_changes_uploaded = 2;
        context.total_changes_downloaded = 3;
        context.total_sync_conflicts = 1;
        let summary = context.to_string();
        assert!(summary.ends_with("2 uploaded, 3 downloaded, 1 conflicts, 0 errors"));

        context.complete_time = Some(context.start_time + chrono::Duration::milliseconds(15));
        assert!(context.to_string().ends_with("in 15ms"));
    }

    #[test]
    fn stage_display() {
        assert_eq!(SyncStage::TableChangesApplying.to_string(), "TableChangesApplying");
        assert_eq!(SyncStage::default(), SyncStage::None);
    }
}
