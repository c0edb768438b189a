//! Options of one side of a sync relationship.

use serde::{Deserialize, Serialize};

/// Name of the scope used when none is configured.
pub const DEFAULT_SCOPE_NAME: &str = "DefaultScope";

/// Options applied to every round an orchestrator runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Scope record the watermarks are kept under
    pub scope_name: String,
    /// Turn foreign key checks off while a round writes
    pub disable_constraints_on_apply_changes: bool,
    /// Use the adapter's bulk writes when it has them
    pub use_bulk_operations: bool,
    /// Purge local tombstones the remote side has already received, at the
    /// end of each successful round. The remote side never purges.
    pub clean_metadatas: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            scope_name: DEFAULT_SCOPE_NAME.to_string(),
            disable_constraints_on_apply_changes: false,
            use_bulk_operations: true,
            clean_metadatas: false,
        }
    }
}
