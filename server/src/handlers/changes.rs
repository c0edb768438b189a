//! Changes handler - applies a client's delta and returns the server's.

use crate::db;
use crate::error::{AppError, Result};
use crate::AppState;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use dualsync_engine::{
    Error, RemoteOrchestrator, ScopeId, ScopeInfo, SendChangesRequest, SendChangesResponse,
    Timestamp,
};
use sqlx::PgPool;
use std::sync::Arc;

/// Client scopes with a round in progress, and when it started.
pub type RoundsInFlight = Arc<DashMap<ScopeId, DateTime<Utc>>>;

/// Marks a scope busy for as long as it lives.
pub struct RoundGuard {
    rounds: RoundsInFlight,
    scope_id: ScopeId,
}

impl RoundGuard {
    /// Claim `scope_id`, failing if another round holds it.
    pub fn acquire(rounds: &RoundsInFlight, scope_id: ScopeId) -> Result<Self> {
        match rounds.entry(scope_id) {
            Entry::Occupied(started) => {
                tracing::warn!(scope = %scope_id, since = %started.get(), "scope busy");
                Err(AppError::Engine(Error::ScopeBusy(scope_id)))
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Ok(Self {
                    rounds: rounds.clone(),
                    scope_id,
                })
            }
        }
    }
}

impl Drop for RoundGuard {
    fn drop(&mut self) {
        self.rounds.remove(&self.scope_id);
    }
}

/// Run the server leg of a round for one client scope.
pub async fn handle_send_changes(
    state: &AppState,
    request: SendChangesRequest,
) -> Result<SendChangesResponse> {
    let unknown: Vec<&String> = request
        .changes
        .tables
        .keys()
        .filter(|table| state.schema.get_table(table).is_none())
        .collect();
    if !unknown.is_empty() {
        return Err(AppError::BadRequest(format!(
            "changes for tables outside the sync schema: {unknown:?}"
        )));
    }

    let _guard = RoundGuard::acquire(&state.rounds, request.scope.id)?;
    let scope = request.scope.clone();

    let response = state.orchestrator().apply_then_get_changes(request).await?;
    record_round(&state.pool, &scope, response.server_timestamp).await;

    tracing::info!(
        scope = %scope.id,
        applied = response.changes_applied.total_applied_changes(),
        conflicts = response.changes_applied.conflicts.len(),
        selected = response.changes_selected.total_changes_selected(),
        "round served"
    );
    Ok(response)
}

/// Book the served round in `client_scopes`.
///
/// The round is already committed at this point, so a failure is logged
/// and the response still goes out.
async fn record_round(pool: &PgPool, scope: &ScopeInfo, server_timestamp: Timestamp) -> bool {
    match db::record_client_round(pool, scope, server_timestamp).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(scope = %scope.id, error = %e, "failed to record client round");
            false
        }
    }
}
