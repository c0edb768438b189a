//! Schema handler - first contact of a client scope.

use crate::error::{AppError, Result};
use crate::AppState;
use dualsync_engine::{EnsureSchemaRequest, EnsureSchemaResponse, RemoteOrchestrator};

/// Return the synced schema, restricted to the tables the client asked for.
pub async fn handle_ensure_schema(
    state: &AppState,
    request: EnsureSchemaRequest,
) -> Result<EnsureSchemaResponse> {
    if request.scope_name.trim().is_empty() {
        return Err(AppError::BadRequest("scope name must not be empty".to_string()));
    }

    tracing::debug!(
        scope = %request.scope_name,
        tables = request.tables.len(),
        "schema requested"
    );
    let response = state.orchestrator().ensure_schema(request).await?;
    Ok(response)
}
