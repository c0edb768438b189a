//! Sync endpoint routes.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use dualsync_engine::{
    EnsureSchemaRequest, EnsureSchemaResponse, ScopeId, SendChangesRequest, SendChangesResponse,
};

use crate::db::{self, ClientScope};
use crate::error::{AppError, Result};
use crate::handlers::{handle_ensure_schema, handle_send_changes};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/scope", post(scope_handler))
        .route("/sync/changes", post(changes_handler))
        .route("/sync/clients/{scope_id}", get(client_handler))
}

/// POST /sync/scope - Fetch the schema on first contact.
async fn scope_handler(
    State(state): State<AppState>,
    Json(request): Json<EnsureSchemaRequest>,
) -> Result<Json<EnsureSchemaResponse>> {
    let response = handle_ensure_schema(&state, request).await?;
    Ok(Json(response))
}

/// POST /sync/changes - Upload a delta, download the server's.
async fn changes_handler(
    State(state): State<AppState>,
    Json(request): Json<SendChangesRequest>,
) -> Result<Json<SendChangesResponse>> {
    let response = handle_send_changes(&state, request).await?;
    Ok(Json(response))
}

/// GET /sync/clients/{scope_id} - Last round served to a client scope.
async fn client_handler(
    State(state): State<AppState>,
    Path(scope_id): Path<ScopeId>,
) -> Result<Json<ClientScope>> {
    let scope = db::get_client_scope(&state.pool, scope_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("client scope {scope_id}")))?;
    Ok(Json(scope))
}
