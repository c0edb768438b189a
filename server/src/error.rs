//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dualsync_engine::{Error as EngineError, SyncStage};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response body.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<SyncStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    /// Status code the error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Engine(e) => match e.root() {
                EngineError::ScopeBusy(_) => StatusCode::CONFLICT,
                EngineError::Rollback(_) | EngineError::UnresolvableConflict { .. } => {
                    StatusCode::CONFLICT
                }
                EngineError::ConstraintViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::TableNotFound(_)
                | EngineError::InvalidSchema(_)
                | EngineError::MissingPrimaryKey { .. }
                | EngineError::MissingRequiredColumn(_)
                | EngineError::TypeMismatch { .. } => StatusCode::BAD_REQUEST,
                EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, stage, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None, None)
            }
            AppError::Engine(e) if status.is_server_error() => {
                tracing::error!("Engine error: {:?}", e);
                ("Sync round failed".to_string(), e.stage(), Some(e.root().to_string()))
            }
            AppError::Engine(e) => {
                tracing::warn!("Engine error: {}", e);
                (e.root().to_string(), e.stage(), None)
            }
            AppError::BadRequest(msg) => (msg.clone(), None, None),
            AppError::NotFound(msg) => (msg.clone(), None, None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            stage,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
