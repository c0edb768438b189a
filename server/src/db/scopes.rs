//! History of the client scopes served by this server.

use chrono::{DateTime, Utc};
use dualsync_engine::{ScopeId, ScopeInfo, Timestamp};
use serde::Serialize;
use sqlx::{PgPool, Row};

/// A client scope as last seen by this server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientScope {
    pub scope_id: ScopeId,
    pub scope_name: String,
    /// Server watermark handed to the client in its last round
    pub last_server_sync_timestamp: Timestamp,
    pub last_sync: DateTime<Utc>,
    pub rounds: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ClientScope {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let timestamp: i64 = row.try_get("last_server_sync_timestamp")?;
        Ok(ClientScope {
            scope_id: row.try_get("scope_id")?,
            scope_name: row.try_get("scope_name")?,
            last_server_sync_timestamp: timestamp as Timestamp,
            last_sync: row.try_get("last_sync")?,
            rounds: row.try_get("rounds")?,
        })
    }
}

/// Record a completed round for a client scope.
pub async fn record_client_round(
    pool: &PgPool,
    scope: &ScopeInfo,
    server_timestamp: Timestamp,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO client_scopes (scope_id, scope_name, last_server_sync_timestamp, last_sync)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (scope_id) DO UPDATE SET
            scope_name = EXCLUDED.scope_name,
            last_server_sync_timestamp = EXCLUDED.last_server_sync_timestamp,
            last_sync = EXCLUDED.last_sync,
            rounds = client_scopes.rounds + 1
        "#,
    )
    .bind(scope.id)
    .bind(&scope.name)
    .bind(server_timestamp as i64)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a client scope by id.
pub async fn get_client_scope(
    pool: &PgPool,
    scope_id: ScopeId,
) -> Result<Option<ClientScope>, sqlx::Error> {
    sqlx::query_as::<_, ClientScope>(
        r#"
        SELECT scope_id, scope_name, last_server_sync_timestamp, last_sync, rounds
        FROM client_scopes
        WHERE scope_id = $1
        "#,
    )
    .bind(scope_id)
    .fetch_optional(pool)
    .await
}
