//! Dualsync Server - the remote side of dualsync rounds, over HTTP.
//!
//! A client runs its `SyncAgent` against these endpoints: `POST /sync/scope`
//! returns the synced schema on first contact, `POST /sync/changes` applies
//! the client's delta and returns the server's. Rows and their change
//! tracking live in PostgreSQL.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;

use crate::config::Config;
use crate::db::{PgAdapter, Pool};
use crate::handlers::RoundsInFlight;
use dualsync_engine::{Interceptors, ServerOrchestrator, SyncSchema};
use std::sync::Arc;

pub use routes::router;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub schema: Arc<SyncSchema>,
    pub interceptors: Arc<Interceptors>,
    pub rounds: RoundsInFlight,
}

impl AppState {
    pub fn new(pool: Pool, config: Config, schema: SyncSchema) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            schema: Arc::new(schema),
            interceptors: Arc::new(round_interceptors()),
            rounds: RoundsInFlight::default(),
        }
    }

    /// An orchestrator for one request, over a fresh adapter.
    pub fn orchestrator(&self) -> ServerOrchestrator<PgAdapter> {
        let adapter = PgAdapter::new(self.pool.clone(), self.schema.clone())
            .with_bulk_operations(self.config.use_bulk_operations);
        ServerOrchestrator::with_interceptors(
            adapter,
            self.schema.as_ref().clone(),
            self.config.sync_options(),
            self.interceptors.clone(),
        )
    }
}

/// Interceptors that log what happens while client changes are applied.
fn round_interceptors() -> Interceptors {
    let mut interceptors = Interceptors::new();
    interceptors.on_apply_changes_failed(|args| {
        let conflict = args.conflict();
        tracing::info!(
            table = %conflict.table,
            kind = %conflict.kind,
            client = %conflict.applying_scope_id,
            resolution = ?args.resolution,
            "conflict on client change"
        );
    });
    interceptors.on_table_changes_applied(|args| {
        tracing::debug!(
            table = %args.applied.table,
            state = %args.applied.state,
            applied = args.applied.applied,
            failed = args.applied.failed,
            "table applied"
        );
    });
    interceptors
}
