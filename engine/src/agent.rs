//! The sync agent: runs full rounds between a local replica and a remote.

use crate::{
    adapter::{ScopeRegistry, SyncAdapter},
    error::Result,
    interceptor::SessionArgs,
    messages::{EnsureSchemaRequest, SendChangesRequest},
    orchestrator::{ensure_not_cancelled, LocalOrchestrator, RemoteOrchestrator},
    SessionState, SyncContext, SyncStage, SyncType, TableName,
};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Runs rounds for one local scope against one remote side.
///
/// A round borrows the agent mutably, so one agent never runs two rounds at
/// once.
pub struct SyncAgent<A, R> {
    local: LocalOrchestrator<A>,
    remote: R,
    tables: Vec<TableName>,
    session_state: SessionState,
}

impl<A, R> SyncAgent<A, R>
where
    A: SyncAdapter + ScopeRegistry,
    R: RemoteOrchestrator,
{
    pub fn new(local: LocalOrchestrator<A>, remote: R) -> Self {
        Self {
            local,
            remote,
            tables: Vec::new(),
            session_state: SessionState::Ready,
        }
    }

    /// Restrict the first-contact schema request to these tables.
    pub fn with_tables(mut self, tables: Vec<TableName>) -> Self {
        self.tables = tables;
        self
    }

    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    pub fn local(&self) -> &LocalOrchestrator<A> {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalOrchestrator<A> {
        &mut self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut R {
        &mut self.remote
    }

    /// Run a normal round that cannot be cancelled.
    pub async fn synchronize(&mut self) -> Result<SyncContext> {
        let (_cancel_tx, cancel) = watch::channel(false);
        self.synchronize_with(SyncType::Normal, &cancel).await
    }

    /// Run a round of the given mode. Setting `cancel` to true stops the
    /// round at the next boundary, up to the local commit.
    pub async fn synchronize_with(
        &mut self,
        sync_type: SyncType,
        cancel: &watch::Receiver<bool>,
    ) -> Result<SyncContext> {
        let mut context = SyncContext::new(sync_type);
        context.stage = SyncStage::BeginSession;
        self.session_state = SessionState::Synchronizing;
        self.local
            .interceptors()
            .session_begin
            .fire(&SessionArgs {
                context: context.clone(),
            });
        info!(session = %context.session_id, ?sync_type, "sync session started");

        let outcome = self.run(context, cancel).await;
        self.session_state = SessionState::Ready;

        match outcome {
            Ok(mut context) => {
                context.stage = SyncStage::EndSession;
                context.complete_time = Some(Utc::now());
                self.local
                    .interceptors()
                    .session_end
                    .fire(&SessionArgs {
                        context: context.clone(),
                    });
                info!("{context}");
                Ok(context)
            }
            Err(e) => {
                warn!(error = %e, "sync session failed");
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        context: SyncContext,
        cancel: &watch::Receiver<bool>,
    ) -> Result<SyncContext> {
        ensure_not_cancelled(cancel, SyncStage::BeginSession)?;
        let (context, scope) = self.local.ensure_scope(context).await?;

        ensure_not_cancelled(cancel, SyncStage::ScopeLoading)?;
        let (context, schema) = match scope.schema.clone() {
            Some(schema) => (context, schema),
            None => {
                let response = self
                    .remote
                    .ensure_schema(EnsureSchemaRequest {
                        context,
                        scope_name: scope.name.clone(),
                        tables: self.tables.clone(),
                    })
                    .await
                    .map_err(|e| e.at_stage(SyncStage::SchemaReading))?;
                (response.context, response.schema)
            }
        };

        ensure_not_cancelled(cancel, SyncStage::SchemaReading)?;
        let (context, local_changes) = self.local.get_changes(context, &schema, &scope).await?;

        ensure_not_cancelled(cancel, SyncStage::TableChangesSelected)?;
        let mut remote_context = context;
        remote_context.stage = SyncStage::RemoteChangesExchanging;
        let response = self
            .remote
            .apply_then_get_changes(SendChangesRequest {
                context: remote_context,
                scope: scope.clone(),
                changes: local_changes.changes,
            })
            .await
            .map_err(|e| e.at_stage(SyncStage::RemoteChangesExchanging))?;

        ensure_not_cancelled(cancel, SyncStage::RemoteChangesExchanging)?;
        let policy = schema.conflict_resolution_policy.complement();
        let (mut context, applied, _scope) = self
            .local
            .apply_changes(
                response.context,
                scope,
                &schema,
                response.changes,
                policy,
                local_changes.timestamp,
                response.server_timestamp,
                cancel,
            )
            .await?;

        context.total_changes_uploaded = local_changes.selected.total_changes_selected();
        context.total_changes_downloaded = applied.total_applied_changes();
        context.total_sync_errors += applied.total_applied_changes_failed();
        Ok(context)
    }
}
