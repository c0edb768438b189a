//! The two sides of a round.
//!
//! [`LocalOrchestrator`] owns the client replica and its scope record.
//! [`RemoteOrchestrator`] is whatever answers for the other replica: the
//! in-process [`ServerOrchestrator`], or a transport client talking to a
//! remote host.

use crate::{
    adapter::{ScopeRegistry, SyncAdapter},
    apply::{ApplyChangesMessage, ChangeApplier, DatabaseChangesApplied},
    error::Result,
    interceptor::ChangesSelectedArgs,
    messages::{EnsureSchemaRequest, EnsureSchemaResponse, SendChangesRequest, SendChangesResponse},
    ChangeBatch, ConflictResolutionPolicy, DatabaseChangesSelected, Error, Interceptors, RowState,
    ScopeId, ScopeInfo, SyncContext, SyncOptions, SyncSchema, SyncStage, SyncType, SyncWay,
    Timestamp,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fail with [`Error::Cancelled`] if cancellation was requested.
pub fn ensure_not_cancelled(cancel: &watch::Receiver<bool>, stage: SyncStage) -> Result<()> {
    if *cancel.borrow() {
        Err(Error::Cancelled.at_stage(stage))
    } else {
        Ok(())
    }
}

/// Local changes read for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChanges {
    /// Local logical time captured before reading, the next watermark
    pub timestamp: Timestamp,
    pub changes: ChangeBatch,
    pub selected: DatabaseChangesSelected,
}

/// What to read from a tracking store for one round.
struct Selection {
    since: Timestamp,
    excluded_scope: Option<ScopeId>,
    include_deletes: bool,
}

async fn select_changes<A: SyncAdapter + ?Sized>(
    adapter: &mut A,
    schema: &SyncSchema,
    way: SyncWay,
    selection: &Selection,
) -> Result<ChangeBatch> {
    let mut batch = ChangeBatch::new();
    for table in &schema.tables {
        if !table.sync_direction.allows(way) {
            continue;
        }
        let rows = adapter
            .get_changes(table, selection.since, selection.excluded_scope)
            .await?;
        debug!(table = %table.name, rows = rows.len(), "changes selected");
        batch.extend(
            rows.into_iter()
                .filter(|row| selection.include_deletes || row.state != RowState::Deleted),
        );
    }
    Ok(batch)
}

/// Drives the local replica.
pub struct LocalOrchestrator<A> {
    adapter: A,
    options: SyncOptions,
    interceptors: Interceptors,
}

impl<A: SyncAdapter + ScopeRegistry> LocalOrchestrator<A> {
    pub fn new(adapter: A, options: SyncOptions) -> Self {
        Self {
            adapter,
            options,
            interceptors: Interceptors::new(),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    pub fn interceptors_mut(&mut self) -> &mut Interceptors {
        &mut self.interceptors
    }

    /// Load the scope record, creating it on first contact.
    ///
    /// A new record is saved right away so its id stays stable across
    /// attempts; its watermarks stay at zero until a round succeeds.
    pub async fn ensure_scope(&mut self, mut context: SyncContext) -> Result<(SyncContext, ScopeInfo)> {
        context.stage = SyncStage::ScopeLoading;
        let stage = context.stage;
        let scope = self.load_or_create_scope().await.map_err(|e| e.at_stage(stage))?;
        Ok((context, scope))
    }

    async fn load_or_create_scope(&mut self) -> Result<ScopeInfo> {
        if let Some(scope) = self.adapter.load_scope(&self.options.scope_name).await? {
            return Ok(scope);
        }

        let scope = ScopeInfo::new(self.options.scope_name.clone());
        self.adapter.begin_transaction().await?;
        if let Err(e) = self.adapter.save_scope(&scope).await {
            self.rollback().await;
            return Err(e);
        }
        self.adapter.commit_transaction().await?;
        info!(scope = %scope.name, id = %scope.id, "scope created");
        Ok(scope)
    }

    /// Read the local changes made since the scope's watermark.
    ///
    /// A plain reinitialize uploads nothing.
    pub async fn get_changes(
        &mut self,
        mut context: SyncContext,
        schema: &SyncSchema,
        scope: &ScopeInfo,
    ) -> Result<(SyncContext, LocalChanges)> {
        context.sync_way = SyncWay::Upload;
        context.stage = SyncStage::TableChangesSelecting;

        let timestamp = self
            .adapter
            .current_timestamp()
            .await
            .map_err(|e| e.at_stage(SyncStage::TableChangesSelecting))?;

        let changes = if context.sync_type == SyncType::Reinitialize {
            ChangeBatch::new()
        } else {
            let selection = Selection {
                since: scope.last_sync_timestamp,
                excluded_scope: Some(scope.id),
                include_deletes: true,
            };
            select_changes(&mut self.adapter, schema, SyncWay::Upload, &selection)
                .await
                .map_err(|e| e.at_stage(SyncStage::TableChangesSelecting))?
        };

        let selected = DatabaseChangesSelected::from_batch(&changes);
        context.stage = SyncStage::TableChangesSelected;
        self.interceptors
            .table_changes_selected
            .fire(&ChangesSelectedArgs {
                context: context.clone(),
                changes: selected.clone(),
            });
        info!(
            rows = selected.total_changes_selected(),
            since = scope.last_sync_timestamp,
            timestamp,
            "local changes selected"
        );

        Ok((
            context,
            LocalChanges {
                timestamp,
                changes,
                selected,
            },
        ))
    }

    /// Apply the remote delta and advance the scope, in one transaction.
    ///
    /// Cancellation is honoured up to the commit; a cancelled or failed
    /// round leaves rows and scope as they were.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_changes(
        &mut self,
        mut context: SyncContext,
        scope: ScopeInfo,
        schema: &SyncSchema,
        changes: ChangeBatch,
        policy: ConflictResolutionPolicy,
        client_timestamp: Timestamp,
        server_timestamp: Timestamp,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(SyncContext, DatabaseChangesApplied, ScopeInfo)> {
        context.sync_way = SyncWay::Download;
        context.stage = SyncStage::DatabaseChangesApplying;

        self.adapter
            .begin_transaction()
            .await
            .map_err(|e| e.at_stage(SyncStage::DatabaseChangesApplying))?;

        let mut message = ApplyChangesMessage {
            schema: schema.clone(),
            changes,
            applying_scope_id: scope.id,
            reference_timestamp: client_timestamp,
            policy,
            is_new: scope.is_new_scope,
            disable_constraints_on_apply_changes: self.options.disable_constraints_on_apply_changes,
            use_bulk_operations: self.options.use_bulk_operations,
        };

        let outcome = async {
            let (mut context, applied) = ChangeApplier::new(&mut self.adapter, &self.interceptors)
                .apply_changes(context, &mut message)
                .await?;
            ensure_not_cancelled(cancel, context.stage)?;

            let mut scope = scope;
            if self.options.clean_metadatas {
                context.stage = SyncStage::MetadataCleaning;
                let purged = self
                    .clean_metadata(schema, client_timestamp)
                    .await
                    .map_err(|e| e.at_stage(SyncStage::MetadataCleaning))?;
                scope.last_cleanup_timestamp = client_timestamp;
                debug!(purged, up_to = client_timestamp, "tombstones purged");
            }

            context.stage = SyncStage::ScopeWriting;
            let now = Utc::now();
            if scope.schema.is_none() {
                scope.schema = Some(schema.clone());
            }
            scope.last_sync_timestamp = client_timestamp;
            scope.last_server_sync_timestamp = server_timestamp;
            scope.is_new_scope = false;
            scope.last_sync = Some(now);
            scope.last_sync_duration_ms = (now - context.start_time).num_milliseconds();
            self.adapter
                .save_scope(&scope)
                .await
                .map_err(|e| e.at_stage(SyncStage::ScopeWriting))?;
            self.adapter
                .commit_transaction()
                .await
                .map_err(|e| e.at_stage(SyncStage::ScopeWriting))?;
            Ok::<_, Error>((context, applied, scope))
        }
        .await;

        match outcome {
            Ok((context, applied, scope)) => {
                info!(
                    applied = applied.total_applied_changes(),
                    watermark = scope.last_sync_timestamp,
                    server_watermark = scope.last_server_sync_timestamp,
                    "remote changes applied locally"
                );
                Ok((context, applied, scope))
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Purge the tombstones uploaded up to `up_to`. Every one of them was
    /// applied by the remote side in this round or an earlier one.
    async fn clean_metadata(&mut self, schema: &SyncSchema, up_to: Timestamp) -> Result<usize> {
        let mut purged = 0;
        for table in &schema.tables {
            purged += self.adapter.delete_metadata(table, up_to).await?;
        }
        Ok(purged)
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.adapter.rollback_transaction().await {
            warn!(error = %e, "rollback failed");
        }
    }
}

/// The remote side of a round.
#[async_trait]
pub trait RemoteOrchestrator: Send {
    /// Return the authoritative schema, restricted to the requested tables.
    async fn ensure_schema(&mut self, request: EnsureSchemaRequest) -> Result<EnsureSchemaResponse>;

    /// Apply the caller's changes, then return the changes the caller has
    /// not seen yet.
    async fn apply_then_get_changes(
        &mut self,
        request: SendChangesRequest,
    ) -> Result<SendChangesResponse>;
}

/// Serves the remote side from a local adapter, in process.
pub struct ServerOrchestrator<A> {
    adapter: A,
    schema: SyncSchema,
    options: SyncOptions,
    interceptors: Arc<Interceptors>,
}

impl<A: SyncAdapter> ServerOrchestrator<A> {
    pub fn new(adapter: A, schema: SyncSchema, options: SyncOptions) -> Self {
        Self::with_interceptors(adapter, schema, options, Arc::new(Interceptors::new()))
    }

    pub fn with_interceptors(
        adapter: A,
        schema: SyncSchema,
        options: SyncOptions,
        interceptors: Arc<Interceptors>,
    ) -> Self {
        Self {
            adapter,
            schema,
            options,
            interceptors,
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn schema(&self) -> &SyncSchema {
        &self.schema
    }

    async fn apply_then_select(
        &mut self,
        mut context: SyncContext,
        scope: &ScopeInfo,
        changes: ChangeBatch,
    ) -> Result<SendChangesResponse> {
        context.sync_way = SyncWay::Upload;
        let mut message = ApplyChangesMessage {
            schema: self.schema.clone(),
            changes,
            applying_scope_id: scope.id,
            reference_timestamp: scope.last_server_sync_timestamp,
            policy: self.schema.conflict_resolution_policy,
            is_new: false,
            disable_constraints_on_apply_changes: self.options.disable_constraints_on_apply_changes,
            use_bulk_operations: self.options.use_bulk_operations,
        };
        let (mut context, changes_applied) =
            ChangeApplier::new(&mut self.adapter, self.interceptors.as_ref())
                .apply_changes(context, &mut message)
                .await?;

        context.sync_way = SyncWay::Download;
        context.stage = SyncStage::TableChangesSelecting;
        let stage = context.stage;
        let server_timestamp = self
            .adapter
            .current_timestamp()
            .await
            .map_err(|e| e.at_stage(stage))?;

        // a client without data gets everything, minus tombstones
        let selection = if context.sync_type != SyncType::Normal {
            Selection {
                since: 0,
                excluded_scope: None,
                include_deletes: false,
            }
        } else if scope.is_new_scope {
            Selection {
                since: 0,
                excluded_scope: Some(scope.id),
                include_deletes: false,
            }
        } else {
            Selection {
                since: scope.last_server_sync_timestamp,
                excluded_scope: Some(scope.id),
                include_deletes: true,
            }
        };
        let changes = select_changes(&mut self.adapter, &self.schema, SyncWay::Download, &selection)
            .await
            .map_err(|e| e.at_stage(stage))?;
        let changes_selected = DatabaseChangesSelected::from_batch(&changes);

        context.stage = SyncStage::TableChangesSelected;
        self.interceptors
            .table_changes_selected
            .fire(&ChangesSelectedArgs {
                context: context.clone(),
                changes: changes_selected.clone(),
            });

        Ok(SendChangesResponse {
            context,
            changes,
            server_timestamp,
            changes_applied,
            changes_selected,
        })
    }
}

#[async_trait]
impl<A: SyncAdapter> RemoteOrchestrator for ServerOrchestrator<A> {
    async fn ensure_schema(&mut self, request: EnsureSchemaRequest) -> Result<EnsureSchemaResponse> {
        let mut context = request.context;
        context.stage = SyncStage::SchemaReading;
        let schema = self
            .schema
            .subset(&request.tables)
            .map_err(|e| e.at_stage(SyncStage::SchemaReading))?;
        debug!(scope = %request.scope_name, tables = schema.tables.len(), "schema requested");
        Ok(EnsureSchemaResponse { context, schema })
    }

    async fn apply_then_get_changes(
        &mut self,
        request: SendChangesRequest,
    ) -> Result<SendChangesResponse> {
        let SendChangesRequest {
            context,
            scope,
            changes,
        } = request;
        info!(
            provider = self.adapter.provider_name(),
            client = %scope.id,
            rows = changes.total_rows(),
            "applying client changes"
        );

        self.adapter
            .begin_transaction()
            .await
            .map_err(|e| e.at_stage(SyncStage::DatabaseChangesApplying))?;

        match self.apply_then_select(context, &scope, changes).await {
            Ok(response) => {
                self.adapter
                    .commit_transaction()
                    .await
                    .map_err(|e| e.at_stage(SyncStage::TableChangesSelected))?;
                info!(
                    client = %scope.id,
                    rows = response.changes_selected.total_changes_selected(),
                    server_timestamp = response.server_timestamp,
                    "server changes selected"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(client = %scope.id, error = %e, "client changes rolled back");
                if let Err(rollback) = self.adapter.rollback_transaction().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}
