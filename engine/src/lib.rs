//! # Dualsync Engine
//!
//! Row-level synchronization between two database replicas.
//!
//! Each replica tracks, for every row it ever held, the logical timestamp of
//! the last write and the scope that made it. A round sends the local
//! changes made since the last successful round to the remote side, applies
//! them there, brings back the remote changes the local side has not seen,
//! and applies those locally. Watermarks only move once both legs succeeded.
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: stores plug in through [`SyncAdapter`] and
//!   [`ScopeRegistry`]; the engine never talks to a database directly
//! - **Atomic rounds**: each side writes a round in one transaction; a
//!   failed or cancelled round leaves rows and watermarks untouched
//! - **Total conflict handling**: every failed conditional write is
//!   classified by [`classify`] and resolved, never dropped
//!
//! ## Core Concepts
//!
//! ### Rows and tracking
//!
//! A [`SyncRow`] carries the column values of a changed row, its
//! [`RowState`], its origin timestamp and the scope that last wrote it.
//! Deleted rows leave a tombstone in the tracking store.
//!
//! ### Schema
//!
//! A [`SyncSchema`] lists the synced tables in dependency order. Deletes are
//! applied walking it backwards, inserts and updates walking it forwards.
//!
//! ### Conflicts
//!
//! A write is conditional on the stored row not having changed since the
//! reference timestamp. When it fails, the [`ConflictType`] is derived from
//! what both sides know about the row, and the policy (possibly overridden by
//! an interceptor) decides what is written:
//! - [`ConflictResolutionPolicy::ServerWins`] - keep the stored row (default)
//! - [`ConflictResolutionPolicy::ClientWins`] - force the incoming row
//!
//! The local leg always resolves with the complement of the remote policy, so
//! both legs agree on the winner.
//!
//! ## Quick Start
//!
//! ```rust
//! use dualsync_engine::{
//!     ColumnDef, ColumnType, LocalOrchestrator, MemoryStore, ServerOrchestrator, SyncAgent,
//!     SyncOptions, SyncSchema, TableDescription,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> dualsync_engine::error::Result<()> {
//! let schema = SyncSchema::new().with_table(TableDescription::new(
//!     "Customer",
//!     vec![
//!         ColumnDef::required("id", ColumnType::Int),
//!         ColumnDef::optional("name", ColumnType::String),
//!     ],
//!     vec!["id"],
//! ));
//!
//! let mut server = MemoryStore::new("server", schema.clone());
//! server.upsert("Customer", json!({"id": 1, "name": "Ada"}).as_object().cloned().unwrap())?;
//!
//! let client = MemoryStore::new("client", schema.clone());
//! let mut agent = SyncAgent::new(
//!     LocalOrchestrator::new(client, SyncOptions::default()),
//!     ServerOrchestrator::new(server, schema, SyncOptions::default()),
//! );
//!
//! let context = agent.synchronize().await?;
//! assert_eq!(context.total_changes_downloaded, 1);
//! assert_eq!(agent.local().adapter().rows("Customer").len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod agent;
pub mod apply;
pub mod batch;
pub mod clock;
pub mod conflict;
pub mod error;
pub mod interceptor;
pub mod memory;
pub mod messages;
pub mod options;
pub mod orchestrator;
pub mod resolver;
pub mod row;
pub mod schema;
pub mod scope;

// Re-export main types at crate root
pub use adapter::{RowWrite, ScopeRegistry, SyncAdapter};
pub use agent::SyncAgent;
pub use apply::{ApplyChangesMessage, ChangeApplier, DatabaseChangesApplied, TableChangesApplied};
pub use batch::{ChangeBatch, DatabaseChangesSelected, TableChangesSelected};
pub use clock::LogicalClock;
pub use conflict::{
    classify, ApplyAction, Conflict, ConflictFacts, ConflictResolution, ConflictResolutionPolicy,
    ConflictType,
};
pub use error::Error;
pub use interceptor::Interceptors;
pub use memory::{MemoryStore, WriteEvent, WriteKind};
pub use messages::{
    EnsureSchemaRequest, EnsureSchemaResponse, SendChangesRequest, SendChangesResponse,
};
pub use options::{SyncOptions, DEFAULT_SCOPE_NAME};
pub use orchestrator::{LocalChanges, LocalOrchestrator, RemoteOrchestrator, ServerOrchestrator};
pub use resolver::{ConflictResolver, Resolution};
pub use row::{RowKey, RowMetadata, RowState, RowValues, SyncRow};
pub use schema::{ColumnDef, ColumnType, ForeignKey, SyncDirection, SyncSchema, TableDescription};
pub use scope::{ScopeInfo, SessionState, SyncContext, SyncStage, SyncType, SyncWay};

/// Type aliases for clarity
pub type TableName = String;
pub type ScopeId = uuid::Uuid;
pub type Timestamp = u64;
