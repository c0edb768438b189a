//! Change-application round tests for dualsync-engine
//!
//! These drive `ChangeApplier` directly against a `MemoryStore` and check
//! ordering, conflict handling and the round's bookkeeping.

use dualsync_engine::{
    ApplyChangesMessage, ChangeApplier, ChangeBatch, ColumnDef, ColumnType,
    ConflictResolution, ConflictResolutionPolicy, ConflictType, DatabaseChangesApplied, Error,
    Interceptors, MemoryStore, RowState, RowValues, SyncAdapter, SyncContext, SyncDirection,
    SyncRow, SyncSchema, SyncStage, SyncType, SyncWay, TableDescription, Timestamp, WriteKind,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn values(v: serde_json::Value) -> RowValues {
    v.as_object().cloned().unwrap()
}

fn parent_child_schema() -> SyncSchema {
    SyncSchema::new()
        .with_table(TableDescription::new(
            "Parent",
            vec![
                ColumnDef::required("id", ColumnType::Int),
                ColumnDef::optional("name", ColumnType::String),
            ],
            vec!["id"],
        ))
        .with_table(
            TableDescription::new(
                "Child",
                vec![
                    ColumnDef::required("id", ColumnType::Int),
                    ColumnDef::required("parentId", ColumnType::Int),
                ],
                vec!["id"],
            )
            .with_foreign_key("parentId", "Parent", "id"),
        )
}

fn catalog_schema() -> SyncSchema {
    SyncSchema::new()
        .with_table(TableDescription::new(
            "Category",
            vec![
                ColumnDef::required("id", ColumnType::Int),
                ColumnDef::required("name", ColumnType::String).unique(),
            ],
            vec!["id"],
        ))
        .with_table(
            TableDescription::new(
                "Product",
                vec![
                    ColumnDef::required("id", ColumnType::Int),
                    ColumnDef::required("categoryId", ColumnType::Int),
                    ColumnDef::optional("name", ColumnType::String),
                ],
                vec!["id"],
            )
            .with_foreign_key("categoryId", "Category", "id"),
        )
}

fn message(
    schema: &SyncSchema,
    rows: Vec<SyncRow>,
    scope: Uuid,
    reference: Timestamp,
    policy: ConflictResolutionPolicy,
) -> ApplyChangesMessage {
    let mut changes = ChangeBatch::new();
    changes.extend(rows);
    ApplyChangesMessage {
        schema: schema.clone(),
        changes,
        applying_scope_id: scope,
        reference_timestamp: reference,
        policy,
        is_new: false,
        disable_constraints_on_apply_changes: false,
        use_bulk_operations: true,
    }
}

fn context(way: SyncWay, sync_type: SyncType) -> SyncContext {
    let mut context = SyncContext::new(sync_type);
    context.sync_way = way;
    context
}

async fn apply(
    store: &mut MemoryStore,
    interceptors: &Interceptors,
    message: &mut ApplyChangesMessage,
    way: SyncWay,
) -> Result<(SyncContext, DatabaseChangesApplied), Error> {
    ChangeApplier::new(store, interceptors)
        .apply_changes(context(way, SyncType::Normal), message)
        .await
}

/// Table and kind of every row write after `from`.
fn writes_since(store: &MemoryStore, from: usize) -> Vec<(String, WriteKind)> {
    store.write_log()[from..]
        .iter()
        .map(|w| (w.table.clone(), w.kind))
        .collect()
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn deletes_children_before_parents() {
    let schema = parent_child_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Parent", values(json!({"id": 1, "name": "p"}))).unwrap();
    store.upsert("Child", values(json!({"id": 1, "parentId": 1}))).unwrap();
    let start = store.write_log().len();

    // parent delete staged first on purpose
    let rows = vec![
        SyncRow::deleted("Parent", values(json!({"id": 1}))).at(1),
        SyncRow::deleted("Child", values(json!({"id": 1}))).at(1),
    ];
    let mut message = message(&schema, rows, Uuid::new_v4(), 100, Default::default());
    let (_, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Download)
        .await
        .unwrap();

    assert_eq!(
        writes_since(&store, start),
        vec![
            ("Child".to_string(), WriteKind::Delete),
            ("Parent".to_string(), WriteKind::Delete),
        ]
    );
    assert_eq!(applied.total_applied_changes(), 2);
    assert!(store.rows("Parent").is_empty());
}

#[tokio::test]
async fn inserts_parents_before_children() {
    let schema = parent_child_schema();
    let mut store = MemoryStore::new("replica", schema.clone());

    let rows = vec![
        SyncRow::modified("Child", values(json!({"id": 2, "parentId": 2}))),
        SyncRow::modified("Parent", values(json!({"id": 2, "name": "p"}))),
    ];
    let mut message = message(&schema, rows, Uuid::new_v4(), 0, Default::default());
    apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Download)
        .await
        .unwrap();

    assert_eq!(
        writes_since(&store, 0),
        vec![
            ("Parent".to_string(), WriteKind::Upsert),
            ("Child".to_string(), WriteKind::Upsert),
        ]
    );
    assert!(!message.changes.has_data());
}

#[tokio::test]
async fn category_product_scenario_order() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 1, "name": "Bikes"}))).unwrap();
    store
        .upsert("Product", values(json!({"id": 1, "categoryId": 1, "name": "Road"})))
        .unwrap();
    let start = store.write_log().len();

    let rows = vec![
        SyncRow::modified("Category", values(json!({"id": 1, "name": "Cycles"}))),
        SyncRow::modified("Category", values(json!({"id": 2, "name": "Parts"}))),
        SyncRow::deleted("Product", values(json!({"id": 1}))).at(1),
    ];
    let mut message = message(&schema, rows, Uuid::new_v4(), 100, Default::default());
    apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Download)
        .await
        .unwrap();

    let keys: Vec<_> = store.write_log()[start..]
        .iter()
        .map(|w| (w.table.as_str(), w.kind, w.key.as_ref().map(|k| k.to_string())))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("Product", WriteKind::Delete, Some("[1]".to_string())),
            ("Category", WriteKind::Upsert, Some("[1]".to_string())),
            ("Category", WriteKind::Upsert, Some("[2]".to_string())),
        ]
    );
}

#[tokio::test]
async fn table_interceptors_follow_apply_order() {
    let schema = parent_child_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Parent", values(json!({"id": 1}))).unwrap();
    store.upsert("Child", values(json!({"id": 1, "parentId": 1}))).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let mut interceptors = Interceptors::new();
    let applying = events.clone();
    interceptors.on_table_changes_applying(move |args| {
        applying
            .lock()
            .unwrap()
            .push(format!("{} {}", args.state, args.table));
    });
    let round = events.clone();
    interceptors.on_database_changes_applied(move |args| {
        round
            .lock()
            .unwrap()
            .push(format!("applied {}", args.applied.total_applied_changes()));
    });

    let rows = vec![
        SyncRow::modified("Child", values(json!({"id": 2, "parentId": 2}))),
        SyncRow::deleted("Parent", values(json!({"id": 1}))).at(1),
        SyncRow::modified("Parent", values(json!({"id": 2}))),
        SyncRow::deleted("Child", values(json!({"id": 1}))).at(1),
    ];
    let mut message = message(&schema, rows, Uuid::new_v4(), 100, Default::default());
    apply(&mut store, &interceptors, &mut message, SyncWay::Download)
        .await
        .unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "Deleted Child",
            "Deleted Parent",
            "Modified Parent",
            "Modified Child",
            "applied 4",
        ]
    );
}

#[tokio::test]
async fn new_target_skips_deletes() {
    let schema = parent_child_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Parent", values(json!({"id": 1}))).unwrap();

    let rows = vec![SyncRow::deleted("Parent", values(json!({"id": 1}))).at(1)];
    let mut message = message(&schema, rows, Uuid::new_v4(), 100, Default::default());
    message.is_new = true;
    let (_, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Download)
        .await
        .unwrap();

    assert_eq!(store.rows("Parent").len(), 1);
    assert!(applied.table_changes_applied.is_empty());
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn server_wins_keeps_local_version() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 1, "name": "v1"}))).unwrap();
    for version in 2..=5 {
        store
            .upsert("Category", values(json!({"id": 1, "name": format!("v{version}")})))
            .unwrap();
    }
    assert_eq!(store.clock().current(), 5);
    store.upsert("Category", values(json!({"id": 1, "name": "local"}))).unwrap();

    let remote = SyncRow::modified("Category", values(json!({"id": 1, "name": "remote"}))).at(6);
    let mut message = message(
        &schema,
        vec![remote],
        Uuid::new_v4(),
        5,
        ConflictResolutionPolicy::ServerWins,
    );
    let writes = store.write_log().len();
    let (context, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Upload)
        .await
        .unwrap();

    assert_eq!(applied.conflicts.len(), 1);
    assert_eq!(applied.conflicts[0].kind, ConflictType::RemoteExistsLocalExists);
    assert_eq!(store.write_log().len(), writes);
    let stored = store.get("Category", &values(json!({"id": 1}))).unwrap();
    assert_eq!(stored["name"], "local");

    let summary = applied.get("Category", RowState::Modified).unwrap();
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(context.total_sync_conflicts, 0);
}

#[tokio::test]
async fn forced_delete_counts_one_conflict() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 1, "name": "Bikes"}))).unwrap();
    store.upsert("Category", values(json!({"id": 1, "name": "Cycles"}))).unwrap();

    let delete = SyncRow::deleted("Category", values(json!({"id": 1}))).at(1);
    let mut message = message(
        &schema,
        vec![delete],
        Uuid::new_v4(),
        1,
        ConflictResolutionPolicy::ClientWins,
    );
    let (context, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Download)
        .await
        .unwrap();

    assert_eq!(applied.conflicts[0].kind, ConflictType::RemoteIsDeletedLocalExists);
    assert!(store.rows("Category").is_empty());
    assert_eq!(context.total_sync_conflicts, 1);
    assert_eq!(applied.total_applied_changes(), 1);
}

#[tokio::test]
async fn both_deleted_writes_nothing() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 1, "name": "Bikes"}))).unwrap();
    store.delete("Category", values(json!({"id": 1}))).unwrap();
    let writes = store.write_log().len();

    let delete = SyncRow::deleted("Category", values(json!({"id": 1}))).at(1);
    let mut message = message(
        &schema,
        vec![delete],
        Uuid::new_v4(),
        1,
        ConflictResolutionPolicy::ClientWins,
    );
    let (context, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Download)
        .await
        .unwrap();

    assert_eq!(applied.conflicts[0].kind, ConflictType::RemoteIsDeletedLocalIsDeleted);
    assert_eq!(store.write_log().len(), writes);
    assert_eq!(context.total_sync_conflicts, 0);
    let summary = applied.get("Category", RowState::Deleted).unwrap();
    assert_eq!((summary.applied, summary.failed), (0, 1));
}

#[tokio::test]
async fn unique_violation_becomes_conflict() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 1, "name": "Bikes"}))).unwrap();

    let duplicate = SyncRow::modified("Category", values(json!({"id": 3, "name": "Bikes"})));
    let mut message = message(
        &schema,
        vec![duplicate],
        Uuid::new_v4(),
        10,
        ConflictResolutionPolicy::ServerWins,
    );
    let (_, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Upload)
        .await
        .unwrap();

    let conflict = &applied.conflicts[0];
    assert_eq!(conflict.kind, ConflictType::UniqueKeyConstraint);
    assert!(conflict.error_message.as_deref().unwrap().contains("name"));
    assert!(conflict.local_row.is_none());
    assert_eq!(applied.total_applied_changes_failed(), 1);
}

#[tokio::test]
async fn rollback_aborts_round_with_stage() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 1, "name": "Bikes"}))).unwrap();
    store.upsert("Category", values(json!({"id": 1, "name": "Cycles"}))).unwrap();

    let mut interceptors = Interceptors::new();
    interceptors.on_apply_changes_failed(|args| args.resolution = ConflictResolution::Rollback);

    let rows = vec![
        SyncRow::modified("Category", values(json!({"id": 2, "name": "Parts"}))),
        SyncRow::modified("Category", values(json!({"id": 1, "name": "remote"}))),
    ];
    let mut message = message(&schema, rows, Uuid::new_v4(), 1, Default::default());

    store.begin_transaction().await.unwrap();
    let err = apply(&mut store, &interceptors, &mut message, SyncWay::Upload)
        .await
        .unwrap_err();
    store.rollback_transaction().await.unwrap();

    assert!(err.is_rollback());
    assert_eq!(err.stage(), Some(SyncStage::TableChangesApplying));
    assert_eq!(store.rows("Category").len(), 1);
    assert!(message.changes.has_data());
}

#[tokio::test]
async fn client_wins_on_unique_violation_aborts_round() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 2, "name": "Cars"}))).unwrap();

    let incoming = SyncRow::modified("Category", values(json!({"id": 3, "name": "Cars"})));
    let mut message = message(
        &schema,
        vec![incoming],
        Uuid::new_v4(),
        10,
        ConflictResolutionPolicy::ClientWins,
    );

    store.begin_transaction().await.unwrap();
    let err = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Upload)
        .await
        .unwrap_err();
    store.rollback_transaction().await.unwrap();

    assert!(matches!(err.root(), Error::ConstraintViolation { .. }));
    assert_eq!(err.stage(), Some(SyncStage::TableChangesApplying));
    assert!(store.get("Category", &values(json!({"id": 3}))).is_none());
    assert!(message.changes.has_data());
}

#[tokio::test]
async fn delete_without_tombstone_is_a_cleaned_up_conflict() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 1, "name": "Bikes"}))).unwrap();
    store.upsert("Category", values(json!({"id": 1, "name": "Cycles"}))).unwrap();

    // no origin timestamp: the sender no longer tracks this delete
    let delete = || vec![SyncRow::deleted("Category", values(json!({"id": 1})))];

    let mut keep = message(
        &schema,
        delete(),
        Uuid::new_v4(),
        1,
        ConflictResolutionPolicy::ServerWins,
    );
    let (context, applied) = apply(&mut store, &Interceptors::new(), &mut keep, SyncWay::Download)
        .await
        .unwrap();
    assert_eq!(
        applied.conflicts[0].kind,
        ConflictType::RemoteCleanedupDeleteLocalUpdate
    );
    let stored = store.get("Category", &values(json!({"id": 1}))).unwrap();
    assert_eq!(stored["name"], "Cycles");
    assert_eq!(context.total_sync_conflicts, 0);

    let mut force = message(
        &schema,
        delete(),
        Uuid::new_v4(),
        1,
        ConflictResolutionPolicy::ClientWins,
    );
    store.begin_transaction().await.unwrap();
    let err = apply(&mut store, &Interceptors::new(), &mut force, SyncWay::Download)
        .await
        .unwrap_err();
    store.rollback_transaction().await.unwrap();
    assert!(matches!(
        err.root(),
        Error::UnresolvableConflict {
            kind: ConflictType::RemoteCleanedupDeleteLocalUpdate,
            ..
        }
    ));
    assert_eq!(store.rows("Category").len(), 1);
}

// ============================================================================
// Constraints, directions and modes
// ============================================================================

#[tokio::test]
async fn missing_parent_is_fatal_unless_constraints_disabled() {
    let schema = parent_child_schema();
    let orphan = || vec![SyncRow::modified("Child", values(json!({"id": 1, "parentId": 9})))];

    let mut store = MemoryStore::new("replica", schema.clone());
    let mut strict = message(&schema, orphan(), Uuid::new_v4(), 0, Default::default());
    let err = apply(&mut store, &Interceptors::new(), &mut strict, SyncWay::Download)
        .await
        .unwrap_err();
    assert!(matches!(err.root(), Error::ConstraintViolation { .. }));
    assert_eq!(err.stage(), Some(SyncStage::TableChangesApplying));

    let mut relaxed = message(&schema, orphan(), Uuid::new_v4(), 0, Default::default());
    relaxed.disable_constraints_on_apply_changes = true;
    apply(&mut store, &Interceptors::new(), &mut relaxed, SyncWay::Download)
        .await
        .unwrap();
    assert_eq!(store.rows("Child").len(), 1);
    assert!(store.constraints_enabled());
}

#[tokio::test]
async fn direction_forbidden_tables_are_untouched() {
    let schema = SyncSchema::new().with_table(
        TableDescription::new(
            "AuditLog",
            vec![ColumnDef::required("id", ColumnType::Int)],
            vec!["id"],
        )
        .with_direction(SyncDirection::UploadOnly),
    );
    let mut store = MemoryStore::new("replica", schema.clone());

    let rows = vec![SyncRow::modified("AuditLog", values(json!({"id": 1})))];
    let mut message = message(&schema, rows, Uuid::new_v4(), 0, Default::default());
    let (_, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Download)
        .await
        .unwrap();

    assert!(store.write_log().is_empty());
    assert!(applied.table_changes_applied.is_empty());
}

#[tokio::test]
async fn reinitialize_resets_permitted_tables_in_reverse() {
    let schema = parent_child_schema().with_table(
        TableDescription::new(
            "AuditLog",
            vec![ColumnDef::required("id", ColumnType::Int)],
            vec!["id"],
        )
        .with_direction(SyncDirection::UploadOnly),
    );
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Parent", values(json!({"id": 1}))).unwrap();
    store.upsert("Child", values(json!({"id": 1, "parentId": 1}))).unwrap();
    store.upsert("AuditLog", values(json!({"id": 1}))).unwrap();
    let start = store.write_log().len();

    let rows = vec![SyncRow::modified("Parent", values(json!({"id": 5})))];
    let mut message = message(&schema, rows, Uuid::new_v4(), 0, Default::default());
    ChangeApplier::new(&mut store, &Interceptors::new())
        .apply_changes(context(SyncWay::Download, SyncType::Reinitialize), &mut message)
        .await
        .unwrap();

    assert_eq!(
        writes_since(&store, start),
        vec![
            ("Child".to_string(), WriteKind::Reset),
            ("Parent".to_string(), WriteKind::Reset),
            ("Parent".to_string(), WriteKind::Upsert),
        ]
    );
    assert_eq!(store.rows("Parent").len(), 1);
    assert!(store.rows("Child").is_empty());
    assert_eq!(store.rows("AuditLog").len(), 1);
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let schema = parent_child_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Parent", values(json!({"id": 1}))).unwrap();

    let fired = Arc::new(Mutex::new(0));
    let mut interceptors = Interceptors::new();
    let counter = fired.clone();
    interceptors.on_database_changes_applying(move |_| *counter.lock().unwrap() += 1);

    let mut message = message(&schema, Vec::new(), Uuid::new_v4(), 0, Default::default());
    let (context, applied) = ChangeApplier::new(&mut store, &interceptors)
        .apply_changes(context(SyncWay::Download, SyncType::Reinitialize), &mut message)
        .await
        .unwrap();

    assert_eq!(*fired.lock().unwrap(), 0);
    assert_eq!(applied, DatabaseChangesApplied::default());
    assert_eq!(context.stage, SyncStage::None);
    assert_eq!(store.rows("Parent").len(), 1);
}

// ============================================================================
// Redelivery and bulk mode
// ============================================================================

#[tokio::test]
async fn redelivered_download_writes_nothing() {
    let schema = catalog_schema();
    let mut store = MemoryStore::new("replica", schema.clone());
    store.upsert("Category", values(json!({"id": 9, "name": "Old"}))).unwrap();
    let scope = Uuid::new_v4();
    let reference = store.clock().current();

    let delta = || {
        vec![
            SyncRow::modified("Category", values(json!({"id": 1, "name": "Bikes"}))),
            SyncRow::modified("Product", values(json!({"id": 1, "categoryId": 1}))),
            SyncRow::deleted("Category", values(json!({"id": 9}))).at(1),
        ]
    };

    let mut first = message(&schema, delta(), scope, reference, Default::default());
    apply(&mut store, &Interceptors::new(), &mut first, SyncWay::Download)
        .await
        .unwrap();
    let writes = store.write_log().len();

    let mut again = message(&schema, delta(), scope, reference, Default::default());
    let (_, applied) = apply(&mut store, &Interceptors::new(), &mut again, SyncWay::Download)
        .await
        .unwrap();

    assert_eq!(store.write_log().len(), writes);
    assert!(applied.conflicts.is_empty());
    assert_eq!(applied.total_applied_changes(), 3);
}

#[tokio::test]
async fn bulk_and_row_by_row_are_equivalent() {
    let schema = catalog_schema();
    let seed = |bulk: bool| {
        let mut store = MemoryStore::new("replica", schema.clone()).with_bulk_operations(bulk);
        store.upsert("Category", values(json!({"id": 1, "name": "Bikes"}))).unwrap();
        store.upsert("Category", values(json!({"id": 2, "name": "Parts"}))).unwrap();
        store.upsert("Category", values(json!({"id": 2, "name": "Spares"}))).unwrap();
        store
    };
    let scope = Uuid::new_v4();
    let delta = || {
        vec![
            SyncRow::modified("Category", values(json!({"id": 1, "name": "Cycles"}))),
            SyncRow::modified("Category", values(json!({"id": 2, "name": "Components"}))),
            SyncRow::modified("Category", values(json!({"id": 4, "name": "Cycles"}))),
            SyncRow::deleted("Category", values(json!({"id": 7}))).at(1),
        ]
    };

    let mut outcomes = Vec::new();
    for bulk in [true, false] {
        let mut store = seed(bulk);
        let mut message = message(&schema, delta(), scope, 2, ConflictResolutionPolicy::ClientWins);
        message.use_bulk_operations = bulk;
        let (context, applied) = apply(&mut store, &Interceptors::new(), &mut message, SyncWay::Upload)
            .await
            .unwrap();
        let rows: Vec<RowValues> = store.rows("Category").into_iter().cloned().collect();
        outcomes.push((context.total_sync_conflicts, applied, rows));
    }

    assert_eq!(outcomes[0], outcomes[1]);
}
