//! Property tests for dualsync-engine

use dualsync_engine::{
    classify, ApplyChangesMessage, ChangeApplier, ChangeBatch, ColumnDef, ColumnType,
    ConflictFacts, ConflictResolutionPolicy, ConflictType, Interceptors, MemoryStore, RowValues,
    SyncContext, SyncRow, SyncSchema, SyncType, SyncWay, TableDescription,
};
use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

fn arb_facts() -> impl Strategy<Value = ConflictFacts> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(local_exists, local_tombstoned, remote_exists, remote_tombstoned, constraint)| {
            ConflictFacts {
                local_exists,
                local_tombstoned,
                remote_exists,
                remote_tombstoned,
                constraint_violation: constraint,
            }
        },
    )
}

fn arb_policy() -> impl Strategy<Value = ConflictResolutionPolicy> {
    prop_oneof![
        Just(ConflictResolutionPolicy::ServerWins),
        Just(ConflictResolutionPolicy::ClientWins),
    ]
}

/// A change to one of a handful of rows, so batches collide with the seed.
fn arb_row() -> impl Strategy<Value = SyncRow> {
    (1i64..6, any::<bool>(), "[a-z]{1,6}").prop_map(|(id, delete, note)| {
        if delete {
            SyncRow::deleted("Item", json!({ "id": id }).as_object().cloned().unwrap()).at(1)
        } else {
            SyncRow::modified(
                "Item",
                json!({ "id": id, "note": note }).as_object().cloned().unwrap(),
            )
        }
    })
}

fn item_schema() -> SyncSchema {
    SyncSchema::new().with_table(TableDescription::new(
        "Item",
        vec![
            ColumnDef::required("id", ColumnType::Int),
            ColumnDef::optional("note", ColumnType::String),
        ],
        vec!["id"],
    ))
}

fn seeded_store(bulk: bool) -> MemoryStore {
    let mut store = MemoryStore::new("replica", item_schema()).with_bulk_operations(bulk);
    for id in 1..4 {
        let values: RowValues = json!({ "id": id, "note": "seed" }).as_object().cloned().unwrap();
        store.upsert("Item", values).unwrap();
    }
    store
}

/// Rows are keyed, so a batch holds at most one change per key.
fn dedup(rows: Vec<SyncRow>) -> Vec<SyncRow> {
    let mut seen = std::collections::HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(row.values["id"].as_i64()))
        .collect()
}

fn apply(
    store: &mut MemoryStore,
    rows: Vec<SyncRow>,
    scope: Uuid,
    reference: u64,
    policy: ConflictResolutionPolicy,
) -> SyncContext {
    let mut changes = ChangeBatch::new();
    changes.extend(rows);
    let mut message = ApplyChangesMessage {
        schema: item_schema(),
        changes,
        applying_scope_id: scope,
        reference_timestamp: reference,
        policy,
        is_new: false,
        disable_constraints_on_apply_changes: false,
        use_bulk_operations: true,
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let interceptors = Interceptors::new();
    let mut context = SyncContext::new(SyncType::Normal);
    context.sync_way = SyncWay::Download;
    let (context, _) = runtime
        .block_on(ChangeApplier::new(store, &interceptors).apply_changes(context, &mut message))
        .unwrap();
    context
}

proptest! {
    #[test]
    fn prop_classify_is_total_and_deterministic(facts in arb_facts()) {
        let kind = classify(facts);
        prop_assert!(ConflictType::ALL.contains(&kind));
        prop_assert_eq!(kind, classify(facts));
    }

    #[test]
    fn prop_constraint_violation_dominates(facts in arb_facts()) {
        let facts = ConflictFacts { constraint_violation: true, ..facts };
        prop_assert_eq!(classify(facts), ConflictType::UniqueKeyConstraint);
    }

    #[test]
    fn prop_complement_is_an_involution(policy in arb_policy()) {
        prop_assert_ne!(policy.complement(), policy);
        prop_assert_eq!(policy.complement().complement(), policy);
    }

    #[test]
    fn prop_redelivery_writes_nothing(
        rows in prop::collection::vec(arb_row(), 1..8),
        reference in 0u64..4,
        policy in arb_policy(),
    ) {
        let rows = dedup(rows);
        let scope = Uuid::new_v4();
        let mut store = seeded_store(true);

        apply(&mut store, rows.clone(), scope, reference, policy);
        let writes = store.write_log().len();
        let snapshot: Vec<RowValues> = store.rows("Item").into_iter().cloned().collect();

        let context = apply(&mut store, rows, scope, reference, policy);
        prop_assert_eq!(store.write_log().len(), writes);
        prop_assert_eq!(context.total_sync_conflicts, 0);
        let after: Vec<RowValues> = store.rows("Item").into_iter().cloned().collect();
        prop_assert_eq!(after, snapshot);
    }

    #[test]
    fn prop_bulk_matches_row_by_row(
        rows in prop::collection::vec(arb_row(), 1..8),
        reference in 0u64..4,
        policy in arb_policy(),
    ) {
        let rows = dedup(rows);
        let scope = Uuid::new_v4();

        let mut bulk = seeded_store(true);
        let mut single = seeded_store(false);
        let bulk_context = apply(&mut bulk, rows.clone(), scope, reference, policy);
        let single_context = apply(&mut single, rows, scope, reference, policy);

        prop_assert_eq!(bulk_context.total_sync_conflicts, single_context.total_sync_conflicts);
        prop_assert_eq!(bulk.rows("Item"), single.rows("Item"));
        prop_assert_eq!(bulk.write_log(), single.write_log());
    }
}
