//! PostgreSQL change tracking store.
//!
//! Rows of every synced table are kept as JSONB in `sync_rows`; their
//! tracking entries, tombstones included, in `sync_tracking`. Timestamps come
//! from `sync_timestamp_seq`, so they increase with every write.

use super::Pool;
use async_trait::async_trait;
use dualsync_engine::{
    error::Result, Error, RowKey, RowMetadata, RowState, RowValues, RowWrite, ScopeId,
    SyncAdapter, SyncRow, SyncSchema, TableDescription, Timestamp,
};
use serde_json::Value;
use sqlx::{PgConnection, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

/// Key of the advisory lock that serializes rounds across server processes.
const ROUND_LOCK_KEY: i64 = 0x6473_796e_63;

fn store_error(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn object(value: Value, what: &str) -> Result<RowValues> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Store(format!("{what} is not a JSON object: {other}"))),
    }
}

/// A `SyncAdapter` over the server's Postgres database.
///
/// Every call must happen inside a transaction opened with
/// `begin_transaction`.
pub struct PgAdapter {
    pool: Pool,
    schema: Arc<SyncSchema>,
    tx: Option<Transaction<'static, Postgres>>,
    constraints_enabled: bool,
    bulk_operations: bool,
}

impl PgAdapter {
    pub fn new(pool: Pool, schema: Arc<SyncSchema>) -> Self {
        Self {
            pool,
            schema,
            tx: None,
            constraints_enabled: true,
            bulk_operations: true,
        }
    }

    /// Builder-style method to toggle prefetching bulk writes.
    pub fn with_bulk_operations(mut self, enabled: bool) -> Self {
        self.bulk_operations = enabled;
        self
    }

    fn conn(&mut self) -> Result<&mut PgConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(Error::Transaction(
                "postgres adapter used outside a transaction".into(),
            )),
        }
    }

    async fn tracking(&mut self, table: &str, key: &RowKey) -> Result<Option<RowMetadata>> {
        let row = sqlx::query(
            r#"
            SELECT timestamp, update_scope_id, is_tombstone
            FROM sync_tracking
            WHERE table_name = $1 AND row_key = $2
            "#,
        )
        .bind(table)
        .bind(key.as_str())
        .fetch_optional(self.conn()?)
        .await
        .map_err(store_error)?;

        row.map(|row| metadata_from_row(&row)).transpose()
    }

    /// Tracking entries for many keys of one table in a single query.
    async fn tracking_many(
        &mut self,
        table: &str,
        keys: &[RowKey],
    ) -> Result<HashMap<String, RowMetadata>> {
        let keys: Vec<&str> = keys.iter().map(RowKey::as_str).collect();
        let rows = sqlx::query(
            r#"
            SELECT row_key, timestamp, update_scope_id, is_tombstone
            FROM sync_tracking
            WHERE table_name = $1 AND row_key = ANY($2)
            "#,
        )
        .bind(table)
        .bind(&keys)
        .fetch_all(self.conn()?)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                let key: String = row.try_get("row_key").map_err(store_error)?;
                Ok((key, metadata_from_row(row)?))
            })
            .collect()
    }

    async fn stored_row(&mut self, table: &str, key: &RowKey) -> Result<Option<RowValues>> {
        let data: Option<Value> = sqlx::query_scalar(
            "SELECT data FROM sync_rows WHERE table_name = $1 AND row_key = $2",
        )
        .bind(table)
        .bind(key.as_str())
        .fetch_optional(self.conn()?)
        .await
        .map_err(store_error)?;

        data.map(|v| object(v, "stored row")).transpose()
    }

    async fn any_row_with(&mut self, table: &str, column: &str, value: &Value) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM sync_rows WHERE table_name = $1 AND data -> $2 = $3 LIMIT 1",
        )
        .bind(table)
        .bind(column)
        .bind(value)
        .fetch_optional(self.conn()?)
        .await
        .map_err(store_error)?;
        Ok(found.is_some())
    }

    async fn unique_violation(
        &mut self,
        desc: &TableDescription,
        key: &RowKey,
        values: &RowValues,
    ) -> Result<Option<String>> {
        for column in desc.unique_columns() {
            let Some(value) = values.get(&column.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let duplicate: Option<i32> = sqlx::query_scalar(
                r#"
                SELECT 1 FROM sync_rows
                WHERE table_name = $1 AND row_key <> $2 AND data -> $3 = $4
                LIMIT 1
                "#,
            )
            .bind(&desc.name)
            .bind(key.as_str())
            .bind(&column.name)
            .bind(value)
            .fetch_optional(self.conn()?)
            .await
            .map_err(store_error)?;
            if duplicate.is_some() {
                return Ok(Some(format!(
                    "duplicate value {} for unique column '{}'",
                    value, column.name
                )));
            }
        }
        Ok(None)
    }

    async fn check_parents(&mut self, desc: &TableDescription, values: &RowValues) -> Result<()> {
        if !self.constraints_enabled {
            return Ok(());
        }
        for fk in &desc.foreign_keys {
            let Some(value) = values.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            if !self
                .any_row_with(&fk.parent_table, &fk.parent_column, value)
                .await?
            {
                return Err(Error::ConstraintViolation {
                    table: desc.name.clone(),
                    message: format!(
                        "'{}' = {} has no matching row in '{}'",
                        fk.column, value, fk.parent_table
                    ),
                });
            }
        }
        Ok(())
    }

    async fn check_children(&mut self, desc: &TableDescription, values: &RowValues) -> Result<()> {
        if !self.constraints_enabled {
            return Ok(());
        }
        let references: Vec<(String, String, String)> = self
            .schema
            .tables
            .iter()
            .flat_map(|child| {
                child
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.parent_table == desc.name)
                    .map(|fk| (child.name.clone(), fk.column.clone(), fk.parent_column.clone()))
            })
            .collect();

        for (child, column, parent_column) in references {
            let Some(value) = values.get(&parent_column) else {
                continue;
            };
            if self.any_row_with(&child, &column, value).await? {
                return Err(Error::ConstraintViolation {
                    table: desc.name.clone(),
                    message: format!("row is still referenced by '{child}'.'{column}'"),
                });
            }
        }
        Ok(())
    }

    async fn next_timestamp(&mut self) -> Result<i64> {
        sqlx::query_scalar("SELECT nextval('sync_timestamp_seq')")
            .fetch_one(self.conn()?)
            .await
            .map_err(store_error)
    }

    async fn write_upsert(
        &mut self,
        desc: &TableDescription,
        key: &RowKey,
        values: &RowValues,
        scope_id: ScopeId,
    ) -> Result<()> {
        let timestamp = self.next_timestamp().await?;
        let data = Value::Object(values.clone());
        let key_values = Value::Object(desc.key_values(values));

        sqlx::query(
            r#"
            INSERT INTO sync_rows (table_name, row_key, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (table_name, row_key) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&desc.name)
        .bind(key.as_str())
        .bind(&data)
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;

        sqlx::query(
            r#"
            INSERT INTO sync_tracking
                (table_name, row_key, key_values, timestamp, update_scope_id, is_tombstone)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            ON CONFLICT (table_name, row_key) DO UPDATE SET
                key_values = EXCLUDED.key_values,
                timestamp = EXCLUDED.timestamp,
                update_scope_id = EXCLUDED.update_scope_id,
                is_tombstone = FALSE
            "#,
        )
        .bind(&desc.name)
        .bind(key.as_str())
        .bind(&key_values)
        .bind(timestamp)
        .bind(scope_id)
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn write_delete(
        &mut self,
        desc: &TableDescription,
        key: &RowKey,
        values: &RowValues,
        scope_id: ScopeId,
    ) -> Result<()> {
        let timestamp = self.next_timestamp().await?;
        let key_values = Value::Object(desc.key_values(values));

        sqlx::query("DELETE FROM sync_rows WHERE table_name = $1 AND row_key = $2")
            .bind(&desc.name)
            .bind(key.as_str())
            .execute(self.conn()?)
            .await
            .map_err(store_error)?;

        sqlx::query(
            r#"
            INSERT INTO sync_tracking
                (table_name, row_key, key_values, timestamp, update_scope_id, is_tombstone)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            ON CONFLICT (table_name, row_key) DO UPDATE SET
                timestamp = EXCLUDED.timestamp,
                update_scope_id = EXCLUDED.update_scope_id,
                is_tombstone = TRUE
            "#,
        )
        .bind(&desc.name)
        .bind(key.as_str())
        .bind(&key_values)
        .bind(timestamp)
        .bind(scope_id)
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    /// The conditional write shared by single and bulk writes.
    async fn write_row(
        &mut self,
        desc: &TableDescription,
        row: &SyncRow,
        tracking: Option<RowMetadata>,
        scope_id: ScopeId,
        reference: Timestamp,
        force: bool,
    ) -> Result<RowWrite> {
        let key = desc.row_key(&row.values)?;
        let same_scope = tracking.is_some_and(|m| m.update_scope_id == Some(scope_id));
        let permitted = force
            || match tracking {
                None => true,
                Some(m) => m.timestamp <= reference || same_scope,
            };
        if !permitted {
            return Ok(RowWrite::NotApplied);
        }

        let stored = self.stored_row(&desc.name, &key).await?;
        match row.state {
            RowState::Modified => {
                desc.validate_row(&row.values)?;
                if same_scope && stored.as_ref() == Some(&row.values) {
                    return Ok(RowWrite::Applied);
                }
                if let Some(message) = self.unique_violation(desc, &key, &row.values).await? {
                    return Ok(RowWrite::ConstraintViolation(message));
                }
                self.check_parents(desc, &row.values).await?;
                self.write_upsert(desc, &key, &row.values, scope_id).await?;
                Ok(RowWrite::Applied)
            }
            RowState::Deleted => {
                let Some(values) = stored else {
                    let already_deleted = same_scope && tracking.is_some_and(|m| m.is_tombstone);
                    return Ok(if already_deleted {
                        RowWrite::Applied
                    } else {
                        RowWrite::NotApplied
                    });
                };
                self.check_children(desc, &values).await?;
                self.write_delete(desc, &key, &values, scope_id).await?;
                Ok(RowWrite::Applied)
            }
        }
    }
}

fn metadata_from_row(row: &sqlx::postgres::PgRow) -> Result<RowMetadata> {
    let timestamp: i64 = row.try_get("timestamp").map_err(store_error)?;
    Ok(RowMetadata {
        timestamp: timestamp as Timestamp,
        update_scope_id: row.try_get("update_scope_id").map_err(store_error)?,
        is_tombstone: row.try_get("is_tombstone").map_err(store_error)?,
    })
}

#[async_trait]
impl SyncAdapter for PgAdapter {
    fn provider_name(&self) -> &str {
        "postgres"
    }

    fn supports_bulk_operations(&self) -> bool {
        self.bulk_operations
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::Transaction("transaction already open".into()));
        }
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ROUND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        self.tx = Some(tx);
        self.constraints_enabled = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction to commit".into()))?;
        tx.commit().await.map_err(store_error)
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| Error::Transaction("no open transaction to roll back".into()))?;
        tx.rollback().await.map_err(store_error)
    }

    async fn current_timestamp(&mut self) -> Result<Timestamp> {
        let current: i64 = sqlx::query_scalar(
            "SELECT CASE WHEN is_called THEN last_value ELSE 0 END FROM sync_timestamp_seq",
        )
        .fetch_one(self.conn()?)
        .await
        .map_err(store_error)?;
        Ok(current as Timestamp)
    }

    async fn get_changes(
        &mut self,
        table: &TableDescription,
        since: Timestamp,
        excluded_scope: Option<ScopeId>,
    ) -> Result<Vec<SyncRow>> {
        let rows = sqlx::query(
            r#"
            SELECT t.key_values, t.timestamp, t.update_scope_id, t.is_tombstone, r.data
            FROM sync_tracking t
            LEFT JOIN sync_rows r
                ON r.table_name = t.table_name AND r.row_key = t.row_key
            WHERE t.table_name = $1
              AND t.timestamp > $2
              AND ($3::uuid IS NULL OR t.update_scope_id IS DISTINCT FROM $3)
            ORDER BY t.timestamp
            "#,
        )
        .bind(&table.name)
        .bind(since as i64)
        .bind(excluded_scope)
        .fetch_all(self.conn()?)
        .await
        .map_err(store_error)?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in &rows {
            let metadata = metadata_from_row(row)?;
            let data: Option<Value> = row.try_get("data").map_err(store_error)?;
            let change = match (metadata.is_tombstone, data) {
                (true, _) => {
                    let key_values: Value = row.try_get("key_values").map_err(store_error)?;
                    SyncRow::deleted(table.name.clone(), object(key_values, "row key")?)
                }
                (false, Some(data)) => SyncRow::modified(table.name.clone(), object(data, "row")?),
                (false, None) => continue,
            };
            changes.push(
                change
                    .at(metadata.timestamp)
                    .from_scope(metadata.update_scope_id),
            );
        }
        Ok(changes)
    }

    async fn apply_row(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
        scope_id: ScopeId,
        reference: Timestamp,
        force: bool,
    ) -> Result<RowWrite> {
        let key = table.row_key(&row.values)?;
        let tracking = self.tracking(&table.name, &key).await?;
        self.write_row(table, row, tracking, scope_id, reference, force)
            .await
    }

    /// Reads the tracking entries of the whole batch in one query, then
    /// writes row by row.
    async fn apply_bulk(
        &mut self,
        table: &TableDescription,
        rows: &[SyncRow],
        scope_id: ScopeId,
        reference: Timestamp,
    ) -> Result<Vec<RowWrite>> {
        let keys = rows
            .iter()
            .map(|row| table.row_key(&row.values))
            .collect::<Result<Vec<_>>>()?;
        let tracking = self.tracking_many(&table.name, &keys).await?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for (row, key) in rows.iter().zip(&keys) {
            let metadata = tracking.get(key.as_str()).copied();
            outcomes.push(
                self.write_row(table, row, metadata, scope_id, reference, false)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    async fn get_conflict_candidate(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
    ) -> Result<Option<SyncRow>> {
        let key = table.row_key(&row.values)?;
        let tracking = self.tracking(&table.name, &key).await?;
        let stored = self.stored_row(&table.name, &key).await?;

        let candidate = match (stored, tracking) {
            (Some(values), _) => SyncRow::modified(table.name.clone(), values),
            (None, Some(m)) if m.is_tombstone => {
                SyncRow::deleted(table.name.clone(), table.key_values(&row.values))
            }
            (None, _) => return Ok(None),
        };
        Ok(Some(match tracking {
            Some(m) => candidate.at(m.timestamp).from_scope(m.update_scope_id),
            None => candidate,
        }))
    }

    async fn update_metadata(
        &mut self,
        table: &TableDescription,
        row: &SyncRow,
        scope_id: Option<ScopeId>,
    ) -> Result<bool> {
        let key = table.row_key(&row.values)?;
        let updated = sqlx::query(
            r#"
            UPDATE sync_tracking
            SET timestamp = nextval('sync_timestamp_seq'), update_scope_id = $3
            WHERE table_name = $1 AND row_key = $2
            "#,
        )
        .bind(&table.name)
        .bind(key.as_str())
        .bind(scope_id)
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn reset_table(&mut self, table: &TableDescription) -> Result<()> {
        for statement in [
            "DELETE FROM sync_rows WHERE table_name = $1",
            "DELETE FROM sync_tracking WHERE table_name = $1",
        ] {
            sqlx::query(statement)
                .bind(&table.name)
                .execute(self.conn()?)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }

    async fn delete_metadata(&mut self, table: &TableDescription, up_to: Timestamp) -> Result<usize> {
        let purged = sqlx::query(
            r#"
            DELETE FROM sync_tracking
            WHERE table_name = $1 AND is_tombstone AND timestamp <= $2
            "#,
        )
        .bind(&table.name)
        .bind(up_to as i64)
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;
        Ok(purged.rows_affected() as usize)
    }

    // Constraints are checked by this adapter, not by the database, so
    // turning them off only skips those checks until the round re-enables them.
    async fn disable_constraints(&mut self) -> Result<()> {
        self.constraints_enabled = false;
        Ok(())
    }

    async fn enable_constraints(&mut self) -> Result<()> {
        self.constraints_enabled = true;
        Ok(())
    }
}
