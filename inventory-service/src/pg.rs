use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{AdjustmentRequest, AdjustmentResult, InventoryError, InventoryRecord};
use std::time::Duration;

use crate::models::*;
use crate::schema::*;
use crate::store::{result_of, InventoryStore};
use crate::versioning;

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Maps a database failure onto the wire error. A lock wait that exceeded
/// `lock_timeout` (SQLSTATE 55P03) surfaces as an unknown kind with a stable
/// message, and becomes `Timeout`.
pub fn db_error(err: diesel::result::Error) -> InventoryError {
    match &err {
        diesel::result::Error::DatabaseError(_, info) if info.message().contains("lock timeout") => {
            InventoryError::timeout(info.message())
        }
        _ => InventoryError::internal(err),
    }
}

/// Error type of the store's transactions, which must absorb diesel errors.
#[derive(Debug)]
enum TxError {
    Db(diesel::result::Error),
    Inventory(InventoryError),
}

impl From<diesel::result::Error> for TxError {
    fn from(err: diesel::result::Error) -> Self {
        TxError::Db(err)
    }
}

impl From<InventoryError> for TxError {
    fn from(err: InventoryError) -> Self {
        TxError::Inventory(err)
    }
}

impl From<TxError> for InventoryError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Db(e) => db_error(e),
            TxError::Inventory(e) => e,
        }
    }
}

/// Postgres-backed store. Rows are locked with `SELECT ... FOR UPDATE` inside
/// one transaction per batch, with a `lock_timeout` so a stuck waiter fails as
/// `Timeout` instead of hanging.
pub struct PgInventoryStore {
    pool: DbPool,
    lock_timeout: Duration,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, AsyncDieselConnectionManager<AsyncPgConnection>>, InventoryError> {
        self.pool.get().await.map_err(InventoryError::internal)
    }

    fn lock_timeout_stmt(&self) -> String {
        format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis())
    }
}

async fn lock_row(
    conn: &mut AsyncPgConnection,
    product_id: i64,
    include_deleted: bool,
) -> Result<Inventory, TxError> {
    let row = inventory::table
        .find(product_id)
        .for_update()
        .first::<Inventory>(conn)
        .await
        .optional()?;

    match row {
        Some(row) if include_deleted || row.deleted_at.is_none() => Ok(row),
        _ => Err(InventoryError::NotFound { product_id }.into()),
    }
}

async fn lock_batch(conn: &mut AsyncPgConnection, key: &str) -> Result<Option<AdjustmentBatch>, TxError> {
    let batch = adjustment_batches::table
        .find(key)
        .for_update()
        .first::<AdjustmentBatch>(conn)
        .await
        .optional()?;
    Ok(batch)
}

/// Inserts a ledger row unless one with the same key already exists. Waits
/// for a concurrent uncommitted insert of that key to resolve first; returns
/// whether this call wrote the row.
async fn insert_batch(conn: &mut AsyncPgConnection, batch: &NewAdjustmentBatch) -> Result<bool, TxError> {
    let inserted = diesel::insert_into(adjustment_batches::table)
        .values(batch)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(inserted == 1)
}

/// Writes `request` against a row locked in this transaction. The version
/// filter on the UPDATE repeats the check so the write is a true CAS.
async fn write_adjustment(
    conn: &mut AsyncPgConnection,
    current: &InventoryRecord,
    request: &AdjustmentRequest,
) -> Result<InventoryRecord, TxError> {
    let next = versioning::apply(current, request)?;

    let updated = diesel::update(
        inventory::table
            .find(request.product_id)
            .filter(inventory::version.eq(request.expected_version)),
    )
    .set((
        inventory::quantity.eq(next.quantity),
        inventory::version.eq(next.version),
        inventory::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    if updated != 1 {
        return Err(InventoryError::VersionConflict {
            product_id: request.product_id,
            expected: request.expected_version,
            actual: current.version,
        }
        .into());
    }
    Ok(next)
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, InventoryError> {
    serde_json::from_value(value).map_err(InventoryError::internal)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, InventoryError> {
    serde_json::to_value(value).map_err(InventoryError::internal)
}

fn released(key: &str) -> TxError {
    InventoryError::Released {
        idempotency_key: key.to_string(),
    }
    .into()
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn insert(&self, product_id: i64, quantity: i32) -> Result<InventoryRecord, InventoryError> {
        let mut conn = self.conn().await?;

        let new_row = NewInventory {
            product_id,
            quantity,
            version: 0,
        };
        let inserted = diesel::insert_into(inventory::table)
            .values(&new_row)
            .get_result::<Inventory>(&mut conn)
            .await;

        match inserted {
            Ok(row) => Ok(row.record()),
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Err(
                InventoryError::invalid(format!("product {product_id} already exists")),
            ),
            Err(e) => Err(db_error(e)),
        }
    }

    async fn fetch(&self, product_ids: &[i64]) -> Result<Vec<InventoryRecord>, InventoryError> {
        let mut conn = self.conn().await?;

        let rows = inventory::table
            .filter(inventory::product_id.eq_any(product_ids))
            .filter(inventory::deleted_at.is_null())
            .load::<Inventory>(&mut conn)
            .await
            .map_err(db_error)?;

        Ok(rows.iter().map(Inventory::record).collect())
    }

    async fn soft_delete(&self, product_id: i64) -> Result<(), InventoryError> {
        let mut conn = self.conn().await?;

        let updated = diesel::update(
            inventory::table
                .find(product_id)
                .filter(inventory::deleted_at.is_null()),
        )
        .set(inventory::deleted_at.eq(Utc::now()))
        .execute(&mut conn)
        .await
        .map_err(db_error)?;

        if updated == 0 {
            return Err(InventoryError::NotFound { product_id });
        }
        Ok(())
    }

    async fn apply_batch(
        &self,
        idempotency_key: Option<String>,
        adjustments: Vec<AdjustmentRequest>,
    ) -> Result<Vec<AdjustmentResult>, InventoryError> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let lock_timeout = self.lock_timeout_stmt();

        let results = conn
            .transaction::<_, TxError, _>(|conn| {
                Box::pin(async move {
                    diesel::sql_query(lock_timeout).execute(conn).await?;

                    if let Some(key) = &idempotency_key {
                        if let Some(batch) = lock_batch(conn, key).await? {
                            if batch.status == BATCH_RELEASED {
                                return Err(released(key));
                            }
                            return Ok(decode(batch.results)?);
                        }
                    }

                    let mut results = Vec::with_capacity(adjustments.len());
                    for request in &adjustments {
                        let row = lock_row(conn, request.product_id, false).await?;
                        let next = write_adjustment(conn, &row.record(), request).await?;
                        results.push(result_of(&next));
                    }

                    if let Some(key) = idempotency_key {
                        let batch = NewAdjustmentBatch {
                            idempotency_key: key.clone(),
                            status: BATCH_APPLIED.to_string(),
                            adjustments: encode(&adjustments)?,
                            results: encode(&results)?,
                        };
                        if !insert_batch(conn, &batch).await? {
                            // A release tombstoned the key while this batch
                            // held its rows; roll the writes back.
                            return Err(released(&key));
                        }
                    }

                    Ok(results)
                })
            })
            .await?;
        Ok(results)
    }

    async fn release(&self, idempotency_key: &str) -> Result<Vec<AdjustmentResult>, InventoryError> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let lock_timeout = self.lock_timeout_stmt();
        let key = idempotency_key.to_string();

        let restored = conn
            .transaction::<_, TxError, _>(|conn| {
                Box::pin(async move {
                    diesel::sql_query(lock_timeout).execute(conn).await?;

                    let batch = match lock_batch(conn, &key).await? {
                        Some(batch) => batch,
                        None => {
                            let tombstone = NewAdjustmentBatch {
                                idempotency_key: key.clone(),
                                status: BATCH_RELEASED.to_string(),
                                adjustments: serde_json::json!([]),
                                results: serde_json::json!([]),
                            };
                            if insert_batch(conn, &tombstone).await? {
                                return Ok(Vec::new());
                            }
                            // A batch under this key committed while the
                            // tombstone waited on it.
                            lock_batch(conn, &key).await?.ok_or_else(|| {
                                InventoryError::internal(format!("ledger row {key} vanished"))
                            })?
                        }
                    };

                    if batch.status == BATCH_RELEASED {
                        return Ok(Vec::new());
                    }

                    let applied: Vec<AdjustmentRequest> = decode(batch.adjustments)?;
                    let mut restored = Vec::with_capacity(applied.len());
                    for adjustment in &applied {
                        let current = lock_row(conn, adjustment.product_id, true).await?.record();
                        let undo = versioning::reversal(&current, adjustment);
                        let next = write_adjustment(conn, &current, &undo).await?;
                        restored.push(result_of(&next));
                    }

                    diesel::update(adjustment_batches::table.find(&key))
                        .set((
                            adjustment_batches::status.eq(BATCH_RELEASED),
                            adjustment_batches::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    Ok(restored)
                })
            })
            .await?;
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_errors_keep_domain_rejections() {
        let err: InventoryError = TxError::from(InventoryError::NotFound { product_id: 3 }).into();
        assert_eq!(err, InventoryError::NotFound { product_id: 3 });

        let err: InventoryError = TxError::from(diesel::result::Error::NotFound).into();
        assert!(matches!(err, InventoryError::Internal { .. }));
    }
}
