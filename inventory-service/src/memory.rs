//! In-process inventory store.
//!
//! Each row sits behind its own async mutex so batches lock rows one at a time
//! like `SELECT ... FOR UPDATE` does; changes are staged and only written back
//! once every row in the batch has been checked.

use async_trait::async_trait;
use shared::{AdjustmentRequest, AdjustmentResult, InventoryError, InventoryRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::store::{result_of, InventoryStore};
use crate::versioning;

#[derive(Debug)]
struct Row {
    record: InventoryRecord,
    deleted: bool,
}

#[derive(Debug, Clone)]
enum BatchEntry {
    Applied {
        adjustments: Vec<AdjustmentRequest>,
        results: Vec<AdjustmentResult>,
    },
    Released,
}

struct Locked {
    product_id: i64,
    guard: OwnedMutexGuard<Row>,
    staged: InventoryRecord,
}

#[derive(Default)]
pub struct MemoryInventoryStore {
    rows: RwLock<HashMap<i64, Arc<Mutex<Row>>>>,
    batches: Mutex<HashMap<String, BatchEntry>>,
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row(&self, product_id: i64) -> Option<Arc<Mutex<Row>>> {
        self.rows.read().await.get(&product_id).cloned()
    }

    /// Locks each referenced row (once, even if listed twice) and stages the
    /// adjustments. Dropping the returned guards without [`commit`] is a
    /// rollback.
    async fn stage<F>(
        &self,
        adjustments: &[AdjustmentRequest],
        include_deleted: bool,
        mut build: F,
    ) -> Result<(Vec<Locked>, Vec<AdjustmentResult>), InventoryError>
    where
        F: FnMut(&InventoryRecord, &AdjustmentRequest) -> AdjustmentRequest,
    {
        let mut locked: Vec<Locked> = Vec::new();
        let mut results = Vec::with_capacity(adjustments.len());

        for adjustment in adjustments {
            let product_id = adjustment.product_id;
            let slot = match locked.iter().position(|l| l.product_id == product_id) {
                Some(slot) => slot,
                None => {
                    let row = self
                        .row(product_id)
                        .await
                        .ok_or(InventoryError::NotFound { product_id })?;
                    let guard = row.lock_owned().await;
                    if guard.deleted && !include_deleted {
                        return Err(InventoryError::NotFound { product_id });
                    }
                    let staged = guard.record;
                    locked.push(Locked {
                        product_id,
                        guard,
                        staged,
                    });
                    locked.len() - 1
                }
            };

            let entry = &mut locked[slot];
            let request = build(&entry.staged, adjustment);
            entry.staged = versioning::apply(&entry.staged, &request)?;
            results.push(result_of(&entry.staged));
        }

        Ok((locked, results))
    }
}

fn commit(locked: Vec<Locked>) {
    for mut entry in locked {
        entry.guard.record = entry.staged;
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn insert(&self, product_id: i64, quantity: i32) -> Result<InventoryRecord, InventoryError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&product_id) {
            return Err(InventoryError::invalid(format!(
                "product {product_id} already exists"
            )));
        }
        let record = InventoryRecord {
            product_id,
            quantity,
            version: 0,
        };
        rows.insert(
            product_id,
            Arc::new(Mutex::new(Row {
                record,
                deleted: false,
            })),
        );
        Ok(record)
    }

    async fn fetch(&self, product_ids: &[i64]) -> Result<Vec<InventoryRecord>, InventoryError> {
        let mut found = Vec::with_capacity(product_ids.len());
        for product_id in product_ids {
            if let Some(row) = self.row(*product_id).await {
                let row = row.lock().await;
                if !row.deleted {
                    found.push(row.record);
                }
            }
        }
        Ok(found)
    }

    async fn soft_delete(&self, product_id: i64) -> Result<(), InventoryError> {
        let row = self
            .row(product_id)
            .await
            .ok_or(InventoryError::NotFound { product_id })?;
        let mut row = row.lock().await;
        if row.deleted {
            return Err(InventoryError::NotFound { product_id });
        }
        row.deleted = true;
        Ok(())
    }

    async fn apply_batch(
        &self,
        idempotency_key: Option<String>,
        adjustments: Vec<AdjustmentRequest>,
    ) -> Result<Vec<AdjustmentResult>, InventoryError> {
        let mut ledger = match idempotency_key {
            Some(_) => Some(self.batches.lock().await),
            None => None,
        };

        if let (Some(key), Some(ledger)) = (&idempotency_key, ledger.as_ref()) {
            match ledger.get(key) {
                Some(BatchEntry::Applied { results, .. }) => return Ok(results.clone()),
                Some(BatchEntry::Released) => {
                    return Err(InventoryError::Released {
                        idempotency_key: key.clone(),
                    })
                }
                None => {}
            }
        }

        let (locked, results) = self.stage(&adjustments, false, |_, request| *request).await?;
        commit(locked);

        if let (Some(key), Some(ledger)) = (idempotency_key, ledger.as_mut()) {
            ledger.insert(
                key,
                BatchEntry::Applied {
                    adjustments,
                    results: results.clone(),
                },
            );
        }
        Ok(results)
    }

    async fn release(&self, idempotency_key: &str) -> Result<Vec<AdjustmentResult>, InventoryError> {
        let mut ledger = self.batches.lock().await;
        let applied = match ledger.get(idempotency_key) {
            Some(BatchEntry::Applied { adjustments, .. }) => adjustments.clone(),
            Some(BatchEntry::Released) => return Ok(Vec::new()),
            None => {
                ledger.insert(idempotency_key.to_string(), BatchEntry::Released);
                return Ok(Vec::new());
            }
        };

        let (locked, restored) = self.stage(&applied, true, versioning::reversal).await?;
        commit(locked);
        ledger.insert(idempotency_key.to_string(), BatchEntry::Released);
        Ok(restored)
    }
}
