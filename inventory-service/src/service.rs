use shared::{
    AdjustmentRequest, AdjustmentResult, InventoryError, InventoryRecord, EMPTY_PRODUCT_ID,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::InventoryStore;

/// Inventory operations exposed to other services.
///
/// Batches are locked in ascending `product_id` order whatever order the
/// caller listed them in, so two batches over overlapping products can never
/// wait on each other in a cycle. Results are handed back in request order.
#[derive(Clone)]
pub struct InventoryService {
    store: Arc<dyn InventoryStore>,
}

impl InventoryService {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    pub async fn create_product(
        &self,
        product_id: i64,
        quantity: i32,
    ) -> Result<InventoryRecord, InventoryError> {
        if product_id == EMPTY_PRODUCT_ID {
            return Err(InventoryError::invalid("product id must be non-zero"));
        }
        if quantity < 0 {
            return Err(InventoryError::invalid("initial quantity must not be negative"));
        }

        let record = self.store.insert(product_id, quantity).await?;
        info!(product_id, quantity, "Product registered");
        Ok(record)
    }

    pub async fn get_inventory(&self, product_id: i64) -> Result<InventoryRecord, InventoryError> {
        self.get_inventories(&[product_id])
            .await?
            .pop()
            .ok_or(InventoryError::NotFound { product_id })
    }

    /// Returns one record per requested id, in request order.
    pub async fn get_inventories(
        &self,
        product_ids: &[i64],
    ) -> Result<Vec<InventoryRecord>, InventoryError> {
        if product_ids.contains(&EMPTY_PRODUCT_ID) {
            return Err(InventoryError::invalid("product id must be non-zero"));
        }

        let found = self.store.fetch(product_ids).await?;
        product_ids
            .iter()
            .map(|&product_id| {
                found
                    .iter()
                    .find(|record| record.product_id == product_id)
                    .copied()
                    .ok_or(InventoryError::NotFound { product_id })
            })
            .collect()
    }

    pub async fn delete_product(&self, product_id: i64) -> Result<(), InventoryError> {
        self.store.soft_delete(product_id).await?;
        info!(product_id, "Product marked deleted");
        Ok(())
    }

    pub async fn adjust(
        &self,
        product_id: i64,
        delta: i32,
        expected_version: i64,
    ) -> Result<AdjustmentResult, InventoryError> {
        if product_id == EMPTY_PRODUCT_ID {
            return Err(InventoryError::invalid("product id must be non-zero"));
        }

        let request = AdjustmentRequest {
            product_id,
            delta,
            expected_version,
        };
        self.adjust_many(None, vec![request])
            .await?
            .pop()
            .ok_or_else(|| InventoryError::internal("store returned no result"))
    }

    /// All-or-nothing batch adjustment. Entries for the empty product id are
    /// dropped before anything is locked.
    pub async fn adjust_many(
        &self,
        idempotency_key: Option<String>,
        requests: Vec<AdjustmentRequest>,
    ) -> Result<Vec<AdjustmentResult>, InventoryError> {
        let live: Vec<AdjustmentRequest> = requests
            .into_iter()
            .filter(|request| request.product_id != EMPTY_PRODUCT_ID)
            .collect();
        if live.is_empty() {
            return Ok(Vec::new());
        }

        let lock_order = canonical_order(&live);
        let sorted = lock_order.iter().map(|&i| live[i]).collect();

        let locked_results = match self.store.apply_batch(idempotency_key.clone(), sorted).await {
            Ok(results) => results,
            Err(e) => {
                warn!(?idempotency_key, error = %e, "Inventory batch rejected");
                return Err(e);
            }
        };

        if locked_results.len() != live.len() {
            return Err(InventoryError::internal(format!(
                "batch returned {} results for {} adjustments",
                locked_results.len(),
                live.len()
            )));
        }

        let mut results = locked_results.clone();
        for (position, &request_index) in lock_order.iter().enumerate() {
            results[request_index] = locked_results[position];
        }

        info!(?idempotency_key, items = results.len(), "Inventory batch applied");
        Ok(results)
    }

    /// Compensating action for a keyed batch.
    pub async fn release(&self, idempotency_key: &str) -> Result<Vec<AdjustmentResult>, InventoryError> {
        if idempotency_key.is_empty() {
            return Err(InventoryError::invalid("idempotency key must not be empty"));
        }

        let restored = self.store.release(idempotency_key).await?;
        info!(idempotency_key, restored = restored.len(), "Reservation released");
        Ok(restored)
    }
}

/// Indices of `requests` sorted by product id. The sort is stable so repeated
/// products keep their relative order.
fn canonical_order(requests: &[AdjustmentRequest]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..requests.len()).collect();
    order.sort_by_key(|&i| requests[i].product_id);
    order
}
