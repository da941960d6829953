use async_trait::async_trait;
use shared::{AdjustmentRequest, AdjustmentResult, InventoryError, InventoryRecord};

/// Persistence seam of the inventory service.
///
/// Implementations lock rows in the order the batch lists them. Callers are
/// responsible for putting the batch in canonical order first.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn insert(&self, product_id: i64, quantity: i32) -> Result<InventoryRecord, InventoryError>;

    /// Returns the live rows among `product_ids`, in no particular order.
    async fn fetch(&self, product_ids: &[i64]) -> Result<Vec<InventoryRecord>, InventoryError>;

    async fn soft_delete(&self, product_id: i64) -> Result<(), InventoryError>;

    /// Applies every adjustment in one transaction: all of them commit or none
    /// do. With an idempotency key the batch is recorded alongside the row
    /// writes, and a repeated key returns the recorded results untouched.
    async fn apply_batch(
        &self,
        idempotency_key: Option<String>,
        adjustments: Vec<AdjustmentRequest>,
    ) -> Result<Vec<AdjustmentResult>, InventoryError>;

    /// Reverses the batch recorded under `idempotency_key`.
    ///
    /// Unknown keys are tombstoned so a batch arriving later is refused with
    /// `Released`. Releasing twice is a no-op.
    async fn release(&self, idempotency_key: &str) -> Result<Vec<AdjustmentResult>, InventoryError>;
}

pub(crate) fn result_of(record: &InventoryRecord) -> AdjustmentResult {
    AdjustmentResult {
        product_id: record.product_id,
        new_quantity: record.quantity,
        new_version: record.version,
    }
}
