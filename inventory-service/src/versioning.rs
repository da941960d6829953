//! Compare-and-swap on the inventory version counter.
//!
//! Every store backend funnels row mutations through [`apply`] while it holds
//! the row's exclusive lock, so the version check, the non-negative quantity
//! rule and the version bump live in exactly one place.

use shared::{AdjustmentRequest, InventoryError, InventoryRecord};

/// Computes the post-adjustment state of a locked row.
///
/// Returns the row as it must be written on commit. On error the caller must
/// leave the row untouched.
pub fn apply(
    current: &InventoryRecord,
    request: &AdjustmentRequest,
) -> Result<InventoryRecord, InventoryError> {
    if current.product_id != request.product_id {
        return Err(InventoryError::internal(format!(
            "locked row {} does not match request for product {}",
            current.product_id, request.product_id
        )));
    }

    if current.version != request.expected_version {
        return Err(InventoryError::VersionConflict {
            product_id: current.product_id,
            expected: request.expected_version,
            actual: current.version,
        });
    }

    let new_quantity = current
        .quantity
        .checked_add(request.delta)
        .ok_or_else(|| InventoryError::invalid("quantity overflow"))?;
    if new_quantity < 0 {
        return Err(InventoryError::InsufficientInventory {
            product_id: current.product_id,
            available: current.quantity,
            delta: request.delta,
        });
    }

    Ok(InventoryRecord {
        product_id: current.product_id,
        quantity: new_quantity,
        version: request.expected_version + 1,
    })
}

/// The request that undoes `applied` against a row currently at `current`.
/// Compensation reads the version under the same lock it writes with.
pub fn reversal(current: &InventoryRecord, applied: &AdjustmentRequest) -> AdjustmentRequest {
    AdjustmentRequest {
        product_id: applied.product_id,
        delta: -applied.delta,
        expected_version: current.version,
    }
}
