use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::InventoryRecord;

pub const BATCH_APPLIED: &str = "applied";
pub const BATCH_RELEASED: &str = "released";

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
#[diesel(primary_key(product_id))]
pub struct Inventory {
    pub product_id: i64,
    pub quantity: i32,
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Inventory {
    pub fn record(&self) -> InventoryRecord {
        InventoryRecord {
            product_id: self.product_id,
            quantity: self.quantity,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct NewInventory {
    pub product_id: i64,
    pub quantity: i32,
    pub version: i64,
}

/// Ledger row written in the same transaction as an idempotent batch.
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::adjustment_batches)]
pub struct AdjustmentBatch {
    pub idempotency_key: String,
    pub status: String,
    pub adjustments: serde_json::Value,
    pub results: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::adjustment_batches)]
pub struct NewAdjustmentBatch {
    pub idempotency_key: String,
    pub status: String,
    pub adjustments: serde_json::Value,
    pub results: serde_json::Value,
}
