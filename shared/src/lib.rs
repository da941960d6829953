use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Product id reserved for "no product"; batch entries carrying it are skipped.
pub const EMPTY_PRODUCT_ID: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub product_id: i64,
    pub quantity: i32,
    pub version: i64,
}

/// One entry of a conditional adjustment: apply `delta` only if the row is
/// still at `expected_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub product_id: i64,
    pub delta: i32,
    pub expected_version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentResult {
    pub product_id: i64,
    pub new_quantity: i32,
    pub new_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustManyRequest {
    /// Replays of a key return the stored result instead of applying twice.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub adjustments: Vec<AdjustmentRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustManyResponse {
    pub results: Vec<AdjustmentResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustRequest {
    pub delta: i32,
    pub expected_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProductRequest {
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub product_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub inventories: Vec<InventoryRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub idempotency_key: String,
    /// Rows restored by this call; empty when the key was already released or
    /// never applied.
    pub restored: Vec<AdjustmentResult>,
}

/// Failure taxonomy of the inventory service. Serialized as the error body of
/// every inventory endpoint so clients get the typed error back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum InventoryError {
    #[error("product {product_id} not found")]
    NotFound { product_id: i64 },

    #[error("version mismatch on product {product_id}: expected {expected}, found {actual}")]
    VersionConflict {
        product_id: i64,
        expected: i64,
        actual: i64,
    },

    #[error("insufficient inventory for product {product_id}: {available} available, delta {delta}")]
    InsufficientInventory {
        product_id: i64,
        available: i32,
        delta: i32,
    },

    #[error("reservation {idempotency_key} was already released")]
    Released { idempotency_key: String },

    #[error("invalid request: {message}")]
    Invalid { message: String },

    #[error("timed out: {message}")]
    Timeout { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl InventoryError {
    pub fn internal(message: impl fmt::Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }

    pub fn invalid(message: impl fmt::Display) -> Self {
        Self::Invalid {
            message: message.to_string(),
        }
    }

    pub fn timeout(message: impl fmt::Display) -> Self {
        Self::Timeout {
            message: message.to_string(),
        }
    }

    /// Business rejections: the batch was rolled back and nothing was applied.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::VersionConflict { .. }
                | Self::InsufficientInventory { .. }
                | Self::Released { .. }
                | Self::Invalid { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    /// `Pending → Confirmed → Shipped → Delivered`, with `Cancelled` reachable
    /// from `Pending` or `Confirmed`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Shipped)
                | (Shipped, Delivered)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "CONFIRMED" => Ok(OrderStatus::Confirmed),
            "SHIPPED" => Ok(OrderStatus::Shipped),
            "DELIVERED" => Ok(OrderStatus::Delivered),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub customer_id: i64,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
}

/// Published through the order-service outbox once an order is durably
/// committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: Uuid,
    pub customer_id: i64,
    pub items: Vec<OrderItem>,
    pub placed_at: DateTime<Utc>,
}

impl OrderPlaced {
    pub const EVENT_TYPE: &'static str = "OrderPlaced";

    pub fn from_order(order: &OrderRecord) -> Self {
        Self {
            order_id: order.order_id,
            customer_id: order.customer_id,
            items: order.items.clone(),
            placed_at: order.created_at,
        }
    }
}
