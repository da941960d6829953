use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{OrderItem, OrderRecord, OrderStatus};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of the local record written before inventory is reserved.
///
/// `Pending` intents that outlive the reservation timeout are swept:
/// `Pending → Compensating → Released`. A successful placement moves
/// `Pending → Committed` in the same transaction that inserts the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Committed,
    Compensating,
    Released,
    /// The inventory batch was refused, so there is nothing to undo.
    Rejected,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Committed => "committed",
            IntentStatus::Compensating => "compensating",
            IntentStatus::Released => "released",
            IntentStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "committed" => Ok(IntentStatus::Committed),
            "compensating" => Ok(IntentStatus::Compensating),
            "released" => Ok(IntentStatus::Released),
            "rejected" => Ok(IntentStatus::Rejected),
            other => Err(format!("unknown intent status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationIntent {
    pub order_id: Uuid,
    pub customer_id: i64,
    pub items: Vec<OrderItem>,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
}

impl ReservationIntent {
    pub fn pending(order_id: Uuid, customer_id: i64, items: Vec<OrderItem>) -> Self {
        Self {
            order_id,
            customer_id,
            items,
            status: IntentStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Idempotency key the inventory service records the reservation under.
    pub fn reservation_key(&self) -> String {
        reservation_key(self.order_id)
    }
}

pub fn reservation_key(order_id: Uuid) -> String {
    order_id.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderStoreError {
    #[error("order {0} not found")]
    NotFound(Uuid),

    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("reservation intent for order {order_id} is already {status}")]
    IntentClosed { order_id: Uuid, status: IntentStatus },

    #[error("database error: {0}")]
    Database(String),
}

impl From<diesel::result::Error> for OrderStoreError {
    fn from(err: diesel::result::Error) -> Self {
        OrderStoreError::Database(err.to_string())
    }
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn record_intent(&self, intent: &ReservationIntent) -> Result<(), OrderStoreError>;

    /// Inserts the order with its lines, moves the intent `Pending →
    /// Committed` and queues an `OrderPlaced` event, atomically. Fails with
    /// `IntentClosed` if the intent has already left `Pending`.
    async fn commit_order(&self, order: &OrderRecord) -> Result<(), OrderStoreError>;

    /// Conditional status change; fails with `IntentClosed` carrying the
    /// current status when the intent is not in `from`.
    async fn transition_intent(
        &self,
        order_id: Uuid,
        from: IntentStatus,
        to: IntentStatus,
    ) -> Result<(), OrderStoreError>;

    /// `Pending` or `Compensating` intents created at or before `cutoff`,
    /// oldest first.
    async fn stale_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReservationIntent>, OrderStoreError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderRecord>, OrderStoreError>;

    async fn list_orders(&self, customer_id: i64) -> Result<Vec<OrderRecord>, OrderStoreError>;

    async fn update_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<OrderRecord, OrderStoreError>;
}
