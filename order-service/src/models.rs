use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{OrderItem, OrderRecord, OrderStatus};
use uuid::Uuid;

use crate::store::{IntentStatus, OrderStoreError, ReservationIntent};

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: i64,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub customer_id: i64,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderLine {
    pub order_id: Uuid,
    pub line_no: i32,
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::reservation_intents)]
pub struct DbReservationIntent {
    pub order_id: Uuid,
    pub customer_id: i64,
    pub items: serde_json::Value,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::reservation_intents)]
pub struct NewReservationIntent {
    pub order_id: Uuid,
    pub customer_id: i64,
    pub items: serde_json::Value,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
}

impl NewReservationIntent {
    pub fn from_intent(intent: &ReservationIntent) -> Result<Self, OrderStoreError> {
        Ok(Self {
            order_id: intent.order_id,
            customer_id: intent.customer_id,
            items: serde_json::to_value(&intent.items)
                .map_err(|e| OrderStoreError::Database(e.to_string()))?,
            status: intent.status.as_str().to_string(),
            created_at: Some(intent.created_at),
        })
    }
}

impl TryFrom<DbReservationIntent> for ReservationIntent {
    type Error = OrderStoreError;

    fn try_from(row: DbReservationIntent) -> Result<Self, Self::Error> {
        let items = serde_json::from_value(row.items)
            .map_err(|e| OrderStoreError::Database(e.to_string()))?;
        let status = row
            .status
            .parse::<IntentStatus>()
            .map_err(OrderStoreError::Database)?;

        Ok(Self {
            order_id: row.order_id,
            customer_id: row.customer_id,
            items,
            status,
            created_at: row.created_at.unwrap_or_else(Utc::now),
        })
    }
}

impl Order {
    pub fn status(&self) -> Result<OrderStatus, OrderStoreError> {
        self.status.parse().map_err(OrderStoreError::Database)
    }

    /// Assembles the domain record; `lines` must already be in line order.
    pub fn into_record(self, lines: Vec<OrderLine>) -> Result<OrderRecord, OrderStoreError> {
        let status = self.status()?;
        Ok(OrderRecord {
            order_id: self.id,
            customer_id: self.customer_id,
            status,
            items: lines
                .into_iter()
                .map(|line| OrderItem {
                    product_id: line.product_id,
                    quantity: line.quantity,
                })
                .collect(),
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

pub fn order_lines(order: &OrderRecord) -> Vec<OrderLine> {
    order
        .items
        .iter()
        .enumerate()
        .map(|(index, item)| OrderLine {
            order_id: order.order_id,
            line_no: index as i32,
            product_id: item.product_id,
            quantity: item.quantity,
        })
        .collect()
}
