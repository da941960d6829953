use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{OrderPlaced, OrderRecord, OrderStatus};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;
use crate::store::{IntentStatus, OrderStore, OrderStoreError, ReservationIntent};

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, AsyncDieselConnectionManager<AsyncPgConnection>>, OrderStoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| OrderStoreError::Database(e.to_string()))
    }
}

async fn intent_status(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
) -> Result<Option<IntentStatus>, OrderStoreError> {
    let status = reservation_intents::table
        .find(order_id)
        .select(reservation_intents::status)
        .first::<String>(conn)
        .await
        .optional()?;

    status
        .map(|s| s.parse::<IntentStatus>().map_err(OrderStoreError::Database))
        .transpose()
}

/// Moves an intent between statuses only if it is still in `from`.
async fn swap_intent_status(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    from: IntentStatus,
    to: IntentStatus,
) -> Result<(), OrderStoreError> {
    let updated = diesel::update(
        reservation_intents::table
            .find(order_id)
            .filter(reservation_intents::status.eq(from.as_str())),
    )
    .set((
        reservation_intents::status.eq(to.as_str()),
        reservation_intents::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    if updated == 1 {
        return Ok(());
    }
    match intent_status(conn, order_id).await? {
        Some(status) => Err(OrderStoreError::IntentClosed { order_id, status }),
        None => Err(OrderStoreError::NotFound(order_id)),
    }
}

async fn load_lines(
    conn: &mut AsyncPgConnection,
    order_ids: &[Uuid],
) -> Result<Vec<OrderLine>, OrderStoreError> {
    let lines = order_items::table
        .filter(order_items::order_id.eq_any(order_ids))
        .order((order_items::order_id.asc(), order_items::line_no.asc()))
        .load::<OrderLine>(conn)
        .await?;
    Ok(lines)
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn record_intent(&self, intent: &ReservationIntent) -> Result<(), OrderStoreError> {
        let mut conn = self.conn().await?;
        let row = NewReservationIntent::from_intent(intent)?;

        diesel::insert_into(reservation_intents::table)
            .values(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn commit_order(&self, order: &OrderRecord) -> Result<(), OrderStoreError> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        let new_order = NewOrder {
            id: order.order_id,
            customer_id: order.customer_id,
            status: order.status.as_str().to_string(),
            created_at: Some(order.created_at),
        };
        let lines = order_lines(order);
        let event = NewOutboxEvent {
            id: Uuid::new_v4(),
            aggregate_id: order.order_id,
            event_type: OrderPlaced::EVENT_TYPE.to_string(),
            event_data: serde_json::to_value(OrderPlaced::from_order(order))
                .map_err(|e| OrderStoreError::Database(e.to_string()))?,
        };
        let order_id = order.order_id;

        conn.transaction::<_, OrderStoreError, _>(|conn| {
            Box::pin(async move {
                swap_intent_status(conn, order_id, IntentStatus::Pending, IntentStatus::Committed)
                    .await?;

                diesel::insert_into(orders::table)
                    .values(&new_order)
                    .execute(conn)
                    .await?;

                diesel::insert_into(order_items::table)
                    .values(&lines)
                    .execute(conn)
                    .await?;

                diesel::insert_into(outbox_events::table)
                    .values(&event)
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await
    }

    async fn transition_intent(
        &self,
        order_id: Uuid,
        from: IntentStatus,
        to: IntentStatus,
    ) -> Result<(), OrderStoreError> {
        let mut conn = self.conn().await?;
        swap_intent_status(&mut conn, order_id, from, to).await
    }

    async fn stale_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReservationIntent>, OrderStoreError> {
        let mut conn = self.conn().await?;

        let rows = reservation_intents::table
            .filter(reservation_intents::status.eq_any([
                IntentStatus::Pending.as_str(),
                IntentStatus::Compensating.as_str(),
            ]))
            .filter(reservation_intents::created_at.le(cutoff))
            .order(reservation_intents::created_at.asc())
            .limit(limit)
            .load::<DbReservationIntent>(&mut conn)
            .await?;

        rows.into_iter().map(ReservationIntent::try_from).collect()
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderRecord>, OrderStoreError> {
        let mut conn = self.conn().await?;

        let order = orders::table
            .find(order_id)
            .first::<Order>(&mut conn)
            .await
            .optional()?;

        match order {
            Some(order) => {
                let lines = load_lines(&mut conn, &[order_id]).await?;
                order.into_record(lines).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list_orders(&self, customer_id: i64) -> Result<Vec<OrderRecord>, OrderStoreError> {
        let mut conn = self.conn().await?;

        let headers = orders::table
            .filter(orders::customer_id.eq(customer_id))
            .order(orders::created_at.desc())
            .load::<Order>(&mut conn)
            .await?;
        let ids: Vec<Uuid> = headers.iter().map(|order| order.id).collect();
        let mut lines = load_lines(&mut conn, &ids).await?;

        headers
            .into_iter()
            .map(|order| {
                let (own, rest): (Vec<OrderLine>, Vec<OrderLine>) =
                    lines.drain(..).partition(|line| line.order_id == order.id);
                lines = rest;
                order.into_record(own)
            })
            .collect()
    }

    async fn update_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<OrderRecord, OrderStoreError> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;

        conn.transaction::<_, OrderStoreError, _>(|conn| {
            Box::pin(async move {
                let order = orders::table
                    .find(order_id)
                    .for_update()
                    .first::<Order>(conn)
                    .await
                    .optional()?
                    .ok_or(OrderStoreError::NotFound(order_id))?;

                let current = order.status()?;
                if !current.can_transition_to(next) {
                    return Err(OrderStoreError::InvalidTransition {
                        order_id,
                        from: current,
                        to: next,
                    });
                }

                let order = diesel::update(orders::table.find(order_id))
                    .set((
                        orders::status.eq(next.as_str()),
                        orders::updated_at.eq(Utc::now()),
                    ))
                    .get_result::<Order>(conn)
                    .await?;
                let lines = load_lines(conn, &[order_id]).await?;
                order.into_record(lines)
            })
        })
        .await
    }
}
