use anyhow::Result;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::models::*;
use crate::pg::DbPool;
use crate::schema::*;

/// Publishes events queued in `outbox_events` by committed orders. Delivery is
/// at least once: an event is marked processed only after Kafka acks it.
pub struct OutboxProcessor {
    pool: DbPool,
    producer: FutureProducer,
    topic: String,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, producer: FutureProducer, topic: String, interval: Duration) -> Self {
        Self {
            pool,
            producer,
            topic,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.publish_pending().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn publish_pending(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let pending = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;

        for event in pending {
            if let Err(e) = self.publish(&event).await {
                // Keep ordering per aggregate: stop at the first failure.
                error!("Failed to publish event {}: {}", event.id, e);
                break;
            }

            diesel::update(outbox_events::table.find(event.id))
                .set(outbox_events::processed.eq(true))
                .execute(&mut conn)
                .await?;

            info!(event_id = %event.id, event_type = %event.event_type, "Published outbox event");
        }

        Ok(())
    }

    async fn publish(&self, event: &DbOutboxEvent) -> Result<()> {
        let json = serde_json::to_string(&event.event_data)?;
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(&self.topic)
            .payload(&json)
            .key(&key)
            .headers(rdkafka::message::OwnedHeaders::new().insert(rdkafka::message::Header {
                key: "event_type",
                value: Some(event.event_type.as_str()),
            }));

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}
