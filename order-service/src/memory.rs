//! In-process order store used by tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{OrderPlaced, OrderRecord, OrderStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{IntentStatus, OrderStore, OrderStoreError, ReservationIntent};

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, OrderRecord>,
    intents: HashMap<Uuid, ReservationIntent>,
    outbox: Vec<OrderPlaced>,
}

#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<State>,
    failing_commits: AtomicUsize,
    /// Millis to wait before the next commit writes anything.
    stall_before_commit: AtomicU64,
    /// Millis to wait after the next commit has written, before it returns.
    stall_after_commit: AtomicU64,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `commit_order` fail as a database
    /// error without writing anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// The next commit hangs for `delay` before touching the store. Callers
    /// that give up earlier drop it, so it never lands.
    pub fn stall_next_commit(&self, delay: Duration) {
        self.stall_before_commit
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// The next commit is written at once but only returns after `delay`.
    pub fn delay_next_commit_reply(&self, delay: Duration) {
        self.stall_after_commit
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn intent(&self, order_id: Uuid) -> Option<ReservationIntent> {
        self.state.lock().await.intents.get(&order_id).cloned()
    }

    pub async fn intents(&self) -> Vec<ReservationIntent> {
        self.state.lock().await.intents.values().cloned().collect()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn queued_events(&self) -> Vec<OrderPlaced> {
        self.state.lock().await.outbox.clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn stall(millis: &AtomicU64) {
    let millis = millis.swap(0, Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn record_intent(&self, intent: &ReservationIntent) -> Result<(), OrderStoreError> {
        let mut state = self.state.lock().await;
        if state.intents.contains_key(&intent.order_id) {
            return Err(OrderStoreError::Database(format!(
                "duplicate reservation intent {}",
                intent.order_id
            )));
        }
        state.intents.insert(intent.order_id, intent.clone());
        Ok(())
    }

    async fn commit_order(&self, order: &OrderRecord) -> Result<(), OrderStoreError> {
        if self.take_injected_failure() {
            return Err(OrderStoreError::Database("injected commit failure".into()));
        }
        stall(&self.stall_before_commit).await;

        {
            let mut state = self.state.lock().await;
            let intent = state
                .intents
                .get_mut(&order.order_id)
                .ok_or(OrderStoreError::NotFound(order.order_id))?;
            if intent.status != IntentStatus::Pending {
                return Err(OrderStoreError::IntentClosed {
                    order_id: order.order_id,
                    status: intent.status,
                });
            }
            intent.status = IntentStatus::Committed;

            state.orders.insert(order.order_id, order.clone());
            state.outbox.push(OrderPlaced::from_order(order));
        }

        stall(&self.stall_after_commit).await;
        Ok(())
    }

    async fn transition_intent(
        &self,
        order_id: Uuid,
        from: IntentStatus,
        to: IntentStatus,
    ) -> Result<(), OrderStoreError> {
        let mut state = self.state.lock().await;
        let intent = state
            .intents
            .get_mut(&order_id)
            .ok_or(OrderStoreError::NotFound(order_id))?;
        if intent.status != from {
            return Err(OrderStoreError::IntentClosed {
                order_id,
                status: intent.status,
            });
        }
        intent.status = to;
        Ok(())
    }

    async fn stale_intents(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReservationIntent>, OrderStoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<ReservationIntent> = state
            .intents
            .values()
            .filter(|intent| {
                matches!(
                    intent.status,
                    IntentStatus::Pending | IntentStatus::Compensating
                ) && intent.created_at <= cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|intent| intent.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderRecord>, OrderStoreError> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn list_orders(&self, customer_id: i64) -> Result<Vec<OrderRecord>, OrderStoreError> {
        let state = self.state.lock().await;
        let mut orders: Vec<OrderRecord> = state
            .orders
            .values()
            .filter(|order| order.customer_id == customer_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn update_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<OrderRecord, OrderStoreError> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(OrderStoreError::NotFound(order_id))?;
        if !order.status.can_transition_to(next) {
            return Err(OrderStoreError::InvalidTransition {
                order_id,
                from: order.status,
                to: next,
            });
        }
        order.status = next;
        Ok(order.clone())
    }
}
