//! Order placement saga.
//!
//! Placement has one compensable step, reserving inventory in the inventory
//! service, and one pivot step, committing the order locally:
//!
//! ```text
//! record intent ──► read versions ──► adjust_many(key) ──► commit order
//!      (local)          ▲                    │                 │
//!                       └── VersionConflict ─┘                 │
//!                           (backoff, bounded)                 │
//!                                                              ▼
//!                  release(key) ◄── commit failed / timed out / cancelled
//! ```
//!
//! The intent row is written before anything leaves the process, so a crash
//! anywhere after it is picked up by the reconciliation sweeper.

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use shared::{AdjustmentRequest, InventoryError, OrderItem, OrderRecord, OrderStatus, EMPTY_PRODUCT_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::InventoryClient;
use crate::store::{reservation_key, IntentStatus, OrderStore, OrderStoreError, ReservationIntent};

/// Flip to `true` to cancel a placement. Dropping the sender is not a
/// cancellation.
pub type CancelSignal = watch::Receiver<bool>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bound on each call to the inventory service.
    pub remote_timeout: Duration,
    /// Bound on the local order commit.
    pub commit_timeout: Duration,
    /// Read-then-adjust attempts before a version conflict is surfaced.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(3),
            commit_timeout: Duration::from_secs(3),
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// What happened to inventory reserved for a placement that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    /// Nothing was reserved.
    NotNeeded,
    /// The reservation was given back.
    Released,
    /// The reservation may still be held; the sweeper will release it.
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaceOrderError {
    #[error("invalid order: {0}")]
    Invalid(String),

    #[error("product {product_id} not found")]
    NotFound { product_id: i64 },

    #[error("inventory for product {product_id} kept changing; gave up after {attempts} attempts")]
    VersionConflict { product_id: i64, attempts: u32 },

    #[error("insufficient inventory for product {product_id}: {available} available, {requested} requested")]
    InsufficientInventory {
        product_id: i64,
        available: i32,
        requested: i32,
    },

    #[error("order placement cancelled")]
    Cancelled { reconciliation: Reconciliation },

    #[error("order placement timed out: {message}")]
    Timeout {
        message: String,
        reconciliation: Reconciliation,
    },

    #[error("order placement failed: {message}")]
    Internal {
        message: String,
        reconciliation: Reconciliation,
    },
}

impl PlaceOrderError {
    /// Rejections of the order itself, as opposed to system failures. A
    /// cancellation is only a clean rejection if nothing was reserved.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PlaceOrderError::Invalid(_)
                | PlaceOrderError::NotFound { .. }
                | PlaceOrderError::VersionConflict { .. }
                | PlaceOrderError::InsufficientInventory { .. }
                | PlaceOrderError::Cancelled {
                    reconciliation: Reconciliation::NotNeeded
                }
        )
    }

    pub fn reconciliation(&self) -> Reconciliation {
        match self {
            PlaceOrderError::Cancelled { reconciliation }
            | PlaceOrderError::Timeout { reconciliation, .. }
            | PlaceOrderError::Internal { reconciliation, .. } => *reconciliation,
            _ => Reconciliation::NotNeeded,
        }
    }

    fn internal(message: impl ToString, reconciliation: Reconciliation) -> Self {
        PlaceOrderError::Internal {
            message: message.to_string(),
            reconciliation,
        }
    }

    /// Maps a batch the inventory service refused (nothing applied).
    fn from_rejection(err: InventoryError, attempts: u32) -> Self {
        match err {
            InventoryError::NotFound { product_id } => PlaceOrderError::NotFound { product_id },
            InventoryError::VersionConflict { product_id, .. } => {
                PlaceOrderError::VersionConflict { product_id, attempts }
            }
            InventoryError::InsufficientInventory {
                product_id,
                available,
                delta,
            } => PlaceOrderError::InsufficientInventory {
                product_id,
                available,
                requested: -delta,
            },
            InventoryError::Invalid { message } => PlaceOrderError::Invalid(message),
            other => PlaceOrderError::internal(other, Reconciliation::NotNeeded),
        }
    }
}

/// Why the reservation step did not succeed.
enum ReserveFailure {
    /// Refused by the inventory service; nothing was applied.
    Rejected { error: InventoryError, attempts: u32 },
    /// Stopped before any batch could have been applied.
    Aborted(PlaceOrderError),
    /// The batch may have been applied.
    Unknown(InventoryError),
    /// Cancelled while a batch was in flight.
    CancelledInFlight,
}

/// Outcome of running the compensating step.
enum Compensation {
    Done(Reconciliation),
    /// The intent turned out to be committed: the order exists.
    OrderCommitted,
}

#[derive(Clone)]
pub struct OrderCoordinator {
    inventory: Arc<dyn InventoryClient>,
    orders: Arc<dyn OrderStore>,
    config: CoordinatorConfig,
}

impl OrderCoordinator {
    pub fn new(
        inventory: Arc<dyn InventoryClient>,
        orders: Arc<dyn OrderStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inventory,
            orders,
            config,
        }
    }

    pub async fn place_order(
        &self,
        customer_id: i64,
        items: Vec<OrderItem>,
    ) -> Result<OrderRecord, PlaceOrderError> {
        let (_never_cancelled, cancel) = watch::channel(false);
        self.place_order_cancellable(customer_id, items, cancel).await
    }

    /// Runs the saga on its own task: dropping this future does not stop a
    /// placement that has already reserved inventory from being compensated.
    pub async fn place_order_cancellable(
        &self,
        customer_id: i64,
        items: Vec<OrderItem>,
        cancel: CancelSignal,
    ) -> Result<OrderRecord, PlaceOrderError> {
        let coordinator = self.clone();
        let saga = tokio::spawn(async move { coordinator.run(customer_id, items, cancel).await });

        match saga.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Order placement task failed: {}", e);
                Err(PlaceOrderError::internal(e, Reconciliation::Pending))
            }
        }
    }

    async fn run(
        &self,
        customer_id: i64,
        items: Vec<OrderItem>,
        mut cancel: CancelSignal,
    ) -> Result<OrderRecord, PlaceOrderError> {
        let lines = reservation_lines(&items)?;
        if is_cancelled(&cancel) {
            return Err(PlaceOrderError::Cancelled {
                reconciliation: Reconciliation::NotNeeded,
            });
        }

        let intent = ReservationIntent::pending(Uuid::new_v4(), customer_id, items.clone());
        let order_id = intent.order_id;
        let key = intent.reservation_key();
        self.orders
            .record_intent(&intent)
            .await
            .map_err(|e| PlaceOrderError::internal(e, Reconciliation::NotNeeded))?;
        info!(%order_id, customer_id, lines = lines.len(), "Placing order");

        match self.reserve(&key, &lines, &mut cancel).await {
            Ok(()) => {}
            Err(ReserveFailure::Rejected { error, attempts }) => {
                warn!(%order_id, attempts, error = %error, "Inventory reservation refused");
                self.close_rejected(order_id).await;
                return Err(PlaceOrderError::from_rejection(error, attempts));
            }
            Err(ReserveFailure::Aborted(err)) => {
                self.close_rejected(order_id).await;
                return Err(err);
            }
            Err(ReserveFailure::Unknown(error)) => {
                error!(%order_id, error = %error, "Inventory reservation outcome unknown, compensating");
                let reconciliation = self.compensate_absent(order_id, &key).await;
                return Err(match error {
                    InventoryError::Timeout { message } => PlaceOrderError::Timeout {
                        message,
                        reconciliation,
                    },
                    other => PlaceOrderError::internal(other, reconciliation),
                });
            }
            Err(ReserveFailure::CancelledInFlight) => {
                warn!(%order_id, "Placement cancelled during reservation, compensating");
                let reconciliation = self.compensate_absent(order_id, &key).await;
                return Err(PlaceOrderError::Cancelled { reconciliation });
            }
        }

        if is_cancelled(&cancel) {
            warn!(%order_id, "Placement cancelled after reservation, compensating");
            let reconciliation = self.compensate_absent(order_id, &key).await;
            return Err(PlaceOrderError::Cancelled { reconciliation });
        }

        let order = OrderRecord {
            order_id,
            customer_id,
            status: OrderStatus::Pending,
            items,
            created_at: Utc::now(),
        };

        match timeout(self.config.commit_timeout, self.orders.commit_order(&order)).await {
            Ok(Ok(())) => {
                info!(%order_id, "Order committed");
                Ok(order)
            }
            Ok(Err(e)) => {
                // The commit transaction rolled back, so no order row exists.
                error!(%order_id, error = %e, "Order commit failed, releasing reservation");
                let reconciliation = self.compensate_absent(order_id, &key).await;
                Err(PlaceOrderError::internal(
                    format!("order could not be saved: {e}"),
                    reconciliation,
                ))
            }
            Err(_) => {
                // The commit may still land; only compensate if we can claim
                // the intent before it does.
                error!(%order_id, "Order commit timed out");
                match self.compensate(order_id, &key, false).await {
                    Compensation::OrderCommitted => {
                        info!(%order_id, "Order committed despite the timeout");
                        Ok(order)
                    }
                    Compensation::Done(reconciliation) => Err(PlaceOrderError::Timeout {
                        message: "order commit timed out".into(),
                        reconciliation,
                    }),
                }
            }
        }
    }

    /// Read-then-adjust with retries on version conflicts.
    async fn reserve(
        &self,
        key: &str,
        lines: &[OrderItem],
        cancel: &mut CancelSignal,
    ) -> Result<(), ReserveFailure> {
        let product_ids: Vec<i64> = lines.iter().map(|line| line.product_id).collect();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if is_cancelled(cancel) {
                return Err(ReserveFailure::Aborted(PlaceOrderError::Cancelled {
                    reconciliation: Reconciliation::NotNeeded,
                }));
            }

            let current = match timeout(
                self.config.remote_timeout,
                self.inventory.get_inventories(&product_ids),
            )
            .await
            {
                Ok(Ok(records)) => records,
                Ok(Err(error)) if error.is_rejection() => {
                    return Err(ReserveFailure::Rejected {
                        error,
                        attempts: attempt,
                    })
                }
                outcome => {
                    // Reads are idempotent, so transient failures are retried.
                    let error = match outcome {
                        Ok(Err(error)) => error,
                        _ => InventoryError::timeout("inventory lookup timed out"),
                    };
                    if attempt >= self.config.max_attempts {
                        return Err(ReserveFailure::Aborted(match error {
                            InventoryError::Timeout { message } => PlaceOrderError::Timeout {
                                message,
                                reconciliation: Reconciliation::NotNeeded,
                            },
                            other => PlaceOrderError::internal(other, Reconciliation::NotNeeded),
                        }));
                    }
                    warn!(attempt, error = %error, "Inventory lookup failed, retrying");
                    self.backoff(attempt, cancel).await?;
                    continue;
                }
            };

            let requests = lines
                .iter()
                .map(|line| {
                    current
                        .iter()
                        .find(|record| record.product_id == line.product_id)
                        .map(|record| AdjustmentRequest {
                            product_id: line.product_id,
                            delta: -line.quantity,
                            expected_version: record.version,
                        })
                        .ok_or(ReserveFailure::Rejected {
                            error: InventoryError::NotFound {
                                product_id: line.product_id,
                            },
                            attempts: attempt,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let call = timeout(
                self.config.remote_timeout,
                self.inventory.adjust_many(key, requests),
            );
            let outcome = tokio::select! {
                outcome = call => outcome,
                _ = cancelled(cancel) => return Err(ReserveFailure::CancelledInFlight),
            };

            match outcome {
                Ok(Ok(results)) => {
                    info!(key, items = results.len(), attempt, "Inventory reserved");
                    return Ok(());
                }
                Ok(Err(InventoryError::VersionConflict {
                    product_id,
                    expected,
                    actual,
                })) if attempt < self.config.max_attempts => {
                    warn!(
                        key,
                        attempt, product_id, expected, actual, "Inventory changed underneath us, retrying"
                    );
                    self.backoff(attempt, cancel).await?;
                }
                Ok(Err(error)) if error.is_rejection() => {
                    return Err(ReserveFailure::Rejected {
                        error,
                        attempts: attempt,
                    })
                }
                Ok(Err(error)) => return Err(ReserveFailure::Unknown(error)),
                Err(_) => {
                    return Err(ReserveFailure::Unknown(InventoryError::timeout(
                        "inventory adjustment timed out",
                    )))
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32, cancel: &mut CancelSignal) -> Result<(), ReserveFailure> {
        let delay = backoff_delay(&self.config, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancelled(cancel) => Err(ReserveFailure::Aborted(PlaceOrderError::Cancelled {
                reconciliation: Reconciliation::NotNeeded,
            })),
        }
    }

    async fn close_rejected(&self, order_id: Uuid) {
        if let Err(e) = self
            .orders
            .transition_intent(order_id, IntentStatus::Pending, IntentStatus::Rejected)
            .await
        {
            // Left pending, the sweeper releases the key; a no-op for a batch
            // that never applied.
            warn!(%order_id, error = %e, "Could not close rejected reservation intent");
        }
    }

    /// Compensation when the order is known not to be committed.
    async fn compensate_absent(&self, order_id: Uuid, key: &str) -> Reconciliation {
        match self.compensate(order_id, key, true).await {
            Compensation::Done(reconciliation) => reconciliation,
            Compensation::OrderCommitted => {
                error!(%order_id, "Intent marked committed for an order that failed to commit");
                Reconciliation::Pending
            }
        }
    }

    /// Claims the intent (`Pending → Compensating`), releases the reservation
    /// and closes the intent as `Released`.
    ///
    /// If the claim cannot be recorded, the release only goes ahead when
    /// `order_absent` guarantees no order row exists.
    async fn compensate(&self, order_id: Uuid, key: &str, order_absent: bool) -> Compensation {
        match self
            .orders
            .transition_intent(order_id, IntentStatus::Pending, IntentStatus::Compensating)
            .await
        {
            Ok(()) => {}
            Err(OrderStoreError::IntentClosed { status, .. }) => match status {
                IntentStatus::Committed => return Compensation::OrderCommitted,
                IntentStatus::Released | IntentStatus::Rejected => {
                    return Compensation::Done(Reconciliation::Released)
                }
                // Someone else is compensating; releasing again is harmless.
                IntentStatus::Compensating | IntentStatus::Pending => {}
            },
            Err(e) if order_absent => {
                warn!(%order_id, error = %e, "Could not claim intent, releasing anyway");
            }
            Err(e) => {
                error!(%order_id, error = %e, "Could not claim intent; leaving it to the sweeper");
                return Compensation::Done(Reconciliation::Pending);
            }
        }

        match timeout(self.config.remote_timeout, self.inventory.release(key)).await {
            Ok(Ok(restored)) => {
                info!(%order_id, restored = restored.len(), "Reservation released");
            }
            Ok(Err(e)) => {
                error!(%order_id, error = %e, "Releasing reservation failed");
                return Compensation::Done(Reconciliation::Pending);
            }
            Err(_) => {
                error!(%order_id, "Releasing reservation timed out");
                return Compensation::Done(Reconciliation::Pending);
            }
        }

        if let Err(e) = self
            .orders
            .transition_intent(order_id, IntentStatus::Compensating, IntentStatus::Released)
            .await
        {
            // The inventory side is settled; a later sweep re-releases
            // idempotently and closes the intent.
            warn!(%order_id, error = %e, "Could not mark intent released");
        }
        Compensation::Done(Reconciliation::Released)
    }
}

/// Validates the order lines and merges repeated products into one
/// inventory line each, in first-seen order.
fn reservation_lines(items: &[OrderItem]) -> Result<Vec<OrderItem>, PlaceOrderError> {
    if items.is_empty() {
        return Err(PlaceOrderError::Invalid("order has no items".into()));
    }

    let mut lines: Vec<OrderItem> = Vec::with_capacity(items.len());
    for item in items {
        if item.product_id == EMPTY_PRODUCT_ID {
            return Err(PlaceOrderError::Invalid("product id must be non-zero".into()));
        }
        if item.quantity <= 0 {
            return Err(PlaceOrderError::Invalid(format!(
                "quantity for product {} must be positive",
                item.product_id
            )));
        }
        match lines.iter_mut().find(|line| line.product_id == item.product_id) {
            Some(line) => {
                line.quantity = line.quantity.checked_add(item.quantity).ok_or_else(|| {
                    PlaceOrderError::Invalid(format!(
                        "quantity for product {} is too large",
                        item.product_id
                    ))
                })?;
            }
            None => lines.push(*item),
        }
    }
    Ok(lines)
}

/// Exponential backoff capped at `max_backoff`, with jitter over the upper
/// half of the window.
fn backoff_delay(config: &CoordinatorConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let window = config
        .base_backoff
        .saturating_mul(1 << exp)
        .min(config.max_backoff);
    let millis = window.as_millis() as u64;
    if millis == 0 {
        return window;
    }
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}

fn is_cancelled(signal: &CancelSignal) -> bool {
    *signal.borrow()
}

/// Resolves once the signal reads `true`; never resolves if the sender goes
/// away first.
async fn cancelled(signal: &mut CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: i64, quantity: i32) -> OrderItem {
        OrderItem {
            product_id,
            quantity,
        }
    }

    #[test]
    fn duplicate_lines_merge_in_first_seen_order() {
        let lines = reservation_lines(&[item(5, 1), item(2, 2), item(5, 3)]).unwrap();
        assert_eq!(lines, vec![item(5, 4), item(2, 2)]);
    }

    #[test]
    fn bad_lines_are_rejected() {
        assert!(matches!(reservation_lines(&[]), Err(PlaceOrderError::Invalid(_))));
        assert!(matches!(
            reservation_lines(&[item(1, 0)]),
            Err(PlaceOrderError::Invalid(_))
        ));
        assert!(matches!(
            reservation_lines(&[item(0, 1)]),
            Err(PlaceOrderError::Invalid(_))
        ));
        assert!(matches!(
            reservation_lines(&[item(1, i32::MAX), item(1, 1)]),
            Err(PlaceOrderError::Invalid(_))
        ));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = CoordinatorConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            ..CoordinatorConfig::default()
        };
        for _ in 0..20 {
            let first = backoff_delay(&config, 1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let capped = backoff_delay(&config, 10);
            assert!(capped >= Duration::from_millis(200) && capped <= Duration::from_millis(400));
        }
    }

    #[test]
    fn error_classes() {
        assert!(PlaceOrderError::InsufficientInventory {
            product_id: 1,
            available: 0,
            requested: 1
        }
        .is_client_error());
        let err = PlaceOrderError::internal("disk", Reconciliation::Released);
        assert!(!err.is_client_error());
        assert_eq!(err.reconciliation(), Reconciliation::Released);
    }

    #[test]
    fn cancellation_is_a_client_error_only_when_nothing_was_reserved() {
        let clean = PlaceOrderError::Cancelled {
            reconciliation: Reconciliation::NotNeeded,
        };
        assert!(clean.is_client_error());

        for reconciliation in [Reconciliation::Released, Reconciliation::Pending] {
            let err = PlaceOrderError::Cancelled { reconciliation };
            assert!(!err.is_client_error());
            assert_eq!(err.reconciliation(), reconciliation);
        }
    }

    #[tokio::test]
    async fn dropped_sender_is_not_a_cancellation() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!is_cancelled(&rx));
        let waited = tokio::time::timeout(Duration::from_millis(20), cancelled(&mut rx)).await;
        assert!(waited.is_err());
    }
}
