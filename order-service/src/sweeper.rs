use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

use crate::client::InventoryClient;
use crate::store::{IntentStatus, OrderStore, OrderStoreError, ReservationIntent};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Age after which a still-pending intent is treated as orphaned. Must
    /// exceed the longest a placement can take end to end.
    pub reservation_timeout: Duration,
    pub batch_size: i64,
    pub release_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            reservation_timeout: Duration::from_secs(120),
            batch_size: 100,
            release_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Released,
    Skipped,
    Failed,
}

/// Releases inventory held for orders that never committed, e.g. after the
/// order service crashed between reserving and committing.
pub struct ReconciliationSweeper {
    inventory: Arc<dyn InventoryClient>,
    orders: Arc<dyn OrderStore>,
    config: SweeperConfig,
}

impl ReconciliationSweeper {
    pub fn new(
        inventory: Arc<dyn InventoryClient>,
        orders: Arc<dyn OrderStore>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            inventory,
            orders,
            config,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.interval);

        loop {
            interval.tick().await;

            match self.sweep_once().await {
                Ok(report) if report.released + report.failed > 0 => {
                    info!(?report, "Reconciliation sweep finished");
                }
                Ok(_) => {}
                Err(e) => error!("Error sweeping reservation intents: {}", e),
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let timeout = chrono::Duration::from_std(self.config.reservation_timeout)?;
        let cutoff = Utc::now() - timeout;

        let stale = self
            .orders
            .stale_intents(cutoff, self.config.batch_size)
            .await?;

        let outcomes = join_all(stale.iter().map(|intent| self.reconcile(intent))).await;

        let mut report = SweepReport::default();
        for outcome in outcomes {
            match outcome {
                Outcome::Released => report.released += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        Ok(report)
    }

    async fn reconcile(&self, intent: &ReservationIntent) -> Outcome {
        let order_id = intent.order_id;

        if intent.status == IntentStatus::Pending {
            match self
                .orders
                .transition_intent(order_id, IntentStatus::Pending, IntentStatus::Compensating)
                .await
            {
                Ok(()) => {}
                // Committed or closed since the scan.
                Err(OrderStoreError::IntentClosed { .. }) => return Outcome::Skipped,
                Err(e) => {
                    warn!(%order_id, error = %e, "Could not claim stale intent");
                    return Outcome::Failed;
                }
            }
        }

        let key = intent.reservation_key();
        match time::timeout(self.config.release_timeout, self.inventory.release(&key)).await {
            Ok(Ok(restored)) => {
                info!(%order_id, restored = restored.len(), "Released orphaned reservation");
            }
            Ok(Err(e)) => {
                error!(%order_id, error = %e, "Releasing orphaned reservation failed");
                return Outcome::Failed;
            }
            Err(_) => {
                error!(%order_id, "Releasing orphaned reservation timed out");
                return Outcome::Failed;
            }
        }

        match self
            .orders
            .transition_intent(order_id, IntentStatus::Compensating, IntentStatus::Released)
            .await
        {
            Ok(()) | Err(OrderStoreError::IntentClosed { .. }) => Outcome::Released,
            Err(e) => {
                warn!(%order_id, error = %e, "Could not close released intent");
                Outcome::Failed
            }
        }
    }
}
