#![allow(dead_code)]

use async_trait::async_trait;
use inventory_service::{InventoryService, MemoryInventoryStore};
use order_service::{
    CoordinatorConfig, InventoryClient, MemoryOrderStore, OrderCoordinator, OrderStore,
};
use shared::{AdjustmentRequest, AdjustmentResult, InventoryError, InventoryRecord, OrderItem};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Inventory client that calls an in-process inventory service, with knobs
/// for the failures a network hop can produce.
#[derive(Default)]
pub struct LocalInventory {
    service: Option<InventoryService>,
    /// Apply the batch, then report a timeout as if the reply was lost.
    pub lose_adjust_reply: AtomicBool,
    pub fail_release: AtomicBool,
    /// Number of upcoming batches that race a concurrent writer bumping the
    /// first product's version between the read and the adjust.
    pub interleaved_writes: AtomicUsize,
    /// Flipped to cancel the placement right after a batch succeeds.
    pub cancel_after_adjust: Mutex<Option<watch::Sender<bool>>>,
    pub adjust_calls: AtomicUsize,
}

impl LocalInventory {
    pub fn new(service: InventoryService) -> Self {
        Self {
            service: Some(service),
            ..Self::default()
        }
    }

    fn service(&self) -> &InventoryService {
        self.service.as_ref().expect("inventory service configured")
    }
}

#[async_trait]
impl InventoryClient for LocalInventory {
    async fn get_inventories(&self, product_ids: &[i64]) -> Result<Vec<InventoryRecord>, InventoryError> {
        self.service().get_inventories(product_ids).await
    }

    async fn adjust_many(
        &self,
        idempotency_key: &str,
        adjustments: Vec<AdjustmentRequest>,
    ) -> Result<Vec<AdjustmentResult>, InventoryError> {
        self.adjust_calls.fetch_add(1, Ordering::SeqCst);

        let interleave = self
            .interleaved_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if interleave {
            let product_id = adjustments[0].product_id;
            let current = self.service().get_inventory(product_id).await?;
            self.service().adjust(product_id, 0, current.version).await?;
        }

        let results = self
            .service()
            .adjust_many(Some(idempotency_key.to_string()), adjustments)
            .await?;

        if let Some(cancel) = self.cancel_after_adjust.lock().await.as_ref() {
            cancel.send_replace(true);
        }
        if self.lose_adjust_reply.load(Ordering::SeqCst) {
            return Err(InventoryError::timeout("reply lost"));
        }
        Ok(results)
    }

    async fn release(&self, idempotency_key: &str) -> Result<Vec<AdjustmentResult>, InventoryError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(InventoryError::internal("inventory service unavailable"));
        }
        self.service().release(idempotency_key).await
    }
}

pub struct Harness {
    pub inventory: InventoryService,
    pub client: Arc<LocalInventory>,
    pub orders: Arc<MemoryOrderStore>,
    pub coordinator: OrderCoordinator,
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        remote_timeout: Duration::from_secs(2),
        commit_timeout: Duration::from_secs(2),
        max_attempts: 5,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

pub async fn harness(products: &[(i64, i32)]) -> Harness {
    harness_with(products, fast_config()).await
}

pub async fn harness_with(products: &[(i64, i32)], config: CoordinatorConfig) -> Harness {
    let inventory = InventoryService::new(Arc::new(MemoryInventoryStore::new()));
    for &(product_id, quantity) in products {
        inventory.create_product(product_id, quantity).await.unwrap();
    }

    let client = Arc::new(LocalInventory::new(inventory.clone()));
    let orders = Arc::new(MemoryOrderStore::new());
    let coordinator = OrderCoordinator::new(
        client.clone() as Arc<dyn InventoryClient>,
        orders.clone() as Arc<dyn OrderStore>,
        config,
    );

    Harness {
        inventory,
        client,
        orders,
        coordinator,
    }
}

impl Harness {
    pub async fn stock(&self, product_id: i64) -> (i32, i64) {
        let record = self.inventory.get_inventory(product_id).await.unwrap();
        (record.quantity, record.version)
    }
}

pub fn item(product_id: i64, quantity: i32) -> OrderItem {
    OrderItem {
        product_id,
        quantity,
    }
}
