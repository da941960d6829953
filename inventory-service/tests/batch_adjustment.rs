use inventory_service::{InventoryService, MemoryInventoryStore};
use shared::{AdjustmentRequest, InventoryError};
use std::sync::Arc;

async fn service_with(products: &[(i64, i32)]) -> InventoryService {
    let service = InventoryService::new(Arc::new(MemoryInventoryStore::new()));
    for &(product_id, quantity) in products {
        service.create_product(product_id, quantity).await.unwrap();
    }
    service
}

fn req(product_id: i64, delta: i32, expected_version: i64) -> AdjustmentRequest {
    AdjustmentRequest {
        product_id,
        delta,
        expected_version,
    }
}

async fn snapshot(service: &InventoryService, product_id: i64) -> (i32, i64) {
    let record = service.get_inventory(product_id).await.unwrap();
    (record.quantity, record.version)
}

#[tokio::test]
async fn adjust_applies_delta_and_bumps_version() {
    let service = service_with(&[(1, 10)]).await;

    let result = service.adjust(1, -3, 0).await.unwrap();
    assert_eq!((result.new_quantity, result.new_version), (7, 1));

    let result = service.adjust(1, 5, 1).await.unwrap();
    assert_eq!((result.new_quantity, result.new_version), (12, 2));
    assert_eq!(snapshot(&service, 1).await, (12, 2));
}

#[tokio::test]
async fn adjust_with_stale_version_leaves_row_alone() {
    let service = service_with(&[(1, 10)]).await;
    service.adjust(1, -1, 0).await.unwrap();

    let err = service.adjust(1, -1, 0).await.unwrap_err();
    assert_eq!(
        err,
        InventoryError::VersionConflict {
            product_id: 1,
            expected: 0,
            actual: 1
        }
    );
    assert_eq!(snapshot(&service, 1).await, (9, 1));
}

#[tokio::test]
async fn adjust_below_zero_is_rejected() {
    let service = service_with(&[(1, 2)]).await;

    let err = service.adjust(1, -5, 0).await.unwrap_err();
    assert!(matches!(err, InventoryError::InsufficientInventory { .. }));
    assert_eq!(snapshot(&service, 1).await, (2, 0));
}

#[tokio::test]
async fn unknown_and_deleted_products_are_not_found() {
    let service = service_with(&[(1, 5)]).await;

    assert_eq!(
        service.adjust(42, -1, 0).await.unwrap_err(),
        InventoryError::NotFound { product_id: 42 }
    );

    service.delete_product(1).await.unwrap();
    assert_eq!(
        service.adjust(1, -1, 0).await.unwrap_err(),
        InventoryError::NotFound { product_id: 1 }
    );
    assert!(service.create_product(1, 3).await.is_err());
}

#[tokio::test]
async fn batch_results_follow_request_order_and_skip_empty_ids() {
    let service = service_with(&[(1, 10), (2, 10), (3, 10)]).await;

    let results = service
        .adjust_many(
            None,
            vec![req(3, -1, 0), req(0, -100, 0), req(1, -2, 0), req(2, -3, 0)],
        )
        .await
        .unwrap();

    let ids: Vec<i64> = results.iter().map(|r| r.product_id).collect();
    assert_eq!(ids, vec![3, 1, 2]);
    assert_eq!(results[0].new_quantity, 9);
    assert_eq!(results[1].new_quantity, 8);
    assert_eq!(results[2].new_quantity, 7);
    assert!(results.iter().all(|r| r.new_version == 1));
}

#[tokio::test]
async fn batch_of_only_empty_ids_is_a_no_op() {
    let service = service_with(&[]).await;
    let results = service
        .adjust_many(None, vec![req(0, -1, 0), req(0, 4, 3)])
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn failing_item_rolls_back_whole_batch() {
    let service = service_with(&[(1, 10), (2, 1), (3, 10)]).await;

    let err = service
        .adjust_many(None, vec![req(1, -5, 0), req(3, -5, 0), req(2, -5, 0)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        InventoryError::InsufficientInventory { product_id: 2, .. }
    ));
    for product_id in [1, 2, 3] {
        let (_, version) = snapshot(&service, product_id).await;
        assert_eq!(version, 0);
    }
    assert_eq!(snapshot(&service, 1).await.0, 10);
    assert_eq!(snapshot(&service, 3).await.0, 10);

    let err = service
        .adjust_many(None, vec![req(1, -1, 0), req(99, -1, 0)])
        .await
        .unwrap_err();
    assert_eq!(err, InventoryError::NotFound { product_id: 99 });
    assert_eq!(snapshot(&service, 1).await, (10, 0));

    let err = service
        .adjust_many(None, vec![req(1, -1, 0), req(3, -1, 7)])
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::VersionConflict { product_id: 3, .. }));
    assert_eq!(snapshot(&service, 1).await, (10, 0));
}

#[tokio::test]
async fn repeated_product_in_one_batch_chains_versions() {
    let service = service_with(&[(1, 10)]).await;

    let results = service
        .adjust_many(None, vec![req(1, -2, 0), req(1, -3, 1)])
        .await
        .unwrap();
    assert_eq!(results[1].new_quantity, 5);
    assert_eq!(snapshot(&service, 1).await, (5, 2));
}

#[tokio::test]
async fn keyed_batch_is_applied_once() {
    let service = service_with(&[(1, 10)]).await;
    let key = Some("order-1".to_string());

    let first = service.adjust_many(key.clone(), vec![req(1, -4, 0)]).await.unwrap();
    let replay = service.adjust_many(key, vec![req(1, -4, 0)]).await.unwrap();

    assert_eq!(first, replay);
    assert_eq!(snapshot(&service, 1).await, (6, 1));
}

#[tokio::test]
async fn release_restores_quantities_through_new_versions() {
    let service = service_with(&[(1, 10), (2, 5)]).await;
    service
        .adjust_many(Some("order-1".into()), vec![req(2, -5, 0), req(1, -3, 0)])
        .await
        .unwrap();
    service.adjust(1, -1, 1).await.unwrap();

    let restored = service.release("order-1").await.unwrap();
    assert_eq!(restored.len(), 2);
    assert_eq!(snapshot(&service, 1).await, (9, 3));
    assert_eq!(snapshot(&service, 2).await, (5, 2));

    assert!(service.release("order-1").await.unwrap().is_empty());
    assert_eq!(snapshot(&service, 1).await, (9, 3));
}

#[tokio::test]
async fn release_before_batch_blocks_late_delivery() {
    let service = service_with(&[(1, 10)]).await;

    assert!(service.release("order-9").await.unwrap().is_empty());

    let err = service
        .adjust_many(Some("order-9".into()), vec![req(1, -4, 0)])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        InventoryError::Released {
            idempotency_key: "order-9".into()
        }
    );
    assert_eq!(snapshot(&service, 1).await, (10, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_batches_serialize() {
    let service = service_with(&[(1, 10), (2, 10)]).await;

    // Opposite listing orders; canonical locking keeps them from deadlocking.
    let a = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .adjust_many(None, vec![req(1, -3, 0), req(2, -3, 0)])
                .await
        })
    };
    let b = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .adjust_many(None, vec![req(2, -4, 0), req(1, -4, 0)])
                .await
        })
    };

    let outcomes = [a.await.unwrap(), b.await.unwrap()];
    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1);
    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert!(matches!(e, InventoryError::VersionConflict { .. }));
        }
    }

    let (q1, v1) = snapshot(&service, 1).await;
    let (q2, v2) = snapshot(&service, 2).await;
    assert_eq!((v1, v2), (1, 1));
    assert!(q1 == 7 || q1 == 6);
    assert_eq!(q1, q2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_with_fresh_versions_both_apply() {
    let service = service_with(&[(1, 10)]).await;

    let mut handles = Vec::new();
    for delta in [-3, -4] {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let current = service.get_inventory(1).await?;
                match service.adjust(1, delta, current.version).await {
                    Err(InventoryError::VersionConflict { .. }) => continue,
                    other => return other,
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(snapshot(&service, 1).await, (3, 2));
}
