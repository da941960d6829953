mod common;

use common::{harness, item, Harness};
use order_service::{
    IntentStatus, InventoryClient, OrderStore, ReconciliationSweeper, ReservationIntent,
    SweepReport, SweeperConfig,
};
use shared::{AdjustmentRequest, InventoryError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn sweeper(h: &Harness, reservation_timeout: Duration) -> ReconciliationSweeper {
    ReconciliationSweeper::new(
        h.client.clone() as Arc<dyn InventoryClient>,
        h.orders.clone() as Arc<dyn OrderStore>,
        SweeperConfig {
            reservation_timeout,
            ..SweeperConfig::default()
        },
    )
}

/// Leaves behind what a placement that crashed after reserving would: a
/// pending intent and an applied inventory batch under its key.
async fn crashed_placement(h: &Harness, product_id: i64, quantity: i32) -> ReservationIntent {
    let intent = ReservationIntent::pending(Uuid::new_v4(), 7, vec![item(product_id, quantity)]);
    h.orders.record_intent(&intent).await.unwrap();

    let (_, version) = h.stock(product_id).await;
    h.inventory
        .adjust_many(
            Some(intent.reservation_key()),
            vec![AdjustmentRequest {
                product_id,
                delta: -quantity,
                expected_version: version,
            }],
        )
        .await
        .unwrap();
    intent
}

#[tokio::test]
async fn orphaned_reservation_is_released() {
    let h = harness(&[(1, 10)]).await;
    let intent = crashed_placement(&h, 1, 3).await;
    assert_eq!(h.stock(1).await, (7, 1));

    let report = sweeper(&h, Duration::ZERO).sweep_once().await.unwrap();

    assert_eq!(report.released, 1);
    assert_eq!(h.stock(1).await, (10, 2));
    assert_eq!(
        h.orders.intent(intent.order_id).await.unwrap().status,
        IntentStatus::Released
    );

    let again = sweeper(&h, Duration::ZERO).sweep_once().await.unwrap();
    assert_eq!(again, SweepReport::default());
    assert_eq!(h.stock(1).await, (10, 2));
}

#[tokio::test]
async fn intent_without_a_batch_blocks_a_late_batch() {
    let h = harness(&[(1, 10)]).await;
    let intent = ReservationIntent::pending(Uuid::new_v4(), 7, vec![item(1, 3)]);
    h.orders.record_intent(&intent).await.unwrap();

    let report = sweeper(&h, Duration::ZERO).sweep_once().await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(h.stock(1).await, (10, 0));

    // The adjust request was still in flight when the sweep ran.
    let late = h
        .inventory
        .adjust_many(
            Some(intent.reservation_key()),
            vec![AdjustmentRequest {
                product_id: 1,
                delta: -3,
                expected_version: 0,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(late, InventoryError::Released { .. }));
    assert_eq!(h.stock(1).await, (10, 0));
}

#[tokio::test]
async fn committed_and_rejected_placements_are_left_alone() {
    let h = harness(&[(1, 10)]).await;
    h.coordinator.place_order(1, vec![item(1, 3)]).await.unwrap();
    h.coordinator.place_order(2, vec![item(1, 30)]).await.unwrap_err();

    let report = sweeper(&h, Duration::ZERO).sweep_once().await.unwrap();

    assert_eq!(report, SweepReport::default());
    assert_eq!(h.stock(1).await.0, 7);
    assert_eq!(h.orders.order_count().await, 1);
}

#[tokio::test]
async fn young_intents_are_not_swept() {
    let h = harness(&[(1, 10)]).await;
    crashed_placement(&h, 1, 3).await;

    let report = sweeper(&h, Duration::from_secs(3600)).sweep_once().await.unwrap();

    assert_eq!(report, SweepReport::default());
    assert_eq!(h.stock(1).await.0, 7);
}

#[tokio::test]
async fn failed_release_is_retried_on_the_next_sweep() {
    let h = harness(&[(1, 10), (2, 10)]).await;
    let first = crashed_placement(&h, 1, 3).await;
    let second = crashed_placement(&h, 2, 4).await;
    h.client.fail_release.store(true, Ordering::SeqCst);

    let report = sweeper(&h, Duration::ZERO).sweep_once().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(
        h.orders.intent(first.order_id).await.unwrap().status,
        IntentStatus::Compensating
    );

    h.client.fail_release.store(false, Ordering::SeqCst);
    let report = sweeper(&h, Duration::ZERO).sweep_once().await.unwrap();

    assert_eq!(report.released, 2);
    assert_eq!(h.stock(1).await.0, 10);
    assert_eq!(h.stock(2).await.0, 10);
    for intent in [first, second] {
        assert_eq!(
            h.orders.intent(intent.order_id).await.unwrap().status,
            IntentStatus::Released
        );
    }
}

#[tokio::test]
async fn sweeper_finishes_a_compensation_the_coordinator_abandoned() {
    let h = harness(&[(1, 10)]).await;
    h.orders.fail_next_commits(1);
    h.client.fail_release.store(true, Ordering::SeqCst);
    h.coordinator.place_order(42, vec![item(1, 3)]).await.unwrap_err();
    assert_eq!(h.stock(1).await.0, 7);

    h.client.fail_release.store(false, Ordering::SeqCst);
    let report = sweeper(&h, Duration::ZERO).sweep_once().await.unwrap();

    assert_eq!(report.released, 1);
    assert_eq!(h.stock(1).await, (10, 2));
    assert_eq!(h.orders.order_count().await, 0);
}
