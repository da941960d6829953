pub mod api;
pub mod client;
pub mod coordinator;
pub mod memory;
pub mod models;
pub mod outbox;
pub mod pg;
pub mod schema;
pub mod store;
pub mod sweeper;

pub use client::{HttpInventoryClient, InventoryClient};
pub use coordinator::{CancelSignal, CoordinatorConfig, OrderCoordinator, PlaceOrderError, Reconciliation};
pub use memory::MemoryOrderStore;
pub use store::{IntentStatus, OrderStore, OrderStoreError, ReservationIntent};
pub use sweeper::{ReconciliationSweeper, SweepReport, SweeperConfig};
