pub mod api;
pub mod memory;
pub mod models;
pub mod pg;
pub mod schema;
pub mod service;
pub mod store;
pub mod versioning;

pub use memory::MemoryInventoryStore;
pub use service::InventoryService;
pub use store::InventoryStore;
