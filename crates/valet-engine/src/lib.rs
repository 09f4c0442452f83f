//! valet-engine — request handling and reconciliation around the placement
//! core.
//!
//! Owns the shared [`EngineState`]: the resource topology, the placement
//! cache, and the stack and decision caches. Every entry point takes the
//! single engine lock for its whole duration.
//!
//! # Architecture
//!
//! ```text
//! Engine (Arc<Mutex<EngineState>>)
//!   ├── handle()            AppRequestHandler: parse → search → commit
//!   ├── process_events()    EventReconciler over the store's event queue
//!   ├── refresh_inventory() Inventory pulled outside the lock, applied inside
//!   └── EngineState
//!       ├── ResourceTopology   (valet-placement)
//!       ├── PlacementCache     write-through to StateBackend
//!       ├── stack cache        LRU of StackRecord
//!       └── decision history   LRU of request id → hosts
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod handler;
pub mod inventory;
pub mod reconciler;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{LruCache, PlacementCache, PlacementUpdate};
pub use engine::{Engine, EngineState};
pub use error::{EngineError, EngineResult};
pub use handler::{Action, AppRequest, AppResponse, Reply};
pub use inventory::{Inventory, InventoryDump, StaticInventory};
pub use reconciler::BatchReport;
pub use tasks::{run_event_loop, run_inventory_refresh};
