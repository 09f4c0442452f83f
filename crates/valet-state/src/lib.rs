//! valet-state — persistent store collaborator for Valet.
//!
//! Backed by [redb](https://docs.rs/redb), holds placements, stack records,
//! the inbound infrastructure event queue, and resource-status snapshots.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{stack_id}:{orch_id}`) and zero-padded event ids keep
//! related records adjacent and events in arrival order.
//!
//! The engine only talks to the store through the [`StateBackend`] trait;
//! [`StateStore`] is the production implementation. It is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`).

pub mod backend;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use backend::StateBackend;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
