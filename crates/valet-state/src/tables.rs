//! redb table definitions for the Valet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Placements keyed by physical uuid, or `{stack_id}:{orch_id}` before the
/// uuid is known.
pub const PLACEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("placements");

/// Stack records keyed by `{stack_id}`.
pub const STACKS: TableDefinition<&str, &[u8]> = TableDefinition::new("stacks");

/// Inbound infrastructure events keyed by zero-padded event id.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Resource-status snapshots keyed by datacenter name.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");
