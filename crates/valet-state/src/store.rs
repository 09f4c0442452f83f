//! StateStore: redb-backed persistence for Valet.
//!
//! Provides typed CRUD operations over placements, stacks, queued events
//! and resource snapshots. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
        txn.open_table(STACKS).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Scan a table in key order, keeping records whose key passes `keep`.
    fn scan_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        keep: impl Fn(&str) -> bool,
        limit: usize,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            if results.len() >= limit {
                break;
            }
            let (key, value) = entry.map_err(map_err!(Read))?;
            if keep(key.value()) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    fn delete_keys(&self, table: JsonTable, keys: &[String]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            for key in keys {
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Placements ─────────────────────────────────────────────────

    /// Insert or update a placement.
    pub fn put_placement(&self, placement: &Placement) -> StateResult<()> {
        self.put_json(PLACEMENTS, placement.table_key(), placement)?;
        debug!(uuid = %placement.uuid, host = %placement.host, "placement stored");
        Ok(())
    }

    /// Get a placement by uuid (or planned key).
    pub fn get_placement(&self, uuid: &str) -> StateResult<Option<Placement>> {
        self.get_json(PLACEMENTS, uuid)
    }

    /// Delete a placement. Returns true if it existed.
    pub fn delete_placement(&self, uuid: &str) -> StateResult<bool> {
        let existed = self.delete_keys(PLACEMENTS, &[uuid.to_string()])? > 0;
        debug!(%uuid, existed, "placement deleted");
        Ok(existed)
    }

    /// List all placements belonging to a stack.
    pub fn list_placements_for_stack(&self, stack_id: &str) -> StateResult<Vec<Placement>> {
        let all: Vec<Placement> = self.scan_json(PLACEMENTS, |_| true, usize::MAX)?;
        Ok(all.into_iter().filter(|p| p.stack_id == stack_id).collect())
    }

    // ── Stacks ─────────────────────────────────────────────────────

    /// Insert or update a stack record.
    pub fn put_stack(&self, stack: &StackRecord) -> StateResult<()> {
        self.put_json(STACKS, stack.table_key(), stack)?;
        debug!(stack_id = %stack.stack_id, "stack stored");
        Ok(())
    }

    pub fn get_stack(&self, stack_id: &str) -> StateResult<Option<StackRecord>> {
        self.get_json(STACKS, stack_id)
    }

    /// Delete a stack record. Returns true if it existed.
    pub fn delete_stack(&self, stack_id: &str) -> StateResult<bool> {
        Ok(self.delete_keys(STACKS, &[stack_id.to_string()])? > 0)
    }

    pub fn list_stacks(&self) -> StateResult<Vec<StackRecord>> {
        self.scan_json(STACKS, |_| true, usize::MAX)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Queue an inbound event.
    pub fn put_event(&self, event: &EventRecord) -> StateResult<()> {
        self.put_json(EVENTS, &event.table_key(), event)
    }

    /// Oldest queued events first, at most `limit`.
    pub fn list_events(&self, limit: usize) -> StateResult<Vec<EventRecord>> {
        self.scan_json(EVENTS, |_| true, limit)
    }

    /// Delete processed events. Returns number deleted.
    pub fn delete_events(&self, event_ids: &[u64]) -> StateResult<u32> {
        let keys: Vec<String> = event_ids.iter().map(|id| event_key(*id)).collect();
        let count = self.delete_keys(EVENTS, &keys)?;
        debug!(count, "events deleted");
        Ok(count)
    }

    // ── Resource snapshots ─────────────────────────────────────────

    pub fn put_resource_snapshot(&self, snapshot: &ResourceSnapshot) -> StateResult<()> {
        self.put_json(RESOURCES, snapshot.table_key(), snapshot)?;
        debug!(datacenter = %snapshot.datacenter, hosts = snapshot.hosts.len(), "resource snapshot stored");
        Ok(())
    }

    pub fn get_resource_snapshot(&self, datacenter: &str) -> StateResult<Option<ResourceSnapshot>> {
        self.get_json(RESOURCES, datacenter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn test_placement(uuid: &str, stack_id: &str) -> Placement {
        Placement {
            uuid: uuid.to_string(),
            stack_id: stack_id.to_string(),
            orch_id: format!("orch-{uuid}"),
            host: "host-1".to_string(),
            state: Some(PlacementState::Planned),
            original_host: None,
            verified: false,
            dirty: false,
            timestamp: 1000,
        }
    }

    fn test_stack(stack_id: &str) -> StackRecord {
        let mut resources = BTreeMap::new();
        resources.insert("vm1".to_string(), StackResource::server("vm1", "m1.small"));
        StackRecord {
            stack_id: stack_id.to_string(),
            resources,
            groups: BTreeMap::new(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_event(event_id: u64) -> EventRecord {
        EventRecord {
            event_id,
            exchange: "nova".to_string(),
            method: "instance_active".to_string(),
            args: serde_json::json!({ "uuid": "u1", "host": "host-1" }),
        }
    }

    // ── Placement CRUD ─────────────────────────────────────────────

    #[test]
    fn placement_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let p = test_placement("u1", "s1");

        store.put_placement(&p).unwrap();
        let retrieved = store.get_placement("u1").unwrap();

        assert_eq!(retrieved, Some(p));
    }

    #[test]
    fn placement_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_placement("nope").unwrap().is_none());
    }

    #[test]
    fn placement_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_placement(&test_placement("u1", "s1")).unwrap();

        assert!(store.delete_placement("u1").unwrap());
        assert!(!store.delete_placement("u1").unwrap());
        assert!(store.get_placement("u1").unwrap().is_none());
    }

    #[test]
    fn placement_list_for_stack() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_placement(&test_placement("u1", "s1")).unwrap();
        store.put_placement(&test_placement("u2", "s1")).unwrap();
        store.put_placement(&test_placement("u3", "s2")).unwrap();

        assert_eq!(store.list_placements_for_stack("s1").unwrap().len(), 2);
        assert_eq!(store.list_placements_for_stack("s2").unwrap().len(), 1);
    }

    // ── Stack CRUD ─────────────────────────────────────────────────

    #[test]
    fn stack_put_get_update() {
        let store = StateStore::open_in_memory().unwrap();
        let mut stack = test_stack("s1");
        store.put_stack(&stack).unwrap();

        stack.updated_at = 2000;
        stack
            .resources
            .get_mut("vm1")
            .unwrap()
            .properties
            .host = Some("host-9".to_string());
        store.put_stack(&stack).unwrap();

        let retrieved = store.get_stack("s1").unwrap().unwrap();
        assert_eq!(retrieved.updated_at, 2000);
        assert_eq!(
            retrieved.resources["vm1"].properties.host.as_deref(),
            Some("host-9")
        );
        assert_eq!(store.list_stacks().unwrap().len(), 1);
        assert!(store.delete_stack("s1").unwrap());
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_listed_in_id_order_with_limit() {
        let store = StateStore::open_in_memory().unwrap();
        for id in [12u64, 3, 100, 7] {
            store.put_event(&test_event(id)).unwrap();
        }

        let ids: Vec<u64> = store
            .list_events(10)
            .unwrap()
            .iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec![3, 7, 12, 100]);

        assert_eq!(store.list_events(2).unwrap().len(), 2);
    }

    #[test]
    fn events_delete_batch() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_event(&test_event(1)).unwrap();
        store.put_event(&test_event(2)).unwrap();
        store.put_event(&test_event(3)).unwrap();

        assert_eq!(store.delete_events(&[1, 2, 42]).unwrap(), 2);
        let remaining = store.list_events(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event_id, 3);
    }

    // ── Snapshots ──────────────────────────────────────────────────

    #[test]
    fn snapshot_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let snapshot = ResourceSnapshot {
            datacenter: "dc1".to_string(),
            capacity: Capacity::new(8, 8192, 100),
            used: Capacity::ZERO,
            hosts: Vec::new(),
            host_groups: Vec::new(),
            groups: Vec::new(),
            updated_at: 1000,
        };
        store.put_resource_snapshot(&snapshot).unwrap();
        assert_eq!(store.get_resource_snapshot("dc1").unwrap(), Some(snapshot));
        assert!(store.get_resource_snapshot("dc2").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_placement(&test_placement("u1", "s1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let placement = store.get_placement("u1").unwrap();
        assert_eq!(placement.unwrap().stack_id, "s1");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_stacks().unwrap().is_empty());
        assert!(store.list_events(10).unwrap().is_empty());
        assert!(store.list_placements_for_stack("any").unwrap().is_empty());
        assert!(!store.delete_stack("nope").unwrap());
        assert_eq!(store.delete_events(&[1]).unwrap(), 0);
    }
}
