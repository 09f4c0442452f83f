//! Fixtures shared by the engine's unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use valet_core::{OvercommitConfig, ValetConfig};
use valet_state::*;

use crate::engine::EngineState;
use crate::inventory::{InventoryDump, StaticInventory};

pub(crate) fn config() -> ValetConfig {
    ValetConfig {
        overcommit: OvercommitConfig::none(),
        ..Default::default()
    }
}

pub(crate) fn host_inv(name: &str, rack: &str, vcpus: u64, mem: u64, disk: u64) -> HostInventory {
    HostInventory {
        name: name.to_string(),
        rack: Some(rack.to_string()),
        cluster: Some("c1".to_string()),
        status: HostStatus::Enabled,
        state: HostState::Up,
        vcpus,
        memory_mb: mem,
        local_gb: disk,
    }
}

pub(crate) fn flavor_inv(name: &str, vcpus: u64, mem: u64, disk: u64) -> FlavorInventory {
    FlavorInventory {
        id: format!("id-{name}"),
        name: name.to_string(),
        vcpus,
        memory_mb: mem,
        disk_gb: disk,
        ephemeral_gb: 0,
        swap_mb: 0,
        extra_specs: BTreeMap::new(),
        enabled: true,
    }
}

/// Two racks of two 8-vcpu hosts each.
pub(crate) fn static_inventory() -> StaticInventory {
    StaticInventory {
        hosts: vec![
            host_inv("h1", "r1", 8, 8192, 100),
            host_inv("h2", "r1", 8, 8192, 100),
            host_inv("h3", "r2", 8, 8192, 100),
            host_inv("h4", "r2", 8, 8192, 100),
        ],
        flavors: vec![
            flavor_inv("small", 1, 1024, 10),
            flavor_inv("medium", 2, 2048, 20),
            flavor_inv("large", 4, 4096, 40),
            flavor_inv("huge", 16, 16384, 100),
        ],
        aggregates: Vec::new(),
    }
}

pub(crate) fn engine_state_with<S: StateBackend + 'static>(store: Arc<S>) -> (EngineState, Arc<S>) {
    let mut state = EngineState::new(&config(), store.clone());
    let inventory = static_inventory();
    state
        .apply_inventory(&InventoryDump {
            hosts: inventory.hosts,
            flavors: inventory.flavors,
            aggregates: inventory.aggregates,
        })
        .unwrap();
    (state, store)
}

pub(crate) fn engine_state() -> (EngineState, Arc<StateStore>) {
    engine_state_with(Arc::new(StateStore::open_in_memory().unwrap()))
}

pub(crate) fn server(name: &str, flavor: &str) -> StackResource {
    StackResource::server(name, flavor)
}

pub(crate) fn servers(specs: &[(&str, &str)]) -> BTreeMap<OrchId, StackResource> {
    specs
        .iter()
        .map(|(id, flavor)| (id.to_string(), server(id, flavor)))
        .collect()
}

pub(crate) fn group(
    orch_id: &str,
    group_type: &str,
    level: &str,
    name: Option<&str>,
    members: &[&str],
) -> (OrchId, GroupSpec) {
    (
        orch_id.to_string(),
        GroupSpec {
            group_type: group_type.to_string(),
            level: Some(level.to_string()),
            name: name.map(String::from),
            members: members.iter().map(|m| m.to_string()).collect(),
        },
    )
}

pub(crate) fn event(event_id: u64, method: &str, args: serde_json::Value) -> EventRecord {
    EventRecord {
        event_id,
        exchange: "nova".to_string(),
        method: method.to_string(),
        args,
    }
}

/// In-memory store whose writes can be made to fail.
pub(crate) struct FlakyStore {
    pub(crate) inner: StateStore,
    fail: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: StateStore::open_in_memory().unwrap(),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> StateResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StateError::Write("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl StateBackend for FlakyStore {
    fn get_placement(&self, uuid: &str) -> StateResult<Option<Placement>> {
        self.inner.get_placement(uuid)
    }

    fn put_placement(&self, placement: &Placement) -> StateResult<()> {
        self.check()?;
        self.inner.put_placement(placement)
    }

    fn delete_placement(&self, uuid: &str) -> StateResult<bool> {
        self.check()?;
        self.inner.delete_placement(uuid)
    }

    fn get_stack(&self, stack_id: &str) -> StateResult<Option<StackRecord>> {
        self.inner.get_stack(stack_id)
    }

    fn put_stack(&self, stack: &StackRecord) -> StateResult<()> {
        self.check()?;
        self.inner.put_stack(stack)
    }

    fn list_events(&self, limit: usize) -> StateResult<Vec<EventRecord>> {
        self.inner.list_events(limit)
    }

    fn delete_events(&self, event_ids: &[u64]) -> StateResult<u32> {
        self.check()?;
        self.inner.delete_events(event_ids)
    }

    fn put_resource_snapshot(&self, snapshot: &ResourceSnapshot) -> StateResult<()> {
        self.check()?;
        self.inner.put_resource_snapshot(snapshot)
    }
}
