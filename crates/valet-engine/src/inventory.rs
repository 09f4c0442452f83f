//! Infrastructure inventory collaborator and its reconciliation.

use async_trait::async_trait;
use tracing::info;
use valet_state::{AggregateInventory, FlavorInventory, HostInventory};

use crate::engine::EngineState;
use crate::error::EngineResult;

/// Source of hosts, flavors, availability zones and aggregates.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn list_hosts(&self) -> anyhow::Result<Vec<HostInventory>>;
    async fn list_flavors(&self) -> anyhow::Result<Vec<FlavorInventory>>;
    /// Availability zones and host aggregates.
    async fn list_aggregates(&self) -> anyhow::Result<Vec<AggregateInventory>>;
}

/// Inventory held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    pub hosts: Vec<HostInventory>,
    pub flavors: Vec<FlavorInventory>,
    pub aggregates: Vec<AggregateInventory>,
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn list_hosts(&self) -> anyhow::Result<Vec<HostInventory>> {
        Ok(self.hosts.clone())
    }

    async fn list_flavors(&self) -> anyhow::Result<Vec<FlavorInventory>> {
        Ok(self.flavors.clone())
    }

    async fn list_aggregates(&self) -> anyhow::Result<Vec<AggregateInventory>> {
        Ok(self.aggregates.clone())
    }
}

/// One complete pull from an [`Inventory`].
#[derive(Debug, Clone, Default)]
pub struct InventoryDump {
    pub hosts: Vec<HostInventory>,
    pub flavors: Vec<FlavorInventory>,
    pub aggregates: Vec<AggregateInventory>,
}

impl InventoryDump {
    pub async fn fetch(inventory: &dyn Inventory) -> anyhow::Result<Self> {
        Ok(Self {
            hosts: inventory.list_hosts().await?,
            flavors: inventory.list_flavors().await?,
            aggregates: inventory.list_aggregates().await?,
        })
    }
}

impl EngineState {
    /// Reconcile a pulled inventory into the topology and snapshot it to
    /// the store if anything changed.
    pub fn apply_inventory(&mut self, dump: &InventoryDump) -> EngineResult<bool> {
        let mut changed = self.topology.sync_flavors(&dump.flavors);
        changed |= self.topology.sync_hosts(&dump.hosts);
        changed |= self.topology.sync_aggregates(&dump.aggregates);
        if !changed {
            return Ok(false);
        }
        self.topology.update_topology();
        let snapshot = self.topology.snapshot();
        self.store.put_resource_snapshot(&snapshot)?;
        info!(
            hosts = snapshot.hosts.len(),
            groups = snapshot.groups.len(),
            generation = self.topology.generation(),
            "resource topology refreshed"
        );
        Ok(true)
    }
}
