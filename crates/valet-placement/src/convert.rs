//! Type conversions between inventory records and topology types.
//!
//! Bridges `valet_state::{HostInventory, FlavorInventory, AggregateInventory}`
//! to the topology's `Host`, `Flavor` and `Group`.

use std::collections::{BTreeMap, BTreeSet};

use valet_core::OvercommitConfig;
use valet_state::{AggregateInventory, AggregateKind, Capacity, FlavorInventory, HostInventory};

use crate::resource::{Flavor, Group, GroupType, Host, Level};

/// Rack assigned to hosts the inventory does not place in a rack.
pub fn default_rack(datacenter: &str) -> String {
    format!("{datacenter}-rack")
}

/// Cluster assigned to racks the inventory does not place in a cluster.
pub fn default_cluster(datacenter: &str) -> String {
    format!("{datacenter}-cluster")
}

/// Raw capacity reported for a host.
pub fn original_capacity(inv: &HostInventory) -> Capacity {
    Capacity::new(inv.vcpus, inv.memory_mb, inv.local_gb)
}

/// Capacity left for placement after overcommit and the standby reserve.
///
/// Each resource is `floor(original × ratio × (1 − standby_ratio))`.
pub fn apply_overcommit(original: &Capacity, overcommit: &OvercommitConfig) -> Capacity {
    let keep = 1.0 - overcommit.standby_ratio;
    let scale = |value: u64, ratio: f64| (value as f64 * ratio * keep).floor() as u64;
    Capacity {
        vcpus: scale(original.vcpus, overcommit.cpu),
        mem_mb: scale(original.mem_mb, overcommit.memory),
        disk_gb: scale(original.disk_gb, overcommit.disk),
    }
}

/// Convert a [`HostInventory`] to a fresh [`Host`] under `rack`.
pub fn host_from_inventory(inv: &HostInventory, rack: &str, overcommit: &OvercommitConfig) -> Host {
    let original = original_capacity(inv);
    Host {
        name: inv.name.clone(),
        status: inv.status,
        state: inv.state,
        original,
        capacity: apply_overcommit(&original, overcommit),
        used: Capacity::ZERO,
        memberships: BTreeSet::new(),
        vm_list: BTreeMap::new(),
        parent: rack.to_string(),
        last_update: 0,
    }
}

/// Convert a [`FlavorInventory`] to a [`Flavor`].
///
/// Disk demand folds in ephemeral disk and swap (rounded up to whole GB).
pub fn flavor_from_inventory(inv: &FlavorInventory) -> Flavor {
    Flavor {
        id: inv.id.clone(),
        name: inv.name.clone(),
        vcpus: inv.vcpus,
        mem_mb: inv.memory_mb,
        disk_gb: inv.disk_gb + inv.ephemeral_gb + inv.swap_mb.div_ceil(1024),
        extra_specs: inv.extra_specs.clone(),
        enabled: inv.enabled,
    }
}

/// Convert an [`AggregateInventory`] to an AZ or AGGR [`Group`].
pub fn group_from_aggregate(inv: &AggregateInventory) -> Group {
    let group_type = match inv.kind {
        AggregateKind::AvailabilityZone => GroupType::Az,
        AggregateKind::Aggregate => GroupType::Aggr,
    };
    let mut group = Group::new(&inv.name, group_type, Level::Host);
    group.metadata = inv.metadata.clone();
    group.hosts = inv.hosts.iter().cloned().collect();
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_state::{HostState, HostStatus};

    fn sample_host() -> HostInventory {
        HostInventory {
            name: "compute-1".to_string(),
            rack: Some("r1".to_string()),
            cluster: None,
            status: HostStatus::Enabled,
            state: HostState::Up,
            vcpus: 8,
            memory_mb: 16384,
            local_gb: 100,
        }
    }

    #[test]
    fn overcommit_scales_and_floors() {
        let oc = OvercommitConfig {
            cpu: 16.0,
            memory: 1.5,
            disk: 1.0,
            standby_ratio: 0.0,
        };
        let cap = apply_overcommit(&Capacity::new(8, 1001, 100), &oc);
        assert_eq!(cap, Capacity::new(128, 1501, 100));
    }

    #[test]
    fn standby_holds_back_capacity() {
        let oc = OvercommitConfig {
            standby_ratio: 0.25,
            ..OvercommitConfig::none()
        };
        let cap = apply_overcommit(&Capacity::new(8, 1000, 10), &oc);
        assert_eq!(cap, Capacity::new(6, 750, 7));
    }

    #[test]
    fn converts_host_fields() {
        let host = host_from_inventory(&sample_host(), "r1", &OvercommitConfig::none());
        assert_eq!(host.name, "compute-1");
        assert_eq!(host.parent, "r1");
        assert_eq!(host.original, Capacity::new(8, 16384, 100));
        assert_eq!(host.capacity, host.original);
        assert!(host.used.is_zero());
        assert!(host.vm_list.is_empty());
    }

    #[test]
    fn flavor_disk_includes_ephemeral_and_swap() {
        let inv = FlavorInventory {
            id: "2".to_string(),
            name: "m1.small".to_string(),
            vcpus: 1,
            memory_mb: 2048,
            disk_gb: 20,
            ephemeral_gb: 5,
            swap_mb: 512,
            extra_specs: BTreeMap::new(),
            enabled: true,
        };
        let flavor = flavor_from_inventory(&inv);
        assert_eq!(flavor.disk_gb, 26);
        assert_eq!(flavor.demand(), Capacity::new(1, 2048, 26));
    }

    #[test]
    fn aggregate_kind_maps_to_group_type() {
        let inv = AggregateInventory {
            name: "az1".to_string(),
            kind: AggregateKind::AvailabilityZone,
            metadata: BTreeMap::new(),
            hosts: vec!["compute-1".to_string()],
        };
        let group = group_from_aggregate(&inv);
        assert_eq!(group.group_type, GroupType::Az);
        assert_eq!(group.level, Level::Host);
        assert!(group.hosts.contains("compute-1"));
    }
}
