//! ResourceTopology: in-memory model of the datacenter.
//!
//! Datacenter → cluster → rack → host, plus the flavor catalog and the
//! membership groups (AZ/AGGR synced from inventory, EX/DIV/AFF created by
//! placements). Every mutation bumps [`ResourceTopology::generation`] and
//! touches `last_update` on what it changed.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};
use valet_core::OvercommitConfig;
use valet_state::{
    AggregateInventory, Capacity, FlavorInventory, GroupSnapshot, HostGroupSnapshot,
    HostInventory, HostSnapshot, HostStatus, ResourceSnapshot, epoch_secs,
};

use crate::convert::{
    apply_overcommit, default_cluster, default_rack, flavor_from_inventory, group_from_aggregate,
    host_from_inventory, original_capacity,
};
use crate::error::{TopologyError, TopologyResult};
use crate::resource::{
    Datacenter, Flavor, Group, GroupType, Host, HostGroup, HostUpdate, Level, MembershipTag,
    PlacedVm, VmRef,
};

pub struct ResourceTopology {
    datacenter: Datacenter,
    clusters: BTreeMap<String, HostGroup>,
    racks: BTreeMap<String, HostGroup>,
    hosts: BTreeMap<String, Host>,
    flavors: BTreeMap<String, Flavor>,
    groups: BTreeMap<String, Group>,
    overcommit: OvercommitConfig,
    generation: u64,
}

impl ResourceTopology {
    pub fn new(datacenter: &str, overcommit: OvercommitConfig) -> Self {
        Self {
            datacenter: Datacenter {
                name: datacenter.to_string(),
                capacity: Capacity::ZERO,
                used: Capacity::ZERO,
                children: BTreeSet::new(),
                last_update: 0,
            },
            clusters: BTreeMap::new(),
            racks: BTreeMap::new(),
            hosts: BTreeMap::new(),
            flavors: BTreeMap::new(),
            groups: BTreeMap::new(),
            overcommit,
            generation: 0,
        }
    }

    fn touch(&mut self) -> u64 {
        let now = epoch_secs();
        self.generation += 1;
        self.datacenter.last_update = now;
        now
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Incremented on every mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_update(&self) -> u64 {
        self.datacenter.last_update
    }

    pub fn datacenter(&self) -> &Datacenter {
        &self.datacenter
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn racks(&self) -> impl Iterator<Item = &HostGroup> {
        self.racks.values()
    }

    pub fn clusters(&self) -> impl Iterator<Item = &HostGroup> {
        self.clusters.values()
    }

    /// A rack or cluster by level and name.
    pub fn host_group(&self, level: Level, name: &str) -> Option<&HostGroup> {
        match level {
            Level::Host => None,
            Level::Rack => self.racks.get(name),
            Level::Cluster => self.clusters.get(name),
        }
    }

    /// Look a flavor up by name, falling back to id.
    pub fn flavor(&self, name_or_id: &str) -> Option<&Flavor> {
        self.flavors
            .get(name_or_id)
            .or_else(|| self.flavors.values().find(|f| f.id == name_or_id))
    }

    pub fn flavors(&self) -> impl Iterator<Item = &Flavor> {
        self.flavors.values()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    // ── Capacity queries ───────────────────────────────────────────

    /// (total, available) capacity of a resource at `level`.
    pub fn capacity_of(&self, level: Level, name: &str) -> TopologyResult<(Capacity, Capacity)> {
        match level {
            Level::Host => self
                .hosts
                .get(name)
                .map(|h| (h.capacity, h.avail()))
                .ok_or_else(|| TopologyError::UnknownHost(name.to_string())),
            Level::Rack | Level::Cluster => self
                .host_group(level, name)
                .map(|g| (g.capacity, g.avail()))
                .ok_or_else(|| TopologyError::UnknownResource {
                    level,
                    name: name.to_string(),
                }),
        }
    }

    pub fn get_vcpus(&self, level: Level, name: &str) -> TopologyResult<(u64, u64)> {
        let (total, avail) = self.capacity_of(level, name)?;
        Ok((total.vcpus, avail.vcpus))
    }

    pub fn get_mem(&self, level: Level, name: &str) -> TopologyResult<(u64, u64)> {
        let (total, avail) = self.capacity_of(level, name)?;
        Ok((total.mem_mb, avail.mem_mb))
    }

    pub fn get_local_disk(&self, level: Level, name: &str) -> TopologyResult<(u64, u64)> {
        let (total, avail) = self.capacity_of(level, name)?;
        Ok((total.disk_gb, avail.disk_gb))
    }

    // ── Membership queries ─────────────────────────────────────────

    pub fn memberships(&self, level: Level, name: &str) -> Option<&BTreeSet<String>> {
        match level {
            Level::Host => self.hosts.get(name).map(|h| &h.memberships),
            _ => self.host_group(level, name).map(|g| &g.memberships),
        }
    }

    fn memberships_mut(&mut self, level: Level, name: &str) -> Option<&mut BTreeSet<String>> {
        match level {
            Level::Host => self.hosts.get_mut(name).map(|h| &mut h.memberships),
            Level::Rack => self.racks.get_mut(name).map(|g| &mut g.memberships),
            Level::Cluster => self.clusters.get_mut(name).map(|g| &mut g.memberships),
        }
    }

    /// Number of VMs placed under a resource.
    pub fn num_vms(&self, level: Level, name: &str) -> usize {
        match level {
            Level::Host => self.hosts.get(name).map_or(0, |h| h.vm_list.len()),
            Level::Rack => self.racks.get(name).map_or(0, |r| {
                r.children.iter().map(|h| self.num_vms(Level::Host, h)).sum()
            }),
            Level::Cluster => self.clusters.get(name).map_or(0, |c| {
                c.children.iter().map(|r| self.num_vms(Level::Rack, r)).sum()
            }),
        }
    }

    /// Name of the resource at `level` that contains `host`.
    pub fn ancestor(&self, host: &str, level: Level) -> Option<String> {
        let h = self.hosts.get(host)?;
        match level {
            Level::Host => Some(h.name.clone()),
            Level::Rack => Some(h.parent.clone()),
            Level::Cluster => self.racks.get(&h.parent)?.parent.clone(),
        }
    }

    // ── VM bookkeeping ─────────────────────────────────────────────

    /// Account a VM on `host` and record its group memberships.
    ///
    /// Re-adding a VM already on the host replaces its entry. Nothing is
    /// changed if the host is unknown.
    pub fn add_vm_to_host(
        &mut self,
        host: &str,
        vm: VmRef,
        demand: Capacity,
        tags: Vec<MembershipTag>,
    ) -> TopologyResult<()> {
        if !self.hosts.contains_key(host) {
            return Err(TopologyError::UnknownHost(host.to_string()));
        }
        let key = vm.key();
        if self.hosts[host].vm_list.contains_key(&key) {
            self.remove_vm_from_host(host, &key)?;
        }

        let mut resolved = Vec::with_capacity(tags.len());
        for tag in &tags {
            let resource = self
                .ancestor(host, tag.level)
                .ok_or_else(|| TopologyError::UnknownResource {
                    level: tag.level,
                    name: host.to_string(),
                })?;
            resolved.push((tag.clone(), resource));
        }

        let now = self.touch();
        if let Some(h) = self.hosts.get_mut(host) {
            h.used += demand;
            h.last_update = now;
            h.vm_list.insert(
                key.clone(),
                PlacedVm {
                    vm,
                    demand,
                    tags,
                },
            );
        }

        for (tag, resource) in resolved {
            let group = self
                .groups
                .entry(tag.name.clone())
                .or_insert_with(|| Group::new(&tag.name, tag.group_type, tag.level));
            if group.group_type != tag.group_type {
                warn!(group = %tag.name, "membership tag type clashes with existing group");
                continue;
            }
            group
                .vms_per_resource
                .entry(resource.clone())
                .or_default()
                .insert(key.clone());
            group.last_update = now;
            if let Some(memberships) = self.memberships_mut(tag.level, &resource) {
                memberships.insert(tag.name);
            }
        }

        self.recompute_ancestors(host);
        debug!(%host, vm = %key, "vm added to host");
        Ok(())
    }

    /// Release a VM from `host`, dropping memberships it alone held.
    ///
    /// Returns the removed entry, or `None` if the VM was not on the host.
    pub fn remove_vm_from_host(&mut self, host: &str, key: &str) -> TopologyResult<Option<PlacedVm>> {
        let h = self
            .hosts
            .get_mut(host)
            .ok_or_else(|| TopologyError::UnknownHost(host.to_string()))?;
        let Some(placed) = h.vm_list.remove(key) else {
            return Ok(None);
        };
        h.used = h.used.saturating_sub(&placed.demand);

        let now = self.touch();
        if let Some(h) = self.hosts.get_mut(host) {
            h.last_update = now;
        }

        for tag in &placed.tags {
            let Some(resource) = self.ancestor(host, tag.level) else {
                continue;
            };
            let mut drop_membership = false;
            let mut drop_group = false;
            if let Some(group) = self.groups.get_mut(&tag.name) {
                if let Some(vms) = group.vms_per_resource.get_mut(&resource) {
                    vms.remove(key);
                    if vms.is_empty() {
                        group.vms_per_resource.remove(&resource);
                        drop_membership = true;
                    }
                }
                group.last_update = now;
                drop_group = group.group_type.is_app_group() && group.vms_per_resource.is_empty();
            }
            if drop_membership {
                if let Some(memberships) = self.memberships_mut(tag.level, &resource) {
                    memberships.remove(&tag.name);
                }
            }
            if drop_group {
                self.groups.remove(&tag.name);
                debug!(group = %tag.name, "empty group removed");
            }
        }

        self.recompute_ancestors(host);
        debug!(%host, vm = %key, "vm removed from host");
        Ok(Some(placed))
    }

    /// Record the physical uuid of an accounted VM.
    pub fn update_vm_uuid(&mut self, key: &str, uuid: &str) -> bool {
        let Some(host) = self.find_vm(key).map(|(h, _)| h.to_string()) else {
            return false;
        };
        let now = self.touch();
        match self.hosts.get_mut(&host).and_then(|h| {
            h.last_update = now;
            h.vm_list.get_mut(key)
        }) {
            Some(placed) => {
                placed.vm.uuid = Some(uuid.to_string());
                true
            }
            None => false,
        }
    }

    /// Host and entry of a VM by key.
    pub fn find_vm(&self, key: &str) -> Option<(&str, &PlacedVm)> {
        self.hosts
            .values()
            .find_map(|h| h.vm_list.get(key).map(|vm| (h.name.as_str(), vm)))
    }

    /// Host and entry of a VM by physical uuid.
    pub fn find_vm_by_uuid(&self, uuid: &str) -> Option<(&str, &PlacedVm)> {
        self.hosts.values().find_map(|h| {
            h.vm_list
                .values()
                .find(|vm| vm.vm.uuid.as_deref() == Some(uuid))
                .map(|vm| (h.name.as_str(), vm))
        })
    }

    /// Every VM of a stack with the host it is accounted on.
    pub fn vms_of_stack(&self, stack_id: &str) -> Vec<(String, PlacedVm)> {
        self.hosts
            .values()
            .flat_map(|h| {
                h.vm_list
                    .values()
                    .filter(|vm| vm.vm.stack_id == stack_id)
                    .map(|vm| (h.name.clone(), vm.clone()))
            })
            .collect()
    }

    // ── Inventory sync ─────────────────────────────────────────────

    fn ensure_cluster(&mut self, cluster: &str) {
        if !self.clusters.contains_key(cluster) {
            self.clusters
                .insert(cluster.to_string(), HostGroup::new(cluster, Level::Cluster, None));
            self.datacenter.children.insert(cluster.to_string());
        }
    }

    fn ensure_rack(&mut self, rack: &str, cluster: &str) {
        match self.racks.get(rack) {
            Some(existing) => {
                if existing.parent.as_deref() != Some(cluster) {
                    warn!(%rack, %cluster, "rack already belongs to another cluster");
                }
            }
            None => {
                self.ensure_cluster(cluster);
                self.racks.insert(
                    rack.to_string(),
                    HostGroup::new(rack, Level::Rack, Some(cluster.to_string())),
                );
                if let Some(c) = self.clusters.get_mut(cluster) {
                    c.children.insert(rack.to_string());
                }
            }
        }
    }

    /// Add a host or update an existing one. Returns true on change.
    pub fn upsert_host(&mut self, inv: &HostInventory) -> bool {
        let dc = self.datacenter.name.clone();
        let rack = inv.rack.clone().unwrap_or_else(|| default_rack(&dc));
        let cluster = inv.cluster.clone().unwrap_or_else(|| default_cluster(&dc));
        self.ensure_rack(&rack, &cluster);

        let Some(existing) = self.hosts.get(&inv.name) else {
            let mut host = host_from_inventory(inv, &rack, &self.overcommit);
            for group in self.groups.values() {
                if !group.group_type.is_app_group() && group.hosts.contains(&inv.name) {
                    host.memberships.insert(group.name.clone());
                }
            }
            let now = self.touch();
            host.last_update = now;
            self.hosts.insert(inv.name.clone(), host);
            if let Some(r) = self.racks.get_mut(&rack) {
                r.children.insert(inv.name.clone());
            }
            self.recompute_ancestors(&inv.name);
            info!(host = %inv.name, %rack, "host added");
            return true;
        };

        let original = original_capacity(inv);
        let moved = existing.parent != rack;
        let changed = existing.status != inv.status
            || existing.state != inv.state
            || existing.original != original;
        if changed {
            let capacity = apply_overcommit(&original, &self.overcommit);
            let now = self.touch();
            if let Some(h) = self.hosts.get_mut(&inv.name) {
                h.status = inv.status;
                h.state = inv.state;
                h.original = original;
                h.capacity = capacity;
                h.last_update = now;
            }
            self.recompute_ancestors(&inv.name);
            debug!(host = %inv.name, "host updated");
        }
        if moved {
            self.relocate_host(&inv.name, &rack);
        }
        changed || moved
    }

    /// Move a host to another rack, re-accounting its VMs there.
    fn relocate_host(&mut self, name: &str, rack: &str) {
        let keys: Vec<String> = self
            .hosts
            .get(name)
            .map(|h| h.vm_list.keys().cloned().collect())
            .unwrap_or_default();
        let mut detached = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Ok(Some(vm)) = self.remove_vm_from_host(name, key) {
                detached.push(vm);
            }
        }

        let old_rack = match self.hosts.get_mut(name) {
            Some(h) => std::mem::replace(&mut h.parent, rack.to_string()),
            None => return,
        };
        if let Some(r) = self.racks.get_mut(&old_rack) {
            r.children.remove(name);
        }
        if let Some(r) = self.racks.get_mut(rack) {
            r.children.insert(name.to_string());
        }
        self.prune_host_groups();

        for vm in detached {
            if let Err(e) = self.add_vm_to_host(name, vm.vm, vm.demand, vm.tags) {
                warn!(host = %name, error = %e, "failed to re-account vm after relocation");
            }
        }
        self.touch();
        self.recompute_all();
        info!(host = %name, from = %old_rack, to = %rack, "host relocated");
    }

    /// Remove a host that no longer carries VMs.
    fn remove_host(&mut self, name: &str) {
        let Some(host) = self.hosts.remove(name) else {
            return;
        };
        if let Some(r) = self.racks.get_mut(&host.parent) {
            r.children.remove(name);
        }
        for group in self.groups.values_mut() {
            group.hosts.remove(name);
        }
        self.prune_host_groups();
        self.touch();
        info!(host = %name, "host removed");
    }

    fn prune_host_groups(&mut self) {
        let empty_racks: Vec<String> = self
            .racks
            .values()
            .filter(|r| r.children.is_empty())
            .map(|r| r.name.clone())
            .collect();
        for rack in empty_racks {
            if let Some(r) = self.racks.remove(&rack) {
                if let Some(c) = r.parent.and_then(|c| self.clusters.get_mut(&c)) {
                    c.children.remove(&rack);
                }
            }
        }
        let empty_clusters: Vec<String> = self
            .clusters
            .values()
            .filter(|c| c.children.is_empty())
            .map(|c| c.name.clone())
            .collect();
        for cluster in empty_clusters {
            self.clusters.remove(&cluster);
            self.datacenter.children.remove(&cluster);
        }
    }

    /// Reconcile the host inventory. Returns true if anything changed.
    ///
    /// Vanished hosts are removed when empty and disabled otherwise, so the
    /// VMs they still carry stay accounted.
    pub fn sync_hosts(&mut self, inventory: &[HostInventory]) -> bool {
        let mut changed = false;
        for inv in inventory {
            changed |= self.upsert_host(inv);
        }

        let seen: BTreeSet<&str> = inventory.iter().map(|h| h.name.as_str()).collect();
        let vanished: Vec<String> = self
            .hosts
            .keys()
            .filter(|name| !seen.contains(name.as_str()))
            .cloned()
            .collect();
        for name in vanished {
            let has_vms = self.hosts.get(&name).is_some_and(|h| !h.vm_list.is_empty());
            if has_vms {
                let now = epoch_secs();
                if let Some(h) = self.hosts.get_mut(&name) {
                    if h.status != HostStatus::Disabled {
                        h.status = HostStatus::Disabled;
                        h.last_update = now;
                        changed = true;
                        warn!(host = %name, vms = h.vm_list.len(), "host vanished from inventory, disabled");
                    }
                }
            } else {
                self.remove_host(&name);
                changed = true;
            }
        }

        if changed {
            self.update_topology();
        }
        changed
    }

    /// Replace the flavor catalog. Returns true if it changed.
    pub fn sync_flavors(&mut self, inventory: &[FlavorInventory]) -> bool {
        let flavors: BTreeMap<String, Flavor> = inventory
            .iter()
            .filter(|f| f.enabled)
            .map(|f| (f.name.clone(), flavor_from_inventory(f)))
            .collect();
        if flavors == self.flavors {
            return false;
        }
        info!(count = flavors.len(), "flavor catalog updated");
        self.flavors = flavors;
        self.touch();
        true
    }

    /// Replace the AZ/AGGR groups. EX/DIV/AFF groups are untouched.
    pub fn sync_aggregates(&mut self, inventory: &[AggregateInventory]) -> bool {
        let mut incoming: BTreeMap<String, Group> = BTreeMap::new();
        for inv in inventory {
            if self
                .groups
                .get(&inv.name)
                .is_some_and(|g| g.group_type.is_app_group())
            {
                warn!(group = %inv.name, "aggregate name clashes with an application group, skipped");
                continue;
            }
            incoming.insert(inv.name.clone(), group_from_aggregate(inv));
        }

        let same = |a: &Group, b: &Group| {
            a.group_type == b.group_type && a.metadata == b.metadata && a.hosts == b.hosts
        };
        let current: Vec<&Group> = self
            .groups
            .values()
            .filter(|g| !g.group_type.is_app_group())
            .collect();
        let unchanged = current.len() == incoming.len()
            && current
                .iter()
                .all(|g| incoming.get(&g.name).is_some_and(|n| same(g, n)));
        if unchanged {
            return false;
        }

        let stale: Vec<String> = current.iter().map(|g| g.name.clone()).collect();
        for name in stale {
            if let Some(group) = self.groups.remove(&name) {
                for host in &group.hosts {
                    if let Some(h) = self.hosts.get_mut(host) {
                        h.memberships.remove(&name);
                    }
                }
            }
        }

        let now = self.touch();
        for (name, mut group) in incoming {
            for host in &group.hosts {
                if let Some(h) = self.hosts.get_mut(host) {
                    h.memberships.insert(name.clone());
                    h.last_update = now;
                }
            }
            group.last_update = now;
            self.groups.insert(name, group);
        }
        info!("availability zones and aggregates updated");
        true
    }

    /// Apply a compute-node change to a known host.
    pub fn update_host(&mut self, name: &str, update: &HostUpdate) -> TopologyResult<bool> {
        let overcommit = self.overcommit;
        let h = self
            .hosts
            .get_mut(name)
            .ok_or_else(|| TopologyError::UnknownHost(name.to_string()))?;

        let mut original = h.original;
        if let Some(vcpus) = update.vcpus {
            original.vcpus = vcpus;
        }
        if let Some(mem) = update.memory_mb {
            original.mem_mb = mem;
        }
        if let Some(disk) = update.local_gb {
            original.disk_gb = disk;
        }
        let status = update.status.unwrap_or(h.status);
        let state = update.state.unwrap_or(h.state);
        if original == h.original && status == h.status && state == h.state {
            return Ok(false);
        }

        h.original = original;
        h.capacity = apply_overcommit(&original, &overcommit);
        h.status = status;
        h.state = state;
        let now = self.touch();
        if let Some(h) = self.hosts.get_mut(name) {
            h.last_update = now;
        }
        self.recompute_ancestors(name);
        debug!(host = %name, ?status, ?state, "host updated from compute node event");
        Ok(true)
    }

    // ── Aggregation ────────────────────────────────────────────────

    fn recompute_rack(&mut self, rack: &str) {
        let Some(r) = self.racks.get(rack) else {
            return;
        };
        let usable = r
            .children
            .iter()
            .filter_map(|h| self.hosts.get(h))
            .filter(|h| h.is_usable());
        let (capacity, used) = usable.fold((Capacity::ZERO, Capacity::ZERO), |(c, u), h| {
            (c + h.capacity, u + h.used)
        });
        if let Some(r) = self.racks.get_mut(rack) {
            if r.capacity != capacity || r.used != used {
                r.capacity = capacity;
                r.used = used;
                r.last_update = epoch_secs();
            }
        }
    }

    fn recompute_cluster(&mut self, cluster: &str) {
        let Some(c) = self.clusters.get(cluster) else {
            return;
        };
        let (capacity, used) = c
            .children
            .iter()
            .filter_map(|r| self.racks.get(r))
            .fold((Capacity::ZERO, Capacity::ZERO), |(cap, u), r| {
                (cap + r.capacity, u + r.used)
            });
        if let Some(c) = self.clusters.get_mut(cluster) {
            if c.capacity != capacity || c.used != used {
                c.capacity = capacity;
                c.used = used;
                c.last_update = epoch_secs();
            }
        }
    }

    fn recompute_datacenter(&mut self) {
        let capacity: Capacity = self.clusters.values().map(|c| c.capacity).sum();
        let used: Capacity = self.clusters.values().map(|c| c.used).sum();
        self.datacenter.capacity = capacity;
        self.datacenter.used = used;
    }

    fn recompute_ancestors(&mut self, host: &str) {
        let Some(rack) = self.hosts.get(host).map(|h| h.parent.clone()) else {
            return;
        };
        self.recompute_rack(&rack);
        if let Some(cluster) = self.racks.get(&rack).and_then(|r| r.parent.clone()) {
            self.recompute_cluster(&cluster);
        }
        self.recompute_datacenter();
    }

    fn recompute_all(&mut self) {
        let racks: Vec<String> = self.racks.keys().cloned().collect();
        for rack in racks {
            self.recompute_rack(&rack);
        }
        let clusters: Vec<String> = self.clusters.keys().cloned().collect();
        for cluster in clusters {
            self.recompute_cluster(&cluster);
        }
        self.recompute_datacenter();
    }

    /// Recompute capacity bottom-up. Returns true if any total changed.
    pub fn update_topology(&mut self) -> bool {
        let before = (self.datacenter.capacity, self.datacenter.used);
        let now = epoch_secs();
        let mut changed = false;
        for host in self.hosts.values_mut() {
            let capacity = apply_overcommit(&host.original, &self.overcommit);
            if capacity != host.capacity {
                host.capacity = capacity;
                host.last_update = now;
                changed = true;
            }
        }
        self.recompute_all();
        changed |= before != (self.datacenter.capacity, self.datacenter.used);
        if changed {
            self.touch();
        }
        changed
    }

    /// Point-in-time copy for the store.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let host_groups = self
            .clusters
            .values()
            .chain(self.racks.values())
            .map(|g| HostGroupSnapshot {
                name: g.name.clone(),
                level: g.level.to_string(),
                parent: g.parent.clone(),
                children: g.children.iter().cloned().collect(),
                capacity: g.capacity,
                used: g.used,
                memberships: g.memberships.iter().cloned().collect(),
                last_update: g.last_update,
            })
            .collect();
        ResourceSnapshot {
            datacenter: self.datacenter.name.clone(),
            capacity: self.datacenter.capacity,
            used: self.datacenter.used,
            hosts: self
                .hosts
                .values()
                .map(|h| HostSnapshot {
                    name: h.name.clone(),
                    parent: h.parent.clone(),
                    status: h.status,
                    state: h.state,
                    original: h.original,
                    capacity: h.capacity,
                    used: h.used,
                    memberships: h.memberships.iter().cloned().collect(),
                    vms: h.vm_list.keys().cloned().collect(),
                    last_update: h.last_update,
                })
                .collect(),
            host_groups,
            groups: self
                .groups
                .values()
                .map(|g| GroupSnapshot {
                    name: g.name.clone(),
                    group_type: g.group_type.to_string(),
                    level: g.level.to_string(),
                    metadata: g.metadata.clone(),
                    vms: g.vm_list().into_iter().map(String::from).collect(),
                    last_update: g.last_update,
                })
                .collect(),
            updated_at: self.datacenter.last_update,
        }
    }
}
