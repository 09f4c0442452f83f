//! Working copy of free capacity and memberships used by one search.
//!
//! Built from the usable hosts of a [`ResourceTopology`], optionally
//! ignoring the VMs of one stack (the stack being re-planned). Search
//! deducts from this copy as it commits nodes; the topology itself is only
//! touched once the engine accepts the decisions.

use std::collections::{BTreeMap, BTreeSet};

use valet_state::{Capacity, OrchId, Placement};

use crate::resource::{GroupType, Level, MembershipTag, PlacedVm};
use crate::topology::ResourceTopology;

/// One host, rack or cluster as seen by search.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailResource {
    pub name: String,
    pub level: Level,
    /// Enclosing rack or cluster; `None` for a cluster.
    pub parent: Option<String>,
    pub capacity: Capacity,
    pub avail: Capacity,
    pub memberships: BTreeSet<String>,
    pub num_vms: usize,
    /// Aggregate metadata: key → values declared by aggregates covering
    /// this resource (or any host under it).
    pub metadata: BTreeMap<String, BTreeSet<String>>,
}

impl AvailResource {
    fn new(name: &str, level: Level, parent: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            level,
            parent,
            capacity: Capacity::ZERO,
            avail: Capacity::ZERO,
            memberships: BTreeSet::new(),
            num_vms: 0,
            metadata: BTreeMap::new(),
        }
    }
}

/// Free resources at every level, plus the group registry.
#[derive(Debug, Clone, Default)]
pub struct AvailResources {
    levels: [BTreeMap<String, AvailResource>; 3],
    group_types: BTreeMap<String, GroupType>,
    dc_capacity: Capacity,
    dc_avail: Capacity,
}

impl AvailResources {
    /// Snapshot the usable part of `topology`, treating the VMs of
    /// `exclude_stack` as already gone.
    pub fn build(topology: &ResourceTopology, exclude_stack: Option<&str>) -> Self {
        let prefix = exclude_stack.map(|s| Placement::planned_key(s, ""));
        let excluded_key = |key: &str| prefix.as_deref().is_some_and(|p| key.starts_with(p));
        let excluded = |vm: &PlacedVm| exclude_stack.is_some_and(|s| vm.vm.stack_id == s);

        let mut this = Self::default();

        for rack in topology.racks() {
            this.levels[Level::Rack.index()]
                .insert(rack.name.clone(), AvailResource::new(&rack.name, Level::Rack, rack.parent.clone()));
        }
        for cluster in topology.clusters() {
            this.levels[Level::Cluster.index()]
                .insert(cluster.name.clone(), AvailResource::new(&cluster.name, Level::Cluster, None));
        }

        // VM counts include unusable hosts: exclusivity cares about tenants,
        // not about whether the host takes new work.
        let mut rack_vms: BTreeMap<&str, usize> = BTreeMap::new();
        for host in topology.hosts() {
            let kept = host.vm_list.values().filter(|&vm| !excluded(vm)).count();
            *rack_vms.entry(host.parent.as_str()).or_default() += kept;
            if !host.is_usable() {
                continue;
            }
            let released: Capacity = host
                .vm_list
                .values()
                .filter(|&vm| excluded(vm))
                .map(|vm| vm.demand)
                .sum();
            let used = host.used.saturating_sub(&released);
            let mut entry = AvailResource::new(&host.name, Level::Host, Some(host.parent.clone()));
            entry.capacity = host.capacity;
            entry.avail = host.capacity.saturating_sub(&used);
            entry.num_vms = kept;
            this.levels[Level::Host.index()].insert(host.name.clone(), entry);
        }

        for (rack, count) in rack_vms {
            let cluster = topology
                .host_group(Level::Rack, rack)
                .and_then(|r| r.parent.clone());
            if let Some(entry) = this.levels[Level::Rack.index()].get_mut(rack) {
                entry.num_vms += count;
            }
            if let Some(entry) = cluster.and_then(|c| this.levels[Level::Cluster.index()].get_mut(&c)) {
                entry.num_vms += count;
            }
        }

        for group in topology.groups() {
            match group.group_type {
                GroupType::Az | GroupType::Aggr => {
                    this.group_types.insert(group.name.clone(), group.group_type);
                    for host in &group.hosts {
                        let Some(entry) = this.levels[Level::Host.index()].get_mut(host) else {
                            continue;
                        };
                        entry.memberships.insert(group.name.clone());
                        for (key, value) in &group.metadata {
                            entry.metadata.entry(key.clone()).or_default().insert(value.clone());
                        }
                    }
                }
                GroupType::Ex | GroupType::Div | GroupType::Aff => {
                    // A group whose only members are being re-planned has
                    // no seed yet; it is registered again on commit.
                    let mut seeded = false;
                    for (resource, vms) in &group.vms_per_resource {
                        if vms.iter().all(|key| excluded_key(key)) {
                            continue;
                        }
                        if let Some(entry) = this.levels[group.level.index()].get_mut(resource) {
                            entry.memberships.insert(group.name.clone());
                            seeded = true;
                        }
                    }
                    if seeded {
                        this.group_types.insert(group.name.clone(), group.group_type);
                    }
                }
            }
        }

        this.roll_up();
        this
    }

    /// Aggregate host capacity, AZ/AGGR memberships and metadata upward.
    fn roll_up(&mut self) {
        for level in [Level::Host, Level::Rack] {
            let Some(coarser) = level.coarser() else {
                continue;
            };
            let children: Vec<AvailResource> = self.levels[level.index()].values().cloned().collect();
            for entry in self.levels[coarser.index()].values_mut() {
                entry.capacity = Capacity::ZERO;
                entry.avail = Capacity::ZERO;
            }
            for child in children {
                let Some(parent) = child
                    .parent
                    .as_ref()
                    .and_then(|p| self.levels[coarser.index()].get_mut(p))
                else {
                    continue;
                };
                parent.capacity += child.capacity;
                parent.avail += child.avail;
                for name in &child.memberships {
                    if matches!(self.group_types.get(name), Some(GroupType::Az | GroupType::Aggr)) {
                        parent.memberships.insert(name.clone());
                    }
                }
                for (key, values) in &child.metadata {
                    parent
                        .metadata
                        .entry(key.clone())
                        .or_default()
                        .extend(values.iter().cloned());
                }
            }
        }
        // Racks and clusters with no usable host cannot take anything.
        for level in [Level::Rack, Level::Cluster] {
            self.levels[level.index()].retain(|_, r| !r.capacity.is_zero());
        }
        self.dc_capacity = self.levels[Level::Cluster.index()].values().map(|c| c.capacity).sum();
        self.dc_avail = self.levels[Level::Cluster.index()].values().map(|c| c.avail).sum();
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn dc_avail(&self) -> Capacity {
        self.dc_avail
    }

    pub fn dc_capacity(&self) -> Capacity {
        self.dc_capacity
    }

    pub fn group_types(&self) -> &BTreeMap<String, GroupType> {
        &self.group_types
    }

    pub fn get(&self, level: Level, name: &str) -> Option<&AvailResource> {
        self.levels[level.index()].get(name)
    }

    pub fn at(&self, level: Level) -> impl Iterator<Item = &AvailResource> {
        self.levels[level.index()].values()
    }

    pub fn names_at(&self, level: Level) -> Vec<String> {
        self.levels[level.index()].keys().cloned().collect()
    }

    /// Resources one level finer than `level` whose parent is `name`.
    pub fn children_of(&self, level: Level, name: &str) -> Vec<String> {
        let Some(finer) = level.finer() else {
            return Vec::new();
        };
        self.at(finer)
            .filter(|r| r.parent.as_deref() == Some(name))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Name of the resource at `target` containing `name` at `level`.
    pub fn ancestor(&self, level: Level, name: &str, target: Level) -> Option<String> {
        let mut level = level;
        let mut current = self.get(level, name)?;
        while level < target {
            let parent = current.parent.as_deref()?;
            level = level.coarser()?;
            current = self.get(level, parent)?;
        }
        (level == target).then(|| current.name.clone())
    }

    /// Whether any resource at `target` related to `name` satisfies `pred`:
    /// those below it for a finer `target`, its ancestor for a coarser one.
    pub fn any_under(
        &self,
        level: Level,
        name: &str,
        target: Level,
        pred: impl Fn(&AvailResource) -> bool,
    ) -> bool {
        if target >= level {
            return self
                .ancestor(level, name, target)
                .and_then(|a| self.get(target, &a))
                .is_some_and(pred);
        }
        self.at(target)
            .filter(|r| self.ancestor(target, &r.name, level).as_deref() == Some(name))
            .any(pred)
    }

    /// Largest available amount of `pick` among resources at `target`
    /// under `name`.
    pub fn max_avail_under(
        &self,
        level: Level,
        name: &str,
        target: Level,
        pick: impl Fn(&Capacity) -> u64,
    ) -> u64 {
        if target >= level {
            return self.get(level, name).map_or(0, |r| pick(&r.avail));
        }
        self.at(target)
            .filter(|r| self.ancestor(target, &r.name, level).as_deref() == Some(name))
            .map(|r| pick(&r.avail))
            .max()
            .unwrap_or(0)
    }

    // ── Commit ─────────────────────────────────────────────────────

    /// Deduct a VM's demand from `host` and everything above it.
    pub fn commit_vm(&mut self, host: &str, demand: Capacity, tags: &[MembershipTag]) {
        let mut level = Level::Host;
        let mut name = Some(host.to_string());
        while let Some(current) = name {
            let Some(entry) = self.levels[level.index()].get_mut(&current) else {
                break;
            };
            entry.avail = entry.avail.saturating_sub(&demand);
            entry.num_vms += 1;
            for tag in tags.iter().filter(|t| t.level == level) {
                entry.memberships.insert(tag.name.clone());
            }
            name = entry.parent.clone();
            match level.coarser() {
                Some(next) => level = next,
                None => break,
            }
        }
        self.dc_avail = self.dc_avail.saturating_sub(&demand);
        for tag in tags {
            self.group_types.entry(tag.name.clone()).or_insert(tag.group_type);
        }
    }
}

/// Nodes placed so far in the current search: orch_id → (level, resource).
#[derive(Debug, Clone, Default)]
pub struct PlacedNodes {
    nodes: BTreeMap<OrchId, (Level, String)>,
}

impl PlacedNodes {
    pub fn insert(&mut self, orch_id: &str, level: Level, resource: &str) {
        self.nodes
            .insert(orch_id.to_string(), (level, resource.to_string()));
    }

    pub fn get(&self, orch_id: &str) -> Option<(Level, &str)> {
        self.nodes
            .get(orch_id)
            .map(|(level, name)| (*level, name.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OrchId, Level, &str)> {
        self.nodes
            .iter()
            .map(|(id, (level, name))| (id, *level, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::VmRef;
    use crate::topology::tests::two_rack_topology;

    #[test]
    fn build_rolls_capacity_up() {
        let topo = two_rack_topology();
        let avail = AvailResources::build(&topo, None);
        assert_eq!(avail.dc_avail(), Capacity::new(32, 32768, 400));
        assert_eq!(avail.get(Level::Rack, "r1").unwrap().avail, Capacity::new(16, 16384, 200));
        assert_eq!(avail.children_of(Level::Rack, "r2"), vec!["h3", "h4"]);
        assert_eq!(avail.ancestor(Level::Host, "h3", Level::Cluster).as_deref(), Some("c1"));
    }

    #[test]
    fn excluded_stack_releases_capacity_and_memberships() {
        let mut topo = two_rack_topology();
        let tag = MembershipTag {
            name: "s1:g".to_string(),
            group_type: GroupType::Aff,
            level: Level::Rack,
        };
        topo.add_vm_to_host("h1", VmRef::new("s1", "a"), Capacity::new(4, 4096, 40), vec![tag])
            .unwrap();

        let with = AvailResources::build(&topo, None);
        assert_eq!(with.get(Level::Host, "h1").unwrap().avail, Capacity::new(4, 4096, 60));
        assert!(with.get(Level::Rack, "r1").unwrap().memberships.contains("s1:g"));
        assert_eq!(with.get(Level::Rack, "r1").unwrap().num_vms, 1);
        assert_eq!(with.group_types().get("s1:g"), Some(&GroupType::Aff));

        let without = AvailResources::build(&topo, Some("s1"));
        assert_eq!(without.get(Level::Host, "h1").unwrap().avail, Capacity::new(8, 8192, 100));
        assert!(without.get(Level::Rack, "r1").unwrap().memberships.is_empty());
        assert_eq!(without.get(Level::Host, "h1").unwrap().num_vms, 0);
        assert!(!without.group_types().contains_key("s1:g"));
    }

    #[test]
    fn commit_cascades_and_tags_level() {
        let topo = two_rack_topology();
        let mut avail = AvailResources::build(&topo, None);
        let tag = MembershipTag {
            name: "s1:d".to_string(),
            group_type: GroupType::Div,
            level: Level::Rack,
        };
        avail.commit_vm("h3", Capacity::new(2, 2048, 20), &[tag]);
        assert_eq!(avail.get(Level::Host, "h3").unwrap().avail, Capacity::new(6, 6144, 80));
        assert_eq!(avail.get(Level::Rack, "r2").unwrap().avail, Capacity::new(14, 14336, 180));
        assert_eq!(avail.dc_avail(), Capacity::new(30, 30720, 380));
        assert!(avail.get(Level::Rack, "r2").unwrap().memberships.contains("s1:d"));
        assert!(!avail.get(Level::Host, "h3").unwrap().memberships.contains("s1:d"));
        assert_eq!(avail.get(Level::Cluster, "c1").unwrap().num_vms, 1);
        assert_eq!(avail.group_types().get("s1:d"), Some(&GroupType::Div));
    }

    #[test]
    fn max_avail_looks_at_the_finest_level() {
        let mut topo = two_rack_topology();
        topo.add_vm_to_host("h1", VmRef::new("s0", "x"), Capacity::new(6, 1024, 10), Vec::new())
            .unwrap();
        let avail = AvailResources::build(&topo, None);
        assert_eq!(
            avail.max_avail_under(Level::Rack, "r1", Level::Host, |c| c.vcpus),
            8
        );
        assert!(avail.any_under(Level::Cluster, "c1", Level::Host, |r| r.avail.vcpus == 2));
        assert!(!avail.any_under(Level::Rack, "r2", Level::Host, |r| r.avail.vcpus == 2));
        assert!(avail.any_under(Level::Host, "h4", Level::Rack, |r| r.name == "r2"));
    }
}
