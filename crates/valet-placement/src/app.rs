//! Application topology: the VM/VGroup tree built from one request.
//!
//! Nodes live in two arenas keyed by orch_id. A node's parent is an orch_id
//! (`survgroup`), a group's children are [`NodeId`]s, so re-parenting is a
//! key reassignment.

use std::collections::{BTreeMap, BTreeSet};

use valet_state::{Capacity, OrchId, StackId};

use crate::resource::{GroupType, Level, MembershipTag};

/// Reference to a node of either kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    Vm(OrchId),
    Group(OrchId),
}

impl NodeId {
    pub fn orch_id(&self) -> &str {
        match self {
            NodeId::Vm(id) | NodeId::Group(id) => id,
        }
    }
}

/// A diversity or exclusivity group a node takes part in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTag {
    pub name: String,
    pub level: Level,
    /// Declared with an explicit name, so visible across stacks.
    pub named: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vm {
    pub orch_id: OrchId,
    pub name: String,
    pub uuid: Option<String>,
    pub flavor: String,
    pub image: Option<String>,
    pub demand: Capacity,
    pub availability_zone: Option<String>,
    pub extra_specs: BTreeMap<String, String>,
    /// DIV group orch_id → tag.
    pub diversity_groups: BTreeMap<OrchId, GroupTag>,
    /// EX group orch_id → tag.
    pub exclusivity_groups: BTreeMap<OrchId, GroupTag>,
    /// Enclosing affinity group.
    pub survgroup: Option<OrchId>,
    pub host: Option<String>,
    /// Search may only pick this host.
    pub pinned_host: Option<String>,
    /// Search must not pick these hosts.
    pub excluded_hosts: BTreeSet<String>,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VGroup {
    pub orch_id: OrchId,
    pub name: String,
    pub vgroup_type: GroupType,
    pub level: Level,
    pub named: bool,
    pub subvgroups: BTreeMap<OrchId, NodeId>,
    pub survgroup: Option<OrchId>,
    /// Sum over all descendant VMs.
    pub demand: Capacity,
    pub diversity_groups: BTreeMap<OrchId, GroupTag>,
    pub exclusivity_groups: BTreeMap<OrchId, GroupTag>,
    pub availability_zones: BTreeSet<String>,
    pub extra_specs_list: Vec<BTreeMap<String, String>>,
    /// Resource name at `level` once placed.
    pub host: Option<String>,
    pub weight: f64,
}

impl VGroup {
    pub fn tag(&self) -> GroupTag {
        GroupTag {
            name: self.name.clone(),
            level: self.level,
            named: self.named,
        }
    }
}

/// Borrowed view of a node, matched exhaustively by filters and search.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Vm(&'a Vm),
    Group(&'a VGroup),
}

impl<'a> NodeRef<'a> {
    pub fn orch_id(&self) -> &'a str {
        match *self {
            NodeRef::Vm(vm) => &vm.orch_id,
            NodeRef::Group(g) => &g.orch_id,
        }
    }

    pub fn id(&self) -> NodeId {
        match *self {
            NodeRef::Vm(vm) => NodeId::Vm(vm.orch_id.clone()),
            NodeRef::Group(g) => NodeId::Group(g.orch_id.clone()),
        }
    }

    /// Level the node is placed at; a VM always lands on a host.
    pub fn level(&self) -> Level {
        match *self {
            NodeRef::Vm(_) => Level::Host,
            NodeRef::Group(g) => g.level,
        }
    }

    pub fn demand(&self) -> Capacity {
        match *self {
            NodeRef::Vm(vm) => vm.demand,
            NodeRef::Group(g) => g.demand,
        }
    }

    pub fn weight(&self) -> f64 {
        match *self {
            NodeRef::Vm(vm) => vm.weight,
            NodeRef::Group(g) => g.weight,
        }
    }

    pub fn diversity_groups(&self) -> &'a BTreeMap<OrchId, GroupTag> {
        match *self {
            NodeRef::Vm(vm) => &vm.diversity_groups,
            NodeRef::Group(g) => &g.diversity_groups,
        }
    }

    pub fn exclusivity_groups(&self) -> &'a BTreeMap<OrchId, GroupTag> {
        match *self {
            NodeRef::Vm(vm) => &vm.exclusivity_groups,
            NodeRef::Group(g) => &g.exclusivity_groups,
        }
    }

    pub fn availability_zones(&self) -> BTreeSet<&'a str> {
        match *self {
            NodeRef::Vm(vm) => vm.availability_zone.iter().map(String::as_str).collect(),
            NodeRef::Group(g) => g.availability_zones.iter().map(String::as_str).collect(),
        }
    }

    pub fn extra_specs_list(&self) -> Vec<&'a BTreeMap<String, String>> {
        match *self {
            NodeRef::Vm(vm) if vm.extra_specs.is_empty() => Vec::new(),
            NodeRef::Vm(vm) => vec![&vm.extra_specs],
            NodeRef::Group(g) => g.extra_specs_list.iter().collect(),
        }
    }

    /// The named affinity group this node is, if any.
    pub fn named_affinity(&self) -> Option<&'a str> {
        match *self {
            NodeRef::Group(g) if g.named && g.vgroup_type == GroupType::Aff => Some(&g.name),
            _ => None,
        }
    }
}

/// The VM/VGroup tree of one stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppTopology {
    pub stack_id: StackId,
    pub vms: BTreeMap<OrchId, Vm>,
    pub vgroups: BTreeMap<OrchId, VGroup>,
}

impl AppTopology {
    pub fn node(&self, id: &NodeId) -> Option<NodeRef<'_>> {
        match id {
            NodeId::Vm(orch_id) => self.vms.get(orch_id).map(NodeRef::Vm),
            NodeId::Group(orch_id) => self.vgroups.get(orch_id).map(NodeRef::Group),
        }
    }

    /// Nodes with no enclosing group: the top-level search units.
    pub fn roots(&self) -> Vec<NodeId> {
        let groups = self
            .vgroups
            .values()
            .filter(|g| g.survgroup.is_none())
            .map(|g| NodeId::Group(g.orch_id.clone()));
        let vms = self
            .vms
            .values()
            .filter(|vm| vm.survgroup.is_none())
            .map(|vm| NodeId::Vm(vm.orch_id.clone()));
        groups.chain(vms).collect()
    }

    /// Children of a node, empty for a VM.
    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        match id {
            NodeId::Vm(_) => Vec::new(),
            NodeId::Group(orch_id) => self
                .vgroups
                .get(orch_id)
                .map(|g| g.subvgroups.values().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// All VMs under a node (the node itself for a VM).
    pub fn leaves(&self, id: &NodeId) -> Vec<&Vm> {
        match id {
            NodeId::Vm(orch_id) => self.vms.get(orch_id).into_iter().collect(),
            NodeId::Group(_) => self
                .children(id)
                .iter()
                .flat_map(|child| self.leaves(child))
                .collect(),
        }
    }

    /// Enclosing groups of a node, innermost first.
    pub fn ancestors(&self, id: &NodeId) -> Vec<&VGroup> {
        let mut parent = match self.node(id) {
            Some(NodeRef::Vm(vm)) => vm.survgroup.clone(),
            Some(NodeRef::Group(g)) => g.survgroup.clone(),
            None => None,
        };
        let mut chain = Vec::new();
        while let Some(orch_id) = parent {
            let Some(group) = self.vgroups.get(&orch_id) else {
                break;
            };
            parent = group.survgroup.clone();
            chain.push(group);
        }
        chain
    }

    pub fn total_demand(&self) -> Capacity {
        self.vms.values().map(|vm| vm.demand).sum()
    }

    /// Memberships a VM records on the resources it lands on: its own and
    /// its ancestors' DIV/EX tags, and its ancestors' AFF groups.
    pub fn membership_tags(&self, orch_id: &str) -> Vec<MembershipTag> {
        let Some(vm) = self.vms.get(orch_id) else {
            return Vec::new();
        };
        let ancestors = self.ancestors(&NodeId::Vm(orch_id.to_string()));
        let mut tags = BTreeSet::new();
        let node_tags = std::iter::once((&vm.diversity_groups, &vm.exclusivity_groups)).chain(
            ancestors
                .iter()
                .map(|g| (&g.diversity_groups, &g.exclusivity_groups)),
        );
        for (div, ex) in node_tags {
            for tag in div.values() {
                tags.insert(MembershipTag {
                    name: tag.name.clone(),
                    group_type: GroupType::Div,
                    level: tag.level,
                });
            }
            for tag in ex.values() {
                tags.insert(MembershipTag {
                    name: tag.name.clone(),
                    group_type: GroupType::Ex,
                    level: tag.level,
                });
            }
        }
        for group in ancestors {
            tags.insert(MembershipTag {
                name: group.name.clone(),
                group_type: group.vgroup_type,
                level: group.level,
            });
        }
        tags.into_iter().collect()
    }

    /// Host decided for every VM, once search has run.
    pub fn decisions(&self) -> BTreeMap<OrchId, String> {
        self.vms
            .values()
            .filter_map(|vm| vm.host.clone().map(|h| (vm.orch_id.clone(), h)))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn vm(orch_id: &str, demand: Capacity) -> Vm {
        Vm {
            orch_id: orch_id.to_string(),
            name: orch_id.to_string(),
            uuid: None,
            flavor: "small".to_string(),
            image: None,
            demand,
            availability_zone: None,
            extra_specs: BTreeMap::new(),
            diversity_groups: BTreeMap::new(),
            exclusivity_groups: BTreeMap::new(),
            survgroup: None,
            host: None,
            pinned_host: None,
            excluded_hosts: BTreeSet::new(),
            weight: 0.0,
        }
    }

    fn sample_app() -> AppTopology {
        let mut app = AppTopology {
            stack_id: "s1".to_string(),
            ..Default::default()
        };
        let mut a = vm("a", Capacity::new(1, 1024, 10));
        a.survgroup = Some("g".to_string());
        a.diversity_groups.insert(
            "d".to_string(),
            GroupTag {
                name: "s1:d".to_string(),
                level: Level::Rack,
                named: false,
            },
        );
        let b = vm("b", Capacity::new(2, 2048, 20));
        app.vms.insert("a".to_string(), a);
        app.vms.insert("b".to_string(), b);
        let mut subvgroups = BTreeMap::new();
        subvgroups.insert("a".to_string(), NodeId::Vm("a".to_string()));
        app.vgroups.insert(
            "g".to_string(),
            VGroup {
                orch_id: "g".to_string(),
                name: "s1:g".to_string(),
                vgroup_type: GroupType::Aff,
                level: Level::Host,
                named: false,
                subvgroups,
                survgroup: None,
                demand: Capacity::new(1, 1024, 10),
                diversity_groups: BTreeMap::new(),
                exclusivity_groups: BTreeMap::new(),
                availability_zones: BTreeSet::new(),
                extra_specs_list: Vec::new(),
                host: None,
                weight: 0.0,
            },
        );
        app
    }

    #[test]
    fn roots_and_leaves() {
        let app = sample_app();
        let roots = app.roots();
        assert_eq!(
            roots,
            vec![NodeId::Group("g".into()), NodeId::Vm("b".into())]
        );
        let leaves = app.leaves(&NodeId::Group("g".into()));
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].orch_id, "a");
        assert_eq!(app.total_demand(), Capacity::new(3, 3072, 30));
    }

    #[test]
    fn membership_tags_include_ancestor_affinity() {
        let app = sample_app();
        let tags = app.membership_tags("a");
        assert_eq!(tags.len(), 2);
        assert!(tags.iter().any(|t| t.name == "s1:g" && t.group_type == GroupType::Aff));
        assert!(
            tags.iter()
                .any(|t| t.name == "s1:d" && t.group_type == GroupType::Div && t.level == Level::Rack)
        );
        assert!(app.membership_tags("b").is_empty());
    }
}
