//! ConstraintMerger: builds the VM/VGroup tree from a flat request.
//!
//! Merging runs in a fixed order: diversity groups tag their members,
//! exclusivity groups do the same, and only then are affinity groups merged,
//! with any diversity or exclusivity group referenced from an affinity group
//! flattened into its member list. Diversity and exclusivity groups are then
//! discarded; affinity groups and bare VMs remain as search units.
//!
//! Parent links during the affinity merge live in an explicit affinity map
//! (orch_id → parent orch_id). Claiming a node that already belongs to
//! another affinity tree re-parents the claimed node's topmost ancestor
//! instead ("implicit grouping").

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use valet_state::{Capacity, GroupSpec, OrchId, Placement, StackResource};

use crate::app::{AppTopology, NodeId, VGroup, Vm};
use crate::error::{PlacementError, PlacementResult};
use crate::resource::{GroupType, Level};
use crate::topology::ResourceTopology;

/// Parse a request's resource and group maps against the flavor catalog.
///
/// Nothing outside the returned tree is touched, so a rejected request
/// leaves no trace.
pub fn parse(
    stack_id: &str,
    resources: &BTreeMap<OrchId, StackResource>,
    groups: &BTreeMap<OrchId, GroupSpec>,
    topology: &ResourceTopology,
) -> PlacementResult<AppTopology> {
    let mut merger = ConstraintMerger::new(stack_id);
    merger.build_vms(resources, topology)?;
    merger.build_vgroups(groups)?;
    merger.check_cycles()?;
    merger.merge_tagging_groups(GroupType::Div)?;
    merger.merge_tagging_groups(GroupType::Ex)?;
    merger.merge_affinity()?;
    let app = merger.finish()?;
    debug!(
        %stack_id,
        vms = app.vms.len(),
        affinity_groups = app.vgroups.len(),
        "request parsed"
    );
    Ok(app)
}

struct ConstraintMerger {
    app: AppTopology,
    /// Validated, de-duplicated member list of every declared group.
    members: BTreeMap<OrchId, Vec<NodeId>>,
    /// Affinity parent of every claimed node.
    affinity_map: BTreeMap<OrchId, OrchId>,
    processed: BTreeSet<OrchId>,
}

impl ConstraintMerger {
    fn new(stack_id: &str) -> Self {
        Self {
            app: AppTopology {
                stack_id: stack_id.to_string(),
                ..Default::default()
            },
            members: BTreeMap::new(),
            affinity_map: BTreeMap::new(),
            processed: BTreeSet::new(),
        }
    }

    // ── Step 1: nodes ──────────────────────────────────────────────

    fn build_vms(
        &mut self,
        resources: &BTreeMap<OrchId, StackResource>,
        topology: &ResourceTopology,
    ) -> PlacementResult<()> {
        for (orch_id, resource) in resources.iter().filter(|(_, r)| r.is_server()) {
            let props = &resource.properties;
            let flavor = topology
                .flavor(&props.flavor)
                .ok_or_else(|| PlacementError::UnknownFlavor(props.flavor.clone()))?;

            // "zone:host" forces the host, as Nova allows.
            let (availability_zone, pinned_host) = match props.availability_zone.as_deref() {
                Some(az) => match az.split_once(':') {
                    Some((zone, host)) => (
                        (!zone.is_empty()).then(|| zone.to_string()),
                        (!host.is_empty()).then(|| host.to_string()),
                    ),
                    None => (Some(az.to_string()), None),
                },
                None => (None, None),
            };

            let name = if resource.name.is_empty() {
                orch_id.clone()
            } else {
                resource.name.clone()
            };
            self.app.vms.insert(
                orch_id.clone(),
                Vm {
                    orch_id: orch_id.clone(),
                    name,
                    uuid: props.uuid.clone(),
                    flavor: flavor.name.clone(),
                    image: props.image.clone(),
                    demand: flavor.demand(),
                    availability_zone,
                    extra_specs: flavor.extra_specs.clone(),
                    diversity_groups: BTreeMap::new(),
                    exclusivity_groups: BTreeMap::new(),
                    survgroup: None,
                    host: None,
                    pinned_host,
                    excluded_hosts: BTreeSet::new(),
                    weight: 0.0,
                },
            );
        }
        if self.app.vms.is_empty() {
            return Err(PlacementError::EmptyRequest);
        }
        Ok(())
    }

    fn build_vgroups(&mut self, groups: &BTreeMap<OrchId, GroupSpec>) -> PlacementResult<()> {
        for (orch_id, spec) in groups {
            if self.app.vms.contains_key(orch_id) {
                return Err(PlacementError::DanglingReference(orch_id.clone()));
            }
            let vgroup_type = GroupType::from_request(&spec.group_type)?;
            let level: Level = spec
                .level
                .as_deref()
                .ok_or_else(|| PlacementError::MissingField {
                    orch_id: orch_id.clone(),
                    field: "level",
                })?
                .parse()?;
            if vgroup_type == GroupType::Ex && spec.name.is_none() {
                return Err(PlacementError::MissingField {
                    orch_id: orch_id.clone(),
                    field: "name",
                });
            }
            if spec.members.is_empty() {
                return Err(PlacementError::MissingField {
                    orch_id: orch_id.clone(),
                    field: "members",
                });
            }

            let name = spec
                .name
                .clone()
                .unwrap_or_else(|| Placement::planned_key(&self.app.stack_id, orch_id));
            self.app.vgroups.insert(
                orch_id.clone(),
                VGroup {
                    orch_id: orch_id.clone(),
                    name,
                    vgroup_type,
                    level,
                    named: spec.name.is_some(),
                    subvgroups: BTreeMap::new(),
                    survgroup: None,
                    demand: Capacity::ZERO,
                    diversity_groups: BTreeMap::new(),
                    exclusivity_groups: BTreeMap::new(),
                    availability_zones: BTreeSet::new(),
                    extra_specs_list: Vec::new(),
                    host: None,
                    weight: 0.0,
                },
            );
        }

        for (orch_id, spec) in groups {
            let mut resolved = Vec::with_capacity(spec.members.len());
            for member in &spec.members {
                let node = if self.app.vms.contains_key(member) {
                    NodeId::Vm(member.clone())
                } else if self.app.vgroups.contains_key(member) {
                    if member == orch_id {
                        return Err(PlacementError::CyclicGroup(orch_id.clone()));
                    }
                    NodeId::Group(member.clone())
                } else {
                    return Err(PlacementError::DanglingReference(member.clone()));
                };
                if !resolved.contains(&node) {
                    resolved.push(node);
                }
            }
            self.members.insert(orch_id.clone(), resolved);
        }
        Ok(())
    }

    /// Reject group declarations that (transitively) contain themselves.
    fn check_cycles(&self) -> PlacementResult<()> {
        fn visit(
            id: &str,
            members: &BTreeMap<OrchId, Vec<NodeId>>,
            done: &mut BTreeSet<OrchId>,
            stack: &mut Vec<OrchId>,
        ) -> PlacementResult<()> {
            if done.contains(id) {
                return Ok(());
            }
            if stack.iter().any(|s| s == id) {
                return Err(PlacementError::CyclicGroup(id.to_string()));
            }
            stack.push(id.to_string());
            for member in members.get(id).into_iter().flatten() {
                if let NodeId::Group(child) = member {
                    visit(child, members, done, stack)?;
                }
            }
            stack.pop();
            done.insert(id.to_string());
            Ok(())
        }

        let mut done = BTreeSet::new();
        for id in self.members.keys() {
            visit(id, &self.members, &mut done, &mut Vec::new())?;
        }
        Ok(())
    }

    /// Declared groups of one type, finest level first.
    fn groups_of(&self, group_type: GroupType) -> Vec<OrchId> {
        let mut ids: Vec<(Level, OrchId)> = self
            .app
            .vgroups
            .values()
            .filter(|g| g.vgroup_type == group_type)
            .map(|g| (g.level, g.orch_id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    // ── Steps 2 and 3: diversity and exclusivity ───────────────────

    /// Attach members to a DIV or EX group and tag them with it.
    fn merge_tagging_groups(&mut self, group_type: GroupType) -> PlacementResult<()> {
        let outer = match group_type {
            GroupType::Div => "diversity",
            _ => "exclusivity",
        };
        for group_id in self.groups_of(group_type) {
            let (tag, level) = {
                let group = &self.app.vgroups[&group_id];
                (group.tag(), group.level)
            };
            let members = self.members.get(&group_id).cloned().unwrap_or_default();
            for member in &members {
                if let NodeId::Group(inner_id) = member {
                    let inner = &self.app.vgroups[inner_id];
                    if matches!(inner.vgroup_type, GroupType::Div | GroupType::Ex) {
                        return Err(PlacementError::NestedGroup {
                            inner: inner.vgroup_type,
                            outer,
                        });
                    }
                    if inner.level > level {
                        return Err(PlacementError::GroupingScope);
                    }
                }

                let tags = match member {
                    NodeId::Vm(id) => self.app.vms.get_mut(id).map(|vm| match group_type {
                        GroupType::Div => &mut vm.diversity_groups,
                        _ => &mut vm.exclusivity_groups,
                    }),
                    NodeId::Group(id) => self.app.vgroups.get_mut(id).map(|g| match group_type {
                        GroupType::Div => &mut g.diversity_groups,
                        _ => &mut g.exclusivity_groups,
                    }),
                };
                if let Some(tags) = tags {
                    tags.insert(group_id.clone(), tag.clone());
                }
                if let Some(group) = self.app.vgroups.get_mut(&group_id) {
                    group
                        .subvgroups
                        .insert(member.orch_id().to_string(), member.clone());
                }
            }
        }
        Ok(())
    }

    // ── Step 4: affinity ───────────────────────────────────────────

    fn merge_affinity(&mut self) -> PlacementResult<()> {
        for group_id in self.groups_of(GroupType::Aff) {
            self.merge_affinity_group(&group_id)?;
        }
        Ok(())
    }

    fn merge_affinity_group(&mut self, group_id: &str) -> PlacementResult<()> {
        if !self.processed.insert(group_id.to_string()) {
            return Ok(());
        }
        let level = self.app.vgroups[group_id].level;

        // DIV/EX members are flattened into their own member lists.
        let mut concrete = Vec::new();
        for member in self.members.get(group_id).cloned().unwrap_or_default() {
            let tagging = match &member {
                NodeId::Group(id) => self.app.vgroups[id].vgroup_type != GroupType::Aff,
                NodeId::Vm(_) => false,
            };
            if !tagging {
                concrete.push(member);
                continue;
            }
            let id = member.orch_id();
            if self.app.vgroups[id].level > level {
                return Err(PlacementError::GroupingScope);
            }
            concrete.extend(self.members.get(id).cloned().unwrap_or_default());
        }

        for node in concrete {
            if let NodeId::Group(id) = &node {
                if self.app.vgroups[id].level > level {
                    return Err(PlacementError::GroupingScope);
                }
                self.merge_affinity_group(id)?;
            }
            self.claim(group_id, node.orch_id());
        }
        Ok(())
    }

    /// Chain of affinity parents above a node, innermost first.
    fn parent_chain(&self, orch_id: &str) -> Vec<OrchId> {
        let mut chain = Vec::new();
        let mut current = self.affinity_map.get(orch_id);
        while let Some(parent) = current {
            chain.push(parent.clone());
            current = self.affinity_map.get(parent);
        }
        chain
    }

    /// Make `node` part of `group_id`'s affinity tree.
    fn claim(&mut self, group_id: &str, node: &str) {
        let node_chain = self.parent_chain(node);
        if node_chain.is_empty() {
            self.affinity_map.insert(node.to_string(), group_id.to_string());
            return;
        }
        if node_chain.iter().any(|p| p == group_id) {
            return;
        }

        // Re-parent the highest ancestor of `node` that is not shared with
        // `group_id`'s own chain.
        let mut group_chain: BTreeSet<OrchId> = self.parent_chain(group_id).into_iter().collect();
        group_chain.insert(group_id.to_string());
        let moved = match node_chain.iter().position(|p| group_chain.contains(p)) {
            Some(0) => node.to_string(),
            Some(i) => node_chain[i - 1].clone(),
            None => node_chain[node_chain.len() - 1].clone(),
        };

        let level = self.app.vgroups[group_id].level;
        self.affinity_map.insert(moved.clone(), group_id.to_string());
        self.lower_level(&moved, level);
        debug!(group = %group_id, %node, %moved, "implicit affinity grouping");
    }

    /// Narrow a group (and its affinity subtree) to at most `level`.
    fn lower_level(&mut self, orch_id: &str, level: Level) {
        let Some(group) = self.app.vgroups.get_mut(orch_id) else {
            return;
        };
        if group.level <= level {
            return;
        }
        group.level = level;
        let children: Vec<OrchId> = self
            .affinity_map
            .iter()
            .filter(|(_, parent)| parent.as_str() == orch_id)
            .map(|(child, _)| child.clone())
            .collect();
        for child in children {
            self.lower_level(&child, level);
        }
    }

    // ── Step 5: finish ─────────────────────────────────────────────

    fn finish(mut self) -> PlacementResult<AppTopology> {
        self.app
            .vgroups
            .retain(|_, g| g.vgroup_type == GroupType::Aff);
        for group in self.app.vgroups.values_mut() {
            group.subvgroups.clear();
        }

        for (child, parent) in &self.affinity_map {
            let node = if self.app.vms.contains_key(child) {
                NodeId::Vm(child.clone())
            } else {
                NodeId::Group(child.clone())
            };
            if let Some(vm) = self.app.vms.get_mut(child) {
                vm.survgroup = Some(parent.clone());
            } else if let Some(group) = self.app.vgroups.get_mut(child) {
                group.survgroup = Some(parent.clone());
            }
            if let Some(group) = self.app.vgroups.get_mut(parent) {
                group.subvgroups.insert(child.clone(), node);
            }
        }

        let roots: Vec<OrchId> = self
            .app
            .vgroups
            .values()
            .filter(|g| g.survgroup.is_none())
            .map(|g| g.orch_id.clone())
            .collect();
        for root in roots {
            self.accumulate(&root)?;
        }
        Ok(self.app)
    }

    /// Sum demand and lift AZ, extra-spec and DIV/EX requirements from
    /// children into their affinity group, bottom-up.
    fn accumulate(&mut self, group_id: &str) -> PlacementResult<()> {
        let children: Vec<NodeId> = self.app.vgroups[group_id]
            .subvgroups
            .values()
            .cloned()
            .collect();
        for child in &children {
            if let NodeId::Group(id) = child {
                self.accumulate(id)?;
            }
        }

        let group = &self.app.vgroups[group_id];
        let level = group.level;
        let mut diversity = group.diversity_groups.clone();
        let mut exclusivity = group.exclusivity_groups.clone();
        let mut seen: BTreeSet<OrchId> = diversity.keys().cloned().collect();
        let mut demand = Capacity::ZERO;
        let mut zones = BTreeSet::new();
        let mut specs = Vec::new();

        for child in &children {
            let Some(node) = self.app.node(child) else {
                continue;
            };
            demand += node.demand();
            zones.extend(node.availability_zones().into_iter().map(String::from));
            specs.extend(node.extra_specs_list().into_iter().cloned());

            // Members co-located at this level share every coarser resource.
            for (id, tag) in node.diversity_groups() {
                if tag.level < level {
                    continue;
                }
                if !seen.insert(id.clone()) {
                    return Err(PlacementError::ConflictingGroups {
                        affinity: group.name.clone(),
                        diversity: tag.name.clone(),
                    });
                }
                diversity.insert(id.clone(), tag.clone());
            }
            for (id, tag) in node.exclusivity_groups() {
                if tag.level >= level {
                    exclusivity.insert(id.clone(), tag.clone());
                }
            }
        }

        if let Some(group) = self.app.vgroups.get_mut(group_id) {
            group.demand = demand;
            group.availability_zones = zones;
            group.extra_specs_list = specs;
            group.diversity_groups = diversity;
            group.exclusivity_groups = exclusivity;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::topology::tests::two_rack_topology;

    pub(crate) fn servers(specs: &[(&str, &str)]) -> BTreeMap<OrchId, StackResource> {
        specs
            .iter()
            .map(|(id, flavor)| (id.to_string(), StackResource::server(id, flavor)))
            .collect()
    }

    pub(crate) fn group(
        group_type: &str,
        level: &str,
        name: Option<&str>,
        members: &[&str],
    ) -> GroupSpec {
        GroupSpec {
            group_type: group_type.to_string(),
            level: Some(level.to_string()),
            name: name.map(String::from),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn groups(specs: Vec<(&str, GroupSpec)>) -> BTreeMap<OrchId, GroupSpec> {
        specs.into_iter().map(|(id, g)| (id.to_string(), g)).collect()
    }

    fn parse_with(
        resources: &[(&str, &str)],
        group_specs: Vec<(&str, GroupSpec)>,
    ) -> PlacementResult<AppTopology> {
        parse(
            "s1",
            &servers(resources),
            &groups(group_specs),
            &two_rack_topology(),
        )
    }

    #[test]
    fn bare_vms_become_roots() {
        let app = parse_with(&[("a", "small"), ("b", "large")], vec![]).unwrap();
        assert_eq!(app.roots().len(), 2);
        assert_eq!(app.vms["b"].demand, Capacity::new(4, 4096, 40));
        assert!(app.vgroups.is_empty());
    }

    #[test]
    fn non_server_resources_are_ignored() {
        let mut resources = servers(&[("a", "small")]);
        resources.insert(
            "vol".to_string(),
            StackResource {
                kind: "OS::Cinder::Volume".to_string(),
                name: "vol".to_string(),
                properties: Default::default(),
            },
        );
        let app = parse("s1", &resources, &BTreeMap::new(), &two_rack_topology()).unwrap();
        assert_eq!(app.vms.len(), 1);
    }

    #[test]
    fn rejects_unknown_flavor() {
        let err = parse_with(&[("a", "huge")], vec![]).unwrap_err();
        assert_eq!(err, PlacementError::UnknownFlavor("huge".into()));
    }

    #[test]
    fn rejects_request_without_servers() {
        let err = parse("s1", &BTreeMap::new(), &BTreeMap::new(), &two_rack_topology()).unwrap_err();
        assert_eq!(err, PlacementError::EmptyRequest);
    }

    #[test]
    fn rejects_malformed_groups() {
        let err = parse_with(
            &[("a", "small")],
            vec![("g", group("colocate", "host", None, &["a"]))],
        )
        .unwrap_err();
        assert_eq!(err, PlacementError::UnknownGroupType("colocate".into()));

        let mut no_level = group("affinity", "host", None, &["a"]);
        no_level.level = None;
        let err = parse_with(&[("a", "small")], vec![("g", no_level)]).unwrap_err();
        assert!(matches!(err, PlacementError::MissingField { field: "level", .. }));

        let err = parse_with(
            &[("a", "small")],
            vec![("g", group("exclusivity", "host", None, &["a"]))],
        )
        .unwrap_err();
        assert!(matches!(err, PlacementError::MissingField { field: "name", .. }));
    }

    #[test]
    fn rejects_dangling_reference() {
        let err = parse_with(
            &[("a", "small")],
            vec![("g", group("affinity", "host", None, &["a", "ghost"]))],
        )
        .unwrap_err();
        assert_eq!(err.status(), "invalid resource = ghost");
    }

    #[test]
    fn rejects_nested_tagging_groups() {
        let err = parse_with(
            &[("a", "small"), ("b", "small")],
            vec![
                ("d1", group("diversity", "rack", None, &["d2", "b"])),
                ("d2", group("diversity", "host", None, &["a", "b"])),
            ],
        )
        .unwrap_err();
        assert_eq!(err.status(), "DIV not allowed to be nested in diversity group");
    }

    #[test]
    fn rejects_nested_group_at_higher_level() {
        let err = parse_with(
            &[("a", "small"), ("b", "small"), ("c", "small")],
            vec![
                ("g", group("affinity", "rack", None, &["a", "b"])),
                ("d", group("diversity", "host", None, &["g", "c"])),
            ],
        )
        .unwrap_err();
        assert_eq!(err, PlacementError::GroupingScope);

        let err = parse_with(
            &[("a", "small"), ("b", "small")],
            vec![
                ("inner", group("affinity", "cluster", None, &["a", "b"])),
                ("outer", group("affinity", "host", None, &["inner"])),
            ],
        )
        .unwrap_err();
        assert_eq!(err.status(), "grouping scope: nested group's level is higher");
    }

    #[test]
    fn rejects_cycles() {
        let err = parse_with(
            &[("a", "small")],
            vec![
                ("g1", group("affinity", "host", None, &["a", "g2"])),
                ("g2", group("affinity", "host", None, &["g1"])),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PlacementError::CyclicGroup(_)));
    }

    #[test]
    fn affinity_group_collects_members() {
        let app = parse_with(
            &[("a", "small"), ("b", "medium"), ("c", "small")],
            vec![("g", group("affinity", "host", None, &["a", "b"]))],
        )
        .unwrap();

        let g = &app.vgroups["g"];
        assert_eq!(g.subvgroups.len(), 2);
        assert_eq!(g.demand, Capacity::new(3, 3072, 30));
        assert_eq!(g.name, "s1:g");
        assert!(!g.named);
        assert_eq!(app.vms["a"].survgroup.as_deref(), Some("g"));
        assert_eq!(
            app.roots(),
            vec![NodeId::Group("g".into()), NodeId::Vm("c".into())]
        );
    }

    #[test]
    fn implicit_grouping_reparents_top_ancestor() {
        let app = parse_with(
            &[("a", "small"), ("b", "small"), ("c", "small")],
            vec![
                ("h", group("affinity", "host", None, &["b", "c"])),
                ("r", group("affinity", "rack", None, &["a", "b"])),
            ],
        )
        .unwrap();

        // b already belongs to h, so h itself moves under r.
        assert_eq!(app.vgroups["h"].survgroup.as_deref(), Some("r"));
        assert_eq!(app.vms["b"].survgroup.as_deref(), Some("h"));
        assert_eq!(app.vms["a"].survgroup.as_deref(), Some("r"));
        assert_eq!(app.roots(), vec![NodeId::Group("r".into())]);
        assert_eq!(app.vgroups["r"].demand, Capacity::new(3, 3072, 30));
    }

    #[test]
    fn implicit_grouping_chains_through_shared_members() {
        let app = parse_with(
            &[("a", "small"), ("b", "small"), ("c", "small")],
            vec![
                ("r1", group("affinity", "rack", None, &["a", "b"])),
                ("r2", group("affinity", "rack", None, &["b", "c"])),
                ("h", group("affinity", "host", None, &["a", "c"])),
            ],
        )
        .unwrap();

        // h merges first; r1 then r2 pull it in and end up nested.
        assert_eq!(app.roots().len(), 1);
        let leaves = app.leaves(&app.roots()[0]);
        assert_eq!(leaves.len(), 3);
    }

    #[test]
    fn diversity_inside_affinity_is_flattened() {
        let app = parse_with(
            &[("a", "small"), ("b", "small")],
            vec![
                ("aff", group("affinity", "rack", None, &["div"])),
                ("div", group("diversity", "host", None, &["a", "b"])),
            ],
        )
        .unwrap();

        assert!(!app.vgroups.contains_key("div"));
        let aff = &app.vgroups["aff"];
        assert_eq!(aff.subvgroups.len(), 2);
        assert!(aff.diversity_groups.is_empty());
        assert_eq!(app.vms["a"].diversity_groups["div"].level, Level::Host);
        assert_eq!(app.vms["b"].survgroup.as_deref(), Some("aff"));
    }

    #[test]
    fn diversity_tags_accumulate_into_affinity_group() {
        let app = parse_with(
            &[("a", "small"), ("b", "small"), ("c", "small")],
            vec![
                ("d", group("diversity", "rack", None, &["a", "c"])),
                ("g", group("affinity", "host", None, &["a", "b"])),
            ],
        )
        .unwrap();

        let g = &app.vgroups["g"];
        assert_eq!(g.diversity_groups["d"].name, "s1:d");
        assert_eq!(app.vms["c"].diversity_groups["d"].level, Level::Rack);
        assert!(app.vms["b"].diversity_groups.is_empty());
    }

    #[test]
    fn affinity_over_diverse_members_conflicts() {
        let err = parse_with(
            &[("a", "small"), ("b", "small")],
            vec![
                ("d", group("diversity", "rack", None, &["a", "b"])),
                ("g", group("affinity", "host", None, &["a", "b"])),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PlacementError::ConflictingGroups { .. }));
    }

    #[test]
    fn exclusivity_tags_named_group() {
        let app = parse_with(
            &[("a", "small")],
            vec![("x", group("exclusivity", "host", Some("gold"), &["a"]))],
        )
        .unwrap();
        let tag = &app.vms["a"].exclusivity_groups["x"];
        assert_eq!(tag.name, "gold");
        assert!(tag.named);
        assert!(app.vgroups.is_empty());
    }

    #[test]
    fn availability_zone_with_host_pins() {
        let mut resources = servers(&[("a", "small")]);
        resources
            .get_mut("a")
            .unwrap()
            .properties
            .availability_zone = Some("az1:h3".to_string());
        let app = parse("s1", &resources, &BTreeMap::new(), &two_rack_topology()).unwrap();
        assert_eq!(app.vms["a"].availability_zone.as_deref(), Some("az1"));
        assert_eq!(app.vms["a"].pinned_host.as_deref(), Some("h3"));
    }
}
