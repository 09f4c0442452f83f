//! Greedy coarse-to-fine placement search.
//!
//! Top-level nodes are placed heaviest first. Each node walks the levels
//! from its scope down to its own level: candidates are the children of the
//! previous choice, the filter pipeline narrows them, and the best-fit
//! survivor is taken. A placed affinity group then places its children
//! inside the chosen resource. There is no backtracking; the first node
//! that cannot be placed fails the whole request.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};
use valet_state::{Capacity, OrchId};

use crate::app::{AppTopology, NodeId, NodeRef};
use crate::avail::{AvailResources, PlacedNodes};
use crate::error::{PlacementError, PlacementResult};
use crate::filters::{FilterContext, FilterPipeline};
use crate::resource::{Level, ResourceKind};
use crate::topology::ResourceTopology;

// ── Priority ──────────────────────────────────────────────────────

/// Demand over availability, capped at 1. Zero availability counts as
/// fully consumed when anything is asked for.
fn ratio(demand: u64, avail: u64) -> f64 {
    if avail == 0 {
        return if demand > 0 { 1.0 } else { 0.0 };
    }
    (demand as f64 / avail as f64).min(1.0)
}

/// How scarce each resource is for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Priority {
    /// Scarcest first; ties keep cpu, mem, disk order.
    pub order: Vec<ResourceKind>,
    /// Normalized weights, indexed like [`ResourceKind::ALL`].
    pub weights: [f64; 3],
}

impl Priority {
    pub fn compute(demand: &Capacity, dc_avail: &Capacity) -> Self {
        let ratios = ResourceKind::ALL.map(|k| ratio(k.of(demand), k.of(dc_avail)));
        let mut order = ResourceKind::ALL.to_vec();
        order.sort_by(|a, b| ratios[*b as usize].total_cmp(&ratios[*a as usize]));

        let sum: f64 = ratios.iter().sum();
        let weights = if sum > 0.0 {
            ratios.map(|r| r / sum)
        } else {
            [1.0 / 3.0; 3]
        };
        Self { order, weights }
    }

    pub fn weight(&self, kind: ResourceKind) -> f64 {
        self.weights[kind as usize]
    }

    /// Weighted share of the datacenter a node asks for.
    pub fn node_weight(&self, demand: &Capacity, dc_avail: &Capacity) -> f64 {
        ResourceKind::ALL
            .iter()
            .map(|&k| self.weight(k) * ratio(k.of(demand), k.of(dc_avail)))
            .sum()
    }
}

/// Heaviest first, then by orch_id.
fn by_weight(app: &AppTopology, mut ids: Vec<NodeId>) -> Vec<NodeId> {
    let weight = |id: &NodeId| app.node(id).map_or(0.0, |n| n.weight());
    ids.sort_by(|a, b| {
        weight(b)
            .total_cmp(&weight(a))
            .then_with(|| a.orch_id().cmp(b.orch_id()))
    });
    ids
}

// ── Search ────────────────────────────────────────────────────────

pub struct LevelSearch<'a> {
    topology: &'a ResourceTopology,
    pipeline: &'a FilterPipeline,
}

impl<'a> LevelSearch<'a> {
    pub fn new(topology: &'a ResourceTopology, pipeline: &'a FilterPipeline) -> Self {
        Self { topology, pipeline }
    }

    /// Decide a host for every VM of `app`.
    ///
    /// VMs of `exclude_stack` (the stack being re-planned) are treated as
    /// gone. On success the decided resource is written onto every node of
    /// `app` and the VM decisions are returned. The topology is not
    /// modified either way.
    pub fn place(
        &self,
        app: &mut AppTopology,
        exclude_stack: Option<&str>,
    ) -> PlacementResult<BTreeMap<OrchId, String>> {
        if app.vms.is_empty() {
            return Err(PlacementError::EmptyRequest);
        }
        let avail = AvailResources::build(self.topology, exclude_stack);
        let dc_avail = avail.dc_avail();
        let priority = Priority::compute(&app.total_demand(), &dc_avail);
        for vm in app.vms.values_mut() {
            vm.weight = priority.node_weight(&vm.demand, &dc_avail);
        }
        for group in app.vgroups.values_mut() {
            group.weight = priority.node_weight(&group.demand, &dc_avail);
        }
        debug!(
            stack = %app.stack_id,
            order = ?priority.order,
            "resource priority computed"
        );

        let placed = {
            let view: &AppTopology = app;
            let mut run = SearchRun {
                app: view,
                avail,
                placed: PlacedNodes::default(),
                priority,
                pipeline: self.pipeline,
            };
            for root in by_weight(view, view.roots()) {
                run.place_node(&root, None).inspect_err(|e| {
                    warn!(
                        stack = %view.stack_id,
                        root = root.orch_id(),
                        error = %e,
                        "placement search failed"
                    );
                })?;
            }
            run.placed
        };

        for (orch_id, _, resource) in placed.iter() {
            if let Some(vm) = app.vms.get_mut(orch_id) {
                vm.host = Some(resource.to_string());
            } else if let Some(group) = app.vgroups.get_mut(orch_id) {
                group.host = Some(resource.to_string());
            }
        }
        Ok(app.decisions())
    }
}

struct SearchRun<'a> {
    app: &'a AppTopology,
    avail: AvailResources,
    placed: PlacedNodes,
    priority: Priority,
    pipeline: &'a FilterPipeline,
}

impl<'a> SearchRun<'a> {
    fn no_candidate(node: NodeRef<'_>, level: Level, filter: &'static str) -> PlacementError {
        PlacementError::NoCandidate {
            orch_id: node.orch_id().to_string(),
            level,
            filter,
        }
    }

    fn place_node(&mut self, id: &NodeId, scope: Option<(Level, String)>) -> PlacementResult<()> {
        let app = self.app;
        let node = app
            .node(id)
            .ok_or_else(|| PlacementError::DanglingReference(id.orch_id().to_string()))?;
        let target = node.level();
        let leaves = app.leaves(id);
        let pins: BTreeSet<&str> = leaves
            .iter()
            .filter_map(|vm| vm.pinned_host.as_deref())
            .collect();
        let excluded: BTreeSet<&str> = leaves
            .iter()
            .flat_map(|vm| vm.excluded_hosts.iter().map(String::as_str))
            .collect();

        let start = scope.as_ref().map_or(Level::Cluster, |(level, _)| *level);
        let mut chosen = scope;
        for level in Level::DESCENDING {
            if level > start || level < target {
                continue;
            }
            let mut candidates = match &chosen {
                Some((at, name)) if *at == level => vec![name.clone()],
                Some((at, name)) => self.avail.children_of(*at, name),
                None => self.avail.names_at(level),
            };
            if !pins.is_empty() && !candidates.is_empty() {
                candidates.retain(|c| {
                    pins.iter().all(|pin| {
                        self.avail.ancestor(Level::Host, pin, level).as_deref() == Some(c.as_str())
                    })
                });
                if candidates.is_empty() {
                    return Err(Self::no_candidate(node, level, "pinned_host"));
                }
            }
            if level == Level::Host && !excluded.is_empty() && !candidates.is_empty() {
                candidates.retain(|c| !excluded.contains(c.as_str()));
                if candidates.is_empty() {
                    return Err(Self::no_candidate(node, level, "excluded_hosts"));
                }
            }

            let ctx = FilterContext {
                avail: &self.avail,
                app,
                placed: &self.placed,
            };
            let survivors = self.pipeline.run(&ctx, level, node, candidates)?;
            let best = self
                .best_fit(level, node, &survivors)
                .ok_or_else(|| Self::no_candidate(node, level, "scope"))?;
            debug!(
                orch_id = node.orch_id(),
                %level,
                resource = %best,
                candidates = survivors.len(),
                "level decided"
            );
            chosen = Some((level, best));
        }

        let Some((_, resource)) = chosen else {
            return Err(Self::no_candidate(node, target, "scope"));
        };

        match node {
            NodeRef::Vm(vm) => {
                let tags = app.membership_tags(&vm.orch_id);
                self.avail.commit_vm(&resource, vm.demand, &tags);
                self.placed.insert(&vm.orch_id, Level::Host, &resource);
            }
            NodeRef::Group(group) => {
                self.placed.insert(&group.orch_id, group.level, &resource);
                for child in by_weight(app, app.children(id)) {
                    self.place_node(&child, Some((group.level, resource.clone())))?;
                }
            }
        }
        Ok(())
    }

    /// Survivor left tightest after taking the node's demand.
    ///
    /// Score is the weighted sum of relative leftovers; ties go to the
    /// smaller leftover of the scarcest resource, then to the name.
    fn best_fit(&self, level: Level, node: NodeRef<'_>, survivors: &[String]) -> Option<String> {
        let demand = node.demand();
        let top = self.priority.order.first().copied().unwrap_or(ResourceKind::Cpu);
        survivors
            .iter()
            .filter_map(|name| self.avail.get(level, name))
            .map(|r| {
                let score: f64 = ResourceKind::ALL
                    .iter()
                    .map(|&k| {
                        let total = k.of(&r.capacity);
                        if total == 0 {
                            return 0.0;
                        }
                        let left = k.of(&r.avail) as f64 - k.of(&demand) as f64;
                        self.priority.weight(k) * left / total as f64
                    })
                    .sum();
                let leftover = top.of(&r.avail).saturating_sub(top.of(&demand));
                (score, leftover, r.name.as_str())
            })
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then_with(|| a.2.cmp(b.2))
            })
            .map(|(_, _, name)| name.to_string())
    }
}
