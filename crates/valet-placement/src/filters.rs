//! Candidate filters applied at every level of the search.
//!
//! Each filter has a cheap pre-condition (does it apply to this node at this
//! level at all?) and a narrowing step over candidate resource names. The
//! pipeline runs them in a fixed order and reports the first one that
//! leaves nothing.

use std::collections::{BTreeMap, BTreeSet};

use valet_state::Capacity;

use crate::app::{AppTopology, NodeRef};
use crate::avail::{AvailResource, AvailResources, PlacedNodes};
use crate::error::{PlacementError, PlacementResult};
use crate::resource::{GroupType, Level, ResourceKind};

/// Scope prefix honored in flavor extra specs; other scopes are ignored.
const EXTRA_SPECS_SCOPE: &str = "aggregate_instance_extra_specs";

/// Everything a filter may look at besides the node itself.
pub struct FilterContext<'a> {
    pub avail: &'a AvailResources,
    pub app: &'a AppTopology,
    pub placed: &'a PlacedNodes,
}

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this filter has anything to say about `node` at `level`.
    fn check_pre_condition(
        &self,
        level: Level,
        node: NodeRef<'_>,
        placed: &PlacedNodes,
        avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool;

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String>;
}

fn retain_by(
    ctx: &FilterContext<'_>,
    level: Level,
    candidates: Vec<String>,
    keep: impl Fn(&AvailResource) -> bool,
) -> Vec<String> {
    candidates
        .into_iter()
        .filter(|c| ctx.avail.get(level, c).is_some_and(&keep))
        .collect()
}

/// Tag ids carried by some ancestor of `node`; the ancestor enforced them
/// when it was placed.
fn inherited_ids(ctx: &FilterContext<'_>, node: NodeRef<'_>, exclusivity: bool) -> BTreeSet<String> {
    ctx.app
        .ancestors(&node.id())
        .into_iter()
        .flat_map(|g| {
            let tags = if exclusivity {
                &g.exclusivity_groups
            } else {
                &g.diversity_groups
            };
            tags.keys().cloned()
        })
        .collect()
}

// ── Capacity ──────────────────────────────────────────────────────

/// Keeps resources with room for the node's demand of one resource kind.
///
/// Above the node's own level a candidate passes when some resource at the
/// node's level below it has the room.
pub struct CapacityFilter {
    kind: ResourceKind,
}

impl CapacityFilter {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind }
    }
}

impl Filter for CapacityFilter {
    fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    fn check_pre_condition(
        &self,
        _level: Level,
        _node: NodeRef<'_>,
        _placed: &PlacedNodes,
        _avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        true
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let kind = self.kind;
        let demand = kind.of(&node.demand());
        candidates
            .into_iter()
            .filter(|c| {
                ctx.avail
                    .max_avail_under(level, c, node.level(), |cap: &Capacity| kind.of(cap))
                    >= demand
            })
            .collect()
    }
}

// ── Availability zone ─────────────────────────────────────────────

pub struct AvailabilityZoneFilter;

impl Filter for AvailabilityZoneFilter {
    fn name(&self) -> &'static str {
        "availability_zone"
    }

    fn check_pre_condition(
        &self,
        _level: Level,
        node: NodeRef<'_>,
        _placed: &PlacedNodes,
        _avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        !node.availability_zones().is_empty()
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let zones = node.availability_zones();
        retain_by(ctx, level, candidates, |r| {
            zones.iter().all(|z| r.memberships.contains(*z))
        })
    }
}

// ── Aggregate extra specs ─────────────────────────────────────────

pub struct AggregateInstanceExtraSpecsFilter;

impl Filter for AggregateInstanceExtraSpecsFilter {
    fn name(&self) -> &'static str {
        "aggregate_instance_extra_specs"
    }

    fn check_pre_condition(
        &self,
        _level: Level,
        node: NodeRef<'_>,
        _placed: &PlacedNodes,
        _avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        !node.extra_specs_list().is_empty()
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let specs = node.extra_specs_list();
        retain_by(ctx, level, candidates, |r| {
            specs.iter().all(|s| extra_specs_satisfied(s, &r.metadata))
        })
    }
}

/// Whether aggregate `metadata` satisfies every in-scope extra spec.
pub fn extra_specs_satisfied(
    specs: &BTreeMap<String, String>,
    metadata: &BTreeMap<String, BTreeSet<String>>,
) -> bool {
    specs.iter().all(|(key, req)| {
        let key = match key.split_once(':') {
            Some((EXTRA_SPECS_SCOPE, rest)) => rest,
            Some(_) => return true,
            None => key.as_str(),
        };
        metadata
            .get(key)
            .is_some_and(|values| values.iter().any(|v| spec_matches(v, req)))
    })
}

/// Match one metadata value against an extra-spec requirement.
///
/// Requirements may start with an operator: `=` (numeric at least), `==`,
/// `!=`, `>=`, `<=` (numeric), `s==`, `s!=`, `s<`, `s<=`, `s>`, `s>=`
/// (string), `<in>` (substring), `<all-in>` and `<or>`. Anything else is
/// compared verbatim.
pub fn spec_matches(value: &str, req: &str) -> bool {
    let words: Vec<&str> = req.split_whitespace().collect();
    let Some((&op, rest)) = words.split_first() else {
        return value == req;
    };

    if op == "<or>" {
        // <or> a <or> b ...
        return rest
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 0)
            .any(|(_, w)| *w == value);
    }
    if op == "<all-in>" {
        return !rest.is_empty() && rest.iter().all(|w| value.contains(w));
    }

    let numeric = |cmp: fn(f64, f64) -> bool| {
        let (Some(arg), Ok(v)) = (rest.first(), value.parse::<f64>()) else {
            return false;
        };
        arg.parse::<f64>().is_ok_and(|a| cmp(v, a))
    };
    let string = |cmp: fn(&str, &str) -> bool| rest.first().is_some_and(|arg| cmp(value, arg));

    match op {
        "=" => numeric(|v, a| v >= a),
        "==" => numeric(|v, a| v == a),
        "!=" => numeric(|v, a| v != a),
        ">=" => numeric(|v, a| v >= a),
        "<=" => numeric(|v, a| v <= a),
        "s==" => string(|v, a| v == a),
        "s!=" => string(|v, a| v != a),
        "s<" => string(|v, a| v < a),
        "s<=" => string(|v, a| v <= a),
        "s>" => string(|v, a| v > a),
        "s>=" => string(|v, a| v >= a),
        "<in>" => string(|v, a| v.contains(a)),
        _ => value == req,
    }
}

// ── Diversity ─────────────────────────────────────────────────────

/// Keeps a node away from resources already taken, in this request, by
/// other members of its diversity groups.
pub struct DiversityFilter;

impl Filter for DiversityFilter {
    fn name(&self) -> &'static str {
        "diversity"
    }

    fn check_pre_condition(
        &self,
        _level: Level,
        node: NodeRef<'_>,
        placed: &PlacedNodes,
        _avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        !placed.is_empty() && !node.diversity_groups().is_empty()
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let inherited = inherited_ids(ctx, node, false);
        let lineage: BTreeSet<&str> = ctx
            .app
            .ancestors(&node.id())
            .iter()
            .map(|g| g.orch_id.as_str())
            .chain([node.orch_id()])
            .collect();

        // Resources at each tag's level taken by other placed members.
        let mut taken: Vec<(Level, BTreeSet<String>)> = Vec::new();
        for (div_id, tag) in node.diversity_groups() {
            if inherited.contains(div_id) {
                continue;
            }
            let mut used = BTreeSet::new();
            for (orch_id, placed_level, resource) in ctx.placed.iter() {
                if lineage.contains(orch_id.as_str()) {
                    continue;
                }
                let peer = ctx
                    .app
                    .vms
                    .get(orch_id)
                    .map(|vm| &vm.diversity_groups)
                    .or_else(|| ctx.app.vgroups.get(orch_id).map(|g| &g.diversity_groups));
                if peer.is_some_and(|groups| groups.contains_key(div_id))
                    && let Some(at) = ctx.avail.ancestor(placed_level, resource, tag.level)
                {
                    used.insert(at);
                }
            }
            if !used.is_empty() {
                taken.push((tag.level, used));
            }
        }
        if taken.is_empty() {
            return candidates;
        }

        candidates
            .into_iter()
            .filter(|c| {
                taken.iter().all(|(tag_level, used)| {
                    ctx.avail
                        .any_under(level, c, *tag_level, |r| !used.contains(&r.name))
                })
            })
            .collect()
    }
}

// ── Named groups ──────────────────────────────────────────────────

/// Sends a named affinity group to where its earlier members live.
pub struct NamedAffinityFilter;

impl Filter for NamedAffinityFilter {
    fn name(&self) -> &'static str {
        "named_affinity"
    }

    fn check_pre_condition(
        &self,
        level: Level,
        node: NodeRef<'_>,
        _placed: &PlacedNodes,
        avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        node.named_affinity()
            .is_some_and(|name| level >= node.level() && avail_groups.contains_key(name))
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let Some(name) = node.named_affinity() else {
            return candidates;
        };
        candidates
            .into_iter()
            .filter(|c| {
                ctx.avail
                    .any_under(level, c, node.level(), |r| r.memberships.contains(name))
            })
            .collect()
    }
}

/// Members of an exclusivity group only land on resources already holding
/// that group, or on empty ones.
pub struct NamedExclusivityFilter;

impl Filter for NamedExclusivityFilter {
    fn name(&self) -> &'static str {
        "named_exclusivity"
    }

    fn check_pre_condition(
        &self,
        _level: Level,
        node: NodeRef<'_>,
        _placed: &PlacedNodes,
        _avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        !node.exclusivity_groups().is_empty()
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let inherited = inherited_ids(ctx, node, true);
        let tags: Vec<_> = node
            .exclusivity_groups()
            .iter()
            .filter(|(id, _)| !inherited.contains(*id))
            .map(|(_, t)| t)
            .collect();
        candidates
            .into_iter()
            .filter(|c| {
                tags.iter().all(|tag| {
                    ctx.avail.any_under(level, c, tag.level, |r| {
                        r.memberships.contains(&tag.name) || r.num_vms == 0
                    })
                })
            })
            .collect()
    }
}

/// Keeps members of a named diversity group off resources where the group
/// already has a member.
pub struct NamedDiversityFilter;

impl Filter for NamedDiversityFilter {
    fn name(&self) -> &'static str {
        "named_diversity"
    }

    fn check_pre_condition(
        &self,
        _level: Level,
        node: NodeRef<'_>,
        _placed: &PlacedNodes,
        _avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        node.diversity_groups().values().any(|t| t.named)
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let inherited = inherited_ids(ctx, node, false);
        let tags: Vec<_> = node
            .diversity_groups()
            .iter()
            .filter(|(id, t)| t.named && !inherited.contains(*id))
            .map(|(_, t)| t)
            .collect();
        candidates
            .into_iter()
            .filter(|c| {
                tags.iter().all(|tag| {
                    ctx.avail
                        .any_under(level, c, tag.level, |r| !r.memberships.contains(&tag.name))
                })
            })
            .collect()
    }
}

/// Keeps nodes off resources owned by exclusivity groups they do not
/// belong to.
pub struct NoExclusivityFilter;

impl Filter for NoExclusivityFilter {
    fn name(&self) -> &'static str {
        "no_exclusivity"
    }

    fn check_pre_condition(
        &self,
        level: Level,
        node: NodeRef<'_>,
        _placed: &PlacedNodes,
        avail_groups: &BTreeMap<String, GroupType>,
    ) -> bool {
        !node.exclusivity_groups().values().any(|t| t.level == level)
            && avail_groups.values().any(|t| *t == GroupType::Ex)
    }

    fn filter_candidates(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> Vec<String> {
        let allowed: BTreeSet<&str> = ctx
            .app
            .ancestors(&node.id())
            .into_iter()
            .flat_map(|g| g.exclusivity_groups.values())
            .chain(node.exclusivity_groups().values())
            .map(|t| t.name.as_str())
            .collect();
        let types = ctx.avail.group_types();
        let clean = |r: &AvailResource| {
            r.memberships.iter().all(|m| {
                types.get(m) != Some(&GroupType::Ex) || allowed.contains(m.as_str())
            })
        };
        candidates
            .into_iter()
            .filter(|c| {
                ctx.avail.get(level, c).is_some_and(clean)
                    && ctx.avail.any_under(level, c, node.level(), clean)
            })
            .collect()
    }
}

// ── Pipeline ──────────────────────────────────────────────────────

/// The ordered filter chain.
pub struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
}

impl Default for FilterPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl FilterPipeline {
    /// Capacity, zone, aggregate and group filters in evaluation order.
    pub fn standard() -> Self {
        Self {
            filters: vec![
                Box::new(CapacityFilter::new(ResourceKind::Cpu)),
                Box::new(CapacityFilter::new(ResourceKind::Mem)),
                Box::new(CapacityFilter::new(ResourceKind::Disk)),
                Box::new(AvailabilityZoneFilter),
                Box::new(AggregateInstanceExtraSpecsFilter),
                Box::new(DiversityFilter),
                Box::new(NamedAffinityFilter),
                Box::new(NamedExclusivityFilter),
                Box::new(NamedDiversityFilter),
                Box::new(NoExclusivityFilter),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Narrow `candidates` for `node` at `level`.
    ///
    /// Fails with [`PlacementError::NoCandidate`] naming the filter that
    /// left nothing (`scope` when there was nothing to begin with).
    pub fn run(
        &self,
        ctx: &FilterContext<'_>,
        level: Level,
        node: NodeRef<'_>,
        candidates: Vec<String>,
    ) -> PlacementResult<Vec<String>> {
        let no_candidate = |filter: &'static str| PlacementError::NoCandidate {
            orch_id: node.orch_id().to_string(),
            level,
            filter,
        };
        if candidates.is_empty() {
            return Err(no_candidate("scope"));
        }
        let mut candidates = candidates;
        for filter in &self.filters {
            if !filter.check_pre_condition(level, node, ctx.placed, ctx.avail.group_types()) {
                continue;
            }
            candidates = filter.filter_candidates(ctx, level, node, candidates);
            if candidates.is_empty() {
                return Err(no_candidate(filter.name()));
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::GroupTag;
    use crate::app::tests::vm;
    use crate::resource::{MembershipTag, VmRef};
    use crate::topology::tests::two_rack_topology;

    fn all_hosts() -> Vec<String> {
        ["h1", "h2", "h3", "h4"].iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn spec_operators() {
        assert!(spec_matches("true", "true"));
        assert!(!spec_matches("false", "true"));
        assert!(spec_matches("16", "= 8"));
        assert!(!spec_matches("4", "= 8"));
        assert!(spec_matches("4", "<= 8"));
        assert!(spec_matches("ssd", "s== ssd"));
        assert!(spec_matches("fast-ssd", "<in> ssd"));
        assert!(spec_matches("b", "<or> a <or> b"));
        assert!(!spec_matches("c", "<or> a <or> b"));
        assert!(!spec_matches("abc", "= 1"));
    }

    #[test]
    fn extra_specs_scope_handling() {
        let mut metadata = BTreeMap::new();
        metadata.insert("ssd".to_string(), BTreeSet::from(["true".to_string()]));
        let specs = |k: &str, v: &str| BTreeMap::from([(k.to_string(), v.to_string())]);

        assert!(extra_specs_satisfied(&specs("aggregate_instance_extra_specs:ssd", "true"), &metadata));
        assert!(extra_specs_satisfied(&specs("ssd", "true"), &metadata));
        assert!(extra_specs_satisfied(&specs("hw:cpu_policy", "dedicated"), &metadata));
        assert!(!extra_specs_satisfied(&specs("gpu", "true"), &metadata));
    }

    #[test]
    fn capacity_filter_checks_finest_level_below() {
        let mut topo = two_rack_topology();
        for host in ["h1", "h2"] {
            topo.add_vm_to_host(host, VmRef::new("s0", host), Capacity::new(6, 1024, 10), Vec::new())
                .unwrap();
        }
        let avail = AvailResources::build(&topo, None);
        let app = AppTopology::default();
        let placed = PlacedNodes::default();
        let ctx = FilterContext {
            avail: &avail,
            app: &app,
            placed: &placed,
        };
        let node = vm("a", Capacity::new(4, 1024, 10));
        let racks = vec!["r1".to_string(), "r2".to_string()];

        let kept = CapacityFilter::new(ResourceKind::Cpu).filter_candidates(
            &ctx,
            Level::Rack,
            NodeRef::Vm(&node),
            racks,
        );
        // r1 has 4 free vcpus in total but no host with 4 free.
        assert_eq!(kept, vec!["r2"]);
    }

    #[test]
    fn exclusivity_keeps_tagged_or_empty_hosts() {
        let mut topo = two_rack_topology();
        let ex = MembershipTag {
            name: "gold".to_string(),
            group_type: GroupType::Ex,
            level: Level::Host,
        };
        topo.add_vm_to_host("h1", VmRef::new("s0", "x"), Capacity::new(1, 1024, 10), vec![ex])
            .unwrap();
        topo.add_vm_to_host("h2", VmRef::new("s0", "y"), Capacity::new(1, 1024, 10), Vec::new())
            .unwrap();
        let avail = AvailResources::build(&topo, None);
        let app = AppTopology::default();
        let placed = PlacedNodes::default();
        let ctx = FilterContext {
            avail: &avail,
            app: &app,
            placed: &placed,
        };

        let mut member = vm("a", Capacity::new(1, 1024, 10));
        member.exclusivity_groups.insert(
            "ex".to_string(),
            GroupTag {
                name: "gold".to_string(),
                level: Level::Host,
                named: true,
            },
        );
        let kept = NamedExclusivityFilter.filter_candidates(
            &ctx,
            Level::Host,
            NodeRef::Vm(&member),
            all_hosts(),
        );
        assert_eq!(kept, vec!["h1", "h3", "h4"]);

        let outsider = vm("b", Capacity::new(1, 1024, 10));
        assert!(NoExclusivityFilter.check_pre_condition(
            Level::Host,
            NodeRef::Vm(&outsider),
            &placed,
            avail.group_types()
        ));
        let kept = NoExclusivityFilter.filter_candidates(
            &ctx,
            Level::Host,
            NodeRef::Vm(&outsider),
            all_hosts(),
        );
        assert_eq!(kept, vec!["h2", "h3", "h4"]);
    }

    #[test]
    fn pipeline_reports_the_emptying_filter() {
        let topo = two_rack_topology();
        let avail = AvailResources::build(&topo, None);
        let app = AppTopology::default();
        let placed = PlacedNodes::default();
        let ctx = FilterContext {
            avail: &avail,
            app: &app,
            placed: &placed,
        };
        let pipeline = FilterPipeline::standard();
        assert_eq!(pipeline.names()[..3], ["cpu", "mem", "disk"]);

        let big = vm("big", Capacity::new(1, 65536, 10));
        let err = pipeline
            .run(&ctx, Level::Host, NodeRef::Vm(&big), all_hosts())
            .unwrap_err();
        assert_eq!(
            err,
            PlacementError::NoCandidate {
                orch_id: "big".into(),
                level: Level::Host,
                filter: "mem",
            }
        );

        let mut zoned = vm("z", Capacity::new(1, 1024, 10));
        zoned.availability_zone = Some("az9".to_string());
        let err = pipeline
            .run(&ctx, Level::Host, NodeRef::Vm(&zoned), all_hosts())
            .unwrap_err();
        assert!(err.to_string().contains("availability_zone"));

        let err = pipeline
            .run(&ctx, Level::Host, NodeRef::Vm(&zoned), Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("scope"));
    }
}
