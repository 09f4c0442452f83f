//! AppRequestHandler: create, update, replan, migrate, identify and ping.
//!
//! Every placing action runs the same way: parse the request into an
//! application tree, pin or free VMs according to the action, search, and
//! only then commit. Commit writes the stack record and placements through
//! to the store before re-accounting the stack in the topology, so a
//! rejected request leaves nothing behind.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use valet_placement::{AppTopology, LevelSearch, VmRef, parse};
use valet_state::{
    GroupSpec, OrchId, Placement, PlacementState, StackId, StackRecord, StackResource, epoch_secs,
};

use crate::cache::PlacementUpdate;
use crate::engine::EngineState;
use crate::error::{EngineError, EngineResult};

// ── Request / response ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Replan,
    Migrate,
    Identify,
    Ping,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Replan => "replan",
            Action::Migrate => "migrate",
            Action::Identify => "identify",
            Action::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRequest {
    pub action: Action,
    /// Caller-chosen id; a repeated id is answered from decision history.
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub stack_id: StackId,
    #[serde(default)]
    pub resources: BTreeMap<OrchId, StackResource>,
    #[serde(default)]
    pub groups: BTreeMap<OrchId, GroupSpec>,
    /// Uuids or orch_ids of the VMs a replan, migrate or identify acts on.
    #[serde(default)]
    pub targets: Vec<String>,
}

impl AppRequest {
    pub fn new(action: Action, stack_id: &str) -> Self {
        Self {
            action,
            request_id: None,
            stack_id: stack_id.to_string(),
            resources: BTreeMap::new(),
            groups: BTreeMap::new(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AppResponse {
    /// orch_id → host for every VM of the stack.
    Placed { placements: BTreeMap<OrchId, String> },
    /// Target → recorded host.
    Identified { hosts: BTreeMap<String, String> },
    Pong { pong: bool },
}

impl AppResponse {
    fn placed(placements: BTreeMap<OrchId, String>) -> Self {
        Self::Placed { placements }
    }
}

/// Caller-facing reply: `status` is `"success"` or the rejection reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub status: String,
    #[serde(flatten)]
    pub result: Option<AppResponse>,
}

impl Reply {
    pub const SUCCESS: &'static str = "success";

    pub fn from_result(result: EngineResult<AppResponse>) -> Self {
        match result {
            Ok(response) => Self {
                status: Self::SUCCESS.to_string(),
                result: Some(response),
            },
            Err(err) => Self {
                status: err.status(),
                result: None,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

// ── Commit plan ───────────────────────────────────────────────────

/// Everything a successful search hands to the commit step.
struct Commit<'a> {
    stack_id: &'a str,
    resources: &'a BTreeMap<OrchId, StackResource>,
    groups: &'a BTreeMap<OrchId, GroupSpec>,
    previous: Option<&'a StackRecord>,
    /// Targets of a replan or migrate and the state they move to.
    moved: Option<(&'a BTreeSet<OrchId>, PlacementState)>,
}

/// Planned placements have not reached the hypervisor yet.
fn not_yet_built(state: Option<PlacementState>) -> bool {
    matches!(
        state,
        Some(PlacementState::Planned | PlacementState::Planning)
    )
}

/// Decided hosts recorded on a stack's servers.
fn recorded_hosts(record: &StackRecord) -> BTreeMap<OrchId, String> {
    record
        .resources
        .iter()
        .filter(|(_, r)| r.is_server())
        .filter_map(|(orch_id, r)| r.properties.host.clone().map(|h| (orch_id.clone(), h)))
        .collect()
}

/// Placement key of a stack server: its uuid once built, else the planned key.
fn placement_key(stack_id: &str, orch_id: &str, record: Option<&StackRecord>) -> String {
    record
        .and_then(|r| r.resources.get(orch_id))
        .and_then(|r| r.properties.uuid.clone())
        .unwrap_or_else(|| Placement::planned_key(stack_id, orch_id))
}

impl EngineState {
    pub fn handle_request(&mut self, request: &AppRequest) -> EngineResult<AppResponse> {
        if request.action == Action::Ping {
            return Ok(AppResponse::Pong { pong: true });
        }
        if request.stack_id.is_empty() {
            return Err(EngineError::InvalidRequest("missing stack_id".to_string()));
        }
        if let Some(request_id) = &request.request_id {
            if let Some(placements) = self.decisions.get(request_id.as_str()) {
                debug!(%request_id, "request answered from decision history");
                return Ok(AppResponse::placed(placements.clone()));
            }
        }

        let result = match request.action {
            Action::Ping => Ok(AppResponse::Pong { pong: true }),
            Action::Identify => self.identify(request),
            Action::Create => self.create(request).map(AppResponse::placed),
            Action::Update => self.update(request).map(AppResponse::placed),
            Action::Replan => self
                .replan(request, PlacementState::Rebuild)
                .map(AppResponse::placed),
            Action::Migrate => self
                .replan(request, PlacementState::Migrate)
                .map(AppResponse::placed),
        };

        match &result {
            Ok(AppResponse::Placed { placements }) => {
                if let Some(request_id) = &request.request_id {
                    self.decisions.insert(request_id.clone(), placements.clone());
                }
            }
            Ok(_) => {}
            Err(err) => warn!(
                stack_id = %request.stack_id,
                action = request.action.as_str(),
                reason = %err,
                "request rejected"
            ),
        }
        result
    }

    fn create(&mut self, request: &AppRequest) -> EngineResult<BTreeMap<OrchId, String>> {
        if let Some(existing) = self.get_stack(&request.stack_id)? {
            let decided = recorded_hosts(&existing);
            if !decided.is_empty() {
                info!(stack_id = %request.stack_id, "stack already planned");
                return Ok(decided);
            }
        }

        let mut app = parse(
            &request.stack_id,
            &request.resources,
            &request.groups,
            &self.topology,
        )?;
        let decisions = LevelSearch::new(&self.topology, &self.pipeline).place(&mut app, None)?;
        self.commit(
            Commit {
                stack_id: &request.stack_id,
                resources: &request.resources,
                groups: &request.groups,
                previous: None,
                moved: None,
            },
            &app,
            &decisions,
        )?;
        Ok(decisions)
    }

    /// Re-place a stack against a new resource map. VMs that already have
    /// a host keep it; new VMs are placed freely.
    fn update(&mut self, request: &AppRequest) -> EngineResult<BTreeMap<OrchId, String>> {
        let previous = self
            .get_stack(&request.stack_id)?
            .ok_or_else(|| EngineError::NoRecord(request.stack_id.clone()))?;

        let mut app = parse(
            &request.stack_id,
            &request.resources,
            &request.groups,
            &self.topology,
        )?;
        let current = recorded_hosts(&previous);
        for vm in app.vms.values_mut() {
            if vm.pinned_host.is_none() {
                vm.pinned_host = current.get(&vm.orch_id).cloned();
            }
        }
        let decisions = LevelSearch::new(&self.topology, &self.pipeline)
            .place(&mut app, Some(&request.stack_id))?;
        self.commit(
            Commit {
                stack_id: &request.stack_id,
                resources: &request.resources,
                groups: &request.groups,
                previous: Some(&previous),
                moved: None,
            },
            &app,
            &decisions,
        )?;
        Ok(decisions)
    }

    /// Free the targets and place them again. Everything else stays pinned;
    /// a migrating target may not land on its current host.
    fn replan(
        &mut self,
        request: &AppRequest,
        moved_state: PlacementState,
    ) -> EngineResult<BTreeMap<OrchId, String>> {
        let previous = self
            .get_stack(&request.stack_id)?
            .ok_or_else(|| EngineError::NoRecord(request.stack_id.clone()))?;
        let targets = self.resolve_targets(&previous, &request.targets)?;
        if targets.is_empty() {
            return Err(EngineError::NoTarget(request.action.as_str().to_string()));
        }

        let (resources, groups) = if request.resources.is_empty() {
            (&previous.resources, &previous.groups)
        } else {
            (&request.resources, &request.groups)
        };
        let mut app = parse(&request.stack_id, resources, groups, &self.topology)?;
        let current = recorded_hosts(&previous);
        for vm in app.vms.values_mut() {
            let host = current.get(&vm.orch_id).cloned();
            if targets.contains(&vm.orch_id) {
                if moved_state == PlacementState::Migrate {
                    vm.excluded_hosts.extend(host);
                }
            } else if vm.pinned_host.is_none() {
                vm.pinned_host = host;
            }
        }
        let decisions = LevelSearch::new(&self.topology, &self.pipeline)
            .place(&mut app, Some(&request.stack_id))?;
        self.commit(
            Commit {
                stack_id: &request.stack_id,
                resources,
                groups,
                previous: Some(&previous),
                moved: Some((&targets, moved_state)),
            },
            &app,
            &decisions,
        )?;
        Ok(decisions)
    }

    /// Map request targets (uuids or orch_ids) to server orch_ids.
    fn resolve_targets(
        &mut self,
        record: &StackRecord,
        targets: &[String],
    ) -> EngineResult<BTreeSet<OrchId>> {
        let mut resolved = BTreeSet::new();
        for target in targets {
            if record.resources.get(target).is_some_and(StackResource::is_server) {
                resolved.insert(target.clone());
            } else if let Some((orch_id, _)) = record.find_by_uuid(target) {
                resolved.insert(orch_id.clone());
            } else if let Some(p) = self.placements.get_placement(target)? {
                if p.stack_id == record.stack_id {
                    resolved.insert(p.orch_id);
                }
            } else {
                debug!(stack_id = %record.stack_id, %target, "target not found");
            }
        }
        Ok(resolved)
    }

    /// Report the recorded host of each target and mark it verified.
    fn identify(&mut self, request: &AppRequest) -> EngineResult<AppResponse> {
        let record = self.get_stack(&request.stack_id)?;
        let mut hosts = BTreeMap::new();
        for target in &request.targets {
            let key = match &record {
                Some(r) if r.resources.contains_key(target) => {
                    placement_key(&request.stack_id, target, Some(r))
                }
                _ => target.clone(),
            };
            if let Some(placement) = self.placements.get_placement(&key)? {
                self.placements.set_verified(&key)?;
                hosts.insert(target.clone(), placement.host);
            }
        }
        if hosts.is_empty() {
            return Err(EngineError::NoTarget(Action::Identify.as_str().to_string()));
        }
        Ok(AppResponse::Identified { hosts })
    }

    /// Persist a search result, then re-account the stack in the topology.
    fn commit(
        &mut self,
        plan: Commit<'_>,
        app: &AppTopology,
        decisions: &BTreeMap<OrchId, String>,
    ) -> EngineResult<()> {
        let now = epoch_secs();
        let stack_id = plan.stack_id;

        let mut resources = plan.resources.clone();
        for (orch_id, resource) in resources.iter_mut() {
            if let Some(host) = decisions.get(orch_id) {
                resource.properties.host = Some(host.clone());
            }
            if resource.properties.uuid.is_none() {
                resource.properties.uuid = plan
                    .previous
                    .and_then(|p| p.resources.get(orch_id))
                    .and_then(|r| r.properties.uuid.clone());
            }
        }
        let record = StackRecord {
            stack_id: stack_id.to_string(),
            resources,
            groups: plan.groups.clone(),
            created_at: plan.previous.map_or(now, |p| p.created_at),
            updated_at: now,
        };

        for (orch_id, host) in decisions {
            let key = placement_key(stack_id, orch_id, Some(&record));
            let moved_state = plan
                .moved
                .filter(|(targets, _)| targets.contains(orch_id))
                .map(|(_, state)| state);
            match self.placements.get_placement(&key)? {
                None => self.placements.insert_placement(Placement {
                    uuid: key,
                    stack_id: stack_id.to_string(),
                    orch_id: orch_id.clone(),
                    host: host.clone(),
                    state: Some(PlacementState::Planned),
                    original_host: None,
                    verified: false,
                    dirty: false,
                    timestamp: now,
                })?,
                Some(existing) => {
                    if existing.host != *host {
                        self.placements.set_original_host(&key, &existing.host)?;
                    }
                    let state = moved_state.filter(|_| !not_yet_built(existing.state));
                    self.placements.update_placement(
                        &key,
                        &PlacementUpdate {
                            host: Some(host.clone()),
                            state,
                            ..Default::default()
                        },
                    )?;
                }
            }
        }

        if let Some(previous) = plan.previous {
            for (orch_id, resource) in &previous.resources {
                if resource.is_server() && !decisions.contains_key(orch_id) {
                    let key = placement_key(stack_id, orch_id, Some(previous));
                    self.placements.delete_placement(&key)?;
                    info!(%stack_id, %orch_id, "vm released from stack");
                }
            }
        }

        self.put_stack(record.clone())?;

        for (host, placed) in self.topology.vms_of_stack(stack_id) {
            self.topology.remove_vm_from_host(&host, &placed.vm.key())?;
        }
        for (orch_id, host) in decisions {
            let Some(vm) = app.vms.get(orch_id) else {
                continue;
            };
            let vm_ref = VmRef {
                uuid: record
                    .resources
                    .get(orch_id)
                    .and_then(|r| r.properties.uuid.clone()),
                ..VmRef::new(stack_id, orch_id)
            };
            self.topology
                .add_vm_to_host(host, vm_ref, vm.demand, app.membership_tags(orch_id))?;
            info!(%stack_id, %orch_id, %host, "placement decided");
        }
        Ok(())
    }
}
