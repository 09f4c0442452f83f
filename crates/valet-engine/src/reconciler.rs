//! EventReconciler: applies queued infrastructure events to the topology,
//! placements and stack records.
//!
//! A batch is read from the store, applied event by event, and deleted
//! only once every event has been handled. A malformed or unrecognized
//! event is dropped with a warning and the batch continues; a store failure
//! aborts the batch so the whole of it is delivered again. Every handler is
//! written so that applying an event twice ends in the same state as
//! applying it once.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use valet_placement::{HostUpdate, VmRef};
use valet_state::{EventRecord, Placement, PlacementState, epoch_secs};

use crate::cache::PlacementUpdate;
use crate::engine::EngineState;
use crate::error::EngineResult;

pub const BUILD_AND_RUN_INSTANCE: &str = "build_and_run_instance";
pub const REBUILD_INSTANCE: &str = "rebuild_instance";
pub const LIVE_MIGRATION: &str = "live_migration";
pub const INSTANCE_ACTIVE: &str = "instance_active";
pub const INSTANCE_DELETED: &str = "instance_deleted";
pub const COMPUTE_NODE_UPDATE: &str = "compute_node_update";

/// What happened to the events of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub dropped: usize,
    pub deferred: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.applied + self.dropped + self.deferred
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Dropped,
    Deferred,
}

#[derive(Debug, Deserialize)]
struct InstanceArgs {
    uuid: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    stack_id: Option<String>,
    #[serde(default)]
    orch_id: Option<String>,
    #[serde(default)]
    flavor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ComputeNodeArgs {
    host: String,
    #[serde(flatten)]
    update: HostUpdate,
}

fn parse_args<T: DeserializeOwned>(event: &EventRecord) -> Option<T> {
    match serde_json::from_value(event.args.clone()) {
        Ok(args) => Some(args),
        Err(err) => {
            warn!(
                event_id = event.event_id,
                method = %event.method,
                error = %err,
                "malformed event dropped"
            );
            None
        }
    }
}

impl EngineState {
    /// Apply one batch of queued events.
    pub fn process_events(&mut self) -> EngineResult<BatchReport> {
        let events = self.store.list_events(self.event_batch_size)?;
        let mut report = BatchReport::default();
        if events.is_empty() {
            return Ok(report);
        }

        for event in &events {
            match self.apply_event(event)? {
                Outcome::Applied => report.applied += 1,
                Outcome::Dropped => report.dropped += 1,
                Outcome::Deferred => report.deferred += 1,
            }
        }

        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        self.store.delete_events(&ids)?;
        self.flush_caches();
        debug!(
            applied = report.applied,
            dropped = report.dropped,
            deferred = report.deferred,
            "event batch processed"
        );
        Ok(report)
    }

    fn apply_event(&mut self, event: &EventRecord) -> EngineResult<Outcome> {
        let outcome = match event.method.as_str() {
            BUILD_AND_RUN_INSTANCE => parse_args::<InstanceArgs>(event).map(|a| self.on_build(a)),
            REBUILD_INSTANCE => parse_args::<InstanceArgs>(event)
                .map(|a| self.on_in_flight(a, PlacementState::Rebuilding)),
            LIVE_MIGRATION => parse_args::<InstanceArgs>(event)
                .map(|a| self.on_in_flight(a, PlacementState::Migrating)),
            INSTANCE_ACTIVE => parse_args::<InstanceArgs>(event).map(|a| self.on_active(a)),
            INSTANCE_DELETED => parse_args::<InstanceArgs>(event).map(|a| self.on_deleted(a)),
            COMPUTE_NODE_UPDATE => {
                parse_args::<ComputeNodeArgs>(event).map(|a| Ok(self.on_compute_node(a)))
            }
            other => {
                warn!(event_id = event.event_id, method = %other, "unknown event dropped");
                None
            }
        };
        Ok(outcome.transpose()?.unwrap_or(Outcome::Dropped))
    }

    /// Placement of an instance by uuid. A placement still under its
    /// planned key is moved to the uuid when the event names its stack.
    fn resolve_instance(&mut self, args: &InstanceArgs) -> EngineResult<Option<Placement>> {
        if let Some(placement) = self.placements.get_placement(&args.uuid)? {
            return Ok(Some(placement));
        }
        let (Some(stack_id), Some(orch_id)) = (args.stack_id.as_deref(), args.orch_id.as_deref())
        else {
            return Ok(None);
        };
        let key = Placement::planned_key(stack_id, orch_id);
        let Some(placement) = self.placements.rekey(&key, &args.uuid)? else {
            return Ok(None);
        };
        self.topology.update_vm_uuid(&key, &args.uuid);
        self.record_uuid(stack_id, orch_id, &args.uuid)?;
        Ok(Some(placement))
    }

    fn record_uuid(&mut self, stack_id: &str, orch_id: &str, uuid: &str) -> EngineResult<()> {
        let Some(mut record) = self.get_stack(stack_id)? else {
            return Ok(());
        };
        let Some(resource) = record.resources.get_mut(orch_id) else {
            return Ok(());
        };
        if resource.properties.uuid.as_deref() == Some(uuid) {
            return Ok(());
        }
        resource.properties.uuid = Some(uuid.to_string());
        record.updated_at = epoch_secs();
        self.put_stack(record)
    }

    fn set_state(&mut self, uuid: &str, state: PlacementState) -> EngineResult<()> {
        self.placements.update_placement(
            uuid,
            &PlacementUpdate {
                state: Some(state),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn on_build(&mut self, args: InstanceArgs) -> EngineResult<Outcome> {
        if let Some(placement) = self.resolve_instance(&args)? {
            let state = placement
                .state
                .map_or(PlacementState::Building, PlacementState::in_flight);
            self.set_state(&args.uuid, state)?;
            info!(uuid = %args.uuid, host = %placement.host, ?state, "instance building");
            return Ok(Outcome::Applied);
        }

        // No planned placement: backfill from the stack record.
        let (Some(stack_id), Some(orch_id)) = (args.stack_id.as_deref(), args.orch_id.as_deref())
        else {
            warn!(uuid = %args.uuid, "build event for an unknown instance dropped");
            return Ok(Outcome::Dropped);
        };
        let host = self
            .get_stack(stack_id)?
            .and_then(|r| r.resources.get(orch_id).and_then(|s| s.properties.host.clone()));
        let Some(host) = host else {
            warn!(uuid = %args.uuid, %stack_id, %orch_id, "build event without a decided host dropped");
            return Ok(Outcome::Dropped);
        };
        self.placements.insert_placement(Placement {
            uuid: args.uuid.clone(),
            stack_id: stack_id.to_string(),
            orch_id: orch_id.to_string(),
            host: host.clone(),
            state: Some(PlacementState::Building),
            original_host: None,
            verified: false,
            dirty: false,
            timestamp: 0,
        })?;
        self.topology
            .update_vm_uuid(&Placement::planned_key(stack_id, orch_id), &args.uuid);
        self.record_uuid(stack_id, orch_id, &args.uuid)?;
        info!(uuid = %args.uuid, %host, %stack_id, %orch_id, "placement backfilled from stack");
        Ok(Outcome::Applied)
    }

    /// Rebuild or live-migration started.
    fn on_in_flight(&mut self, args: InstanceArgs, state: PlacementState) -> EngineResult<Outcome> {
        if self.resolve_instance(&args)?.is_none() {
            warn!(uuid = %args.uuid, ?state, "event for an unknown instance dropped");
            return Ok(Outcome::Dropped);
        }
        self.set_state(&args.uuid, state)?;
        info!(uuid = %args.uuid, ?state, "instance in flight");
        Ok(Outcome::Applied)
    }

    fn on_active(&mut self, args: InstanceArgs) -> EngineResult<Outcome> {
        let Some(host) = args.host.clone() else {
            warn!(uuid = %args.uuid, "active event without a host dropped");
            return Ok(Outcome::Dropped);
        };
        if self.topology.host(&host).is_none() {
            warn!(uuid = %args.uuid, %host, "active event on an unknown host dropped");
            return Ok(Outcome::Dropped);
        }

        let Some(placement) = self.resolve_instance(&args)? else {
            return self.adopt(args, host);
        };
        if placement.host != host {
            self.correct_host(&placement, &args.uuid, &host)?;
        }
        let state = placement
            .state
            .map_or(PlacementState::Created, PlacementState::activated);
        self.placements.update_placement(
            &args.uuid,
            &PlacementUpdate {
                host: Some(host),
                state: Some(state),
                ..Default::default()
            },
        )?;
        Ok(Outcome::Applied)
    }

    /// Move a VM's accounting and stack record to the host it actually
    /// landed on.
    fn correct_host(&mut self, placement: &Placement, uuid: &str, host: &str) -> EngineResult<()> {
        self.placements.set_original_host(uuid, &placement.host)?;

        let key = Placement::planned_key(&placement.stack_id, &placement.orch_id);
        let found = self
            .topology
            .find_vm_by_uuid(uuid)
            .or_else(|| self.topology.find_vm(&key))
            .map(|(h, vm)| (h.to_string(), vm.vm.key()));
        match found {
            Some((old_host, vm_key)) => {
                if let Ok(Some(mut placed)) = self.topology.remove_vm_from_host(&old_host, &vm_key) {
                    placed.vm.uuid = Some(uuid.to_string());
                    if let Err(err) =
                        self.topology
                            .add_vm_to_host(host, placed.vm, placed.demand, placed.tags)
                    {
                        warn!(%uuid, %host, error = %err, "vm accounting lost during host correction");
                    }
                }
            }
            None => debug!(%uuid, "instance not accounted, nothing to move"),
        }

        if let Some(mut record) = self.get_stack(&placement.stack_id)? {
            if let Some(resource) = record.resources.get_mut(&placement.orch_id) {
                resource.properties.host = Some(host.to_string());
                record.updated_at = epoch_secs();
                self.put_stack(record)?;
            }
        }
        info!(%uuid, from = %placement.host, to = %host, "host corrected");
        Ok(())
    }

    /// Record an instance Valet did not place.
    fn adopt(&mut self, args: InstanceArgs, host: String) -> EngineResult<Outcome> {
        let placement = Placement {
            uuid: args.uuid.clone(),
            stack_id: args.stack_id.unwrap_or_default(),
            orch_id: args.orch_id.unwrap_or_else(|| args.uuid.clone()),
            host: host.clone(),
            state: Some(PlacementState::Created),
            original_host: None,
            verified: false,
            dirty: false,
            timestamp: 0,
        };
        self.placements.insert_placement(placement.clone())?;

        let demand = args
            .flavor
            .as_deref()
            .and_then(|f| self.topology.flavor(f))
            .map(|f| f.demand());
        if let Some(demand) = demand {
            if self.topology.find_vm_by_uuid(&args.uuid).is_none() {
                let vm = VmRef {
                    uuid: Some(args.uuid.clone()),
                    ..VmRef::new(&placement.stack_id, &placement.orch_id)
                };
                self.topology.add_vm_to_host(&host, vm, demand, Vec::new())?;
            }
        }
        info!(uuid = %args.uuid, %host, "untracked instance adopted");
        Ok(Outcome::Applied)
    }

    fn on_deleted(&mut self, args: InstanceArgs) -> EngineResult<Outcome> {
        let Some(placement) = self.resolve_instance(&args)? else {
            self.release(&args.uuid, None);
            debug!(uuid = %args.uuid, "delete for an unknown instance");
            return Ok(Outcome::Applied);
        };
        if let Some(state) = placement.state.filter(|s| !s.is_settled()) {
            info!(uuid = %args.uuid, ?state, "delete deferred while in flight");
            return Ok(Outcome::Deferred);
        }

        self.release(&args.uuid, Some(&placement));
        self.placements.delete_placement(&args.uuid)?;
        if let Some(mut record) = self.get_stack(&placement.stack_id)? {
            if let Some(resource) = record.resources.get_mut(&placement.orch_id) {
                resource.properties.host = None;
                resource.properties.uuid = None;
                record.updated_at = epoch_secs();
                self.put_stack(record)?;
            }
        }
        info!(uuid = %args.uuid, host = %placement.host, "placement deleted");
        Ok(Outcome::Applied)
    }

    /// Drop a VM from host and group accounting, if it is accounted.
    fn release(&mut self, uuid: &str, placement: Option<&Placement>) {
        let found = self
            .topology
            .find_vm_by_uuid(uuid)
            .or_else(|| {
                placement.and_then(|p| {
                    self.topology
                        .find_vm(&Placement::planned_key(&p.stack_id, &p.orch_id))
                })
            })
            .map(|(h, vm)| (h.to_string(), vm.vm.key()));
        if let Some((host, key)) = found {
            if let Err(err) = self.topology.remove_vm_from_host(&host, &key) {
                warn!(%uuid, %host, error = %err, "vm release failed");
            }
        }
    }

    fn on_compute_node(&mut self, args: ComputeNodeArgs) -> Outcome {
        match self.topology.update_host(&args.host, &args.update) {
            Ok(changed) => {
                debug!(host = %args.host, changed, "compute node updated");
                Outcome::Applied
            }
            Err(err) => {
                warn!(host = %args.host, error = %err, "compute node update dropped");
                Outcome::Dropped
            }
        }
    }
}
