//! Resource model: hosts, host groups, flavors and membership groups.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use valet_state::{Capacity, HostState, HostStatus, Placement};

use crate::error::PlacementError;

// ── Levels and resource kinds ─────────────────────────────────────

/// Placement granularity, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Host,
    Rack,
    Cluster,
}

impl Level {
    /// Coarsest first, the order in which search walks the levels.
    pub const DESCENDING: [Level; 3] = [Level::Cluster, Level::Rack, Level::Host];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Host => "host",
            Level::Rack => "rack",
            Level::Cluster => "cluster",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Next finer level, if any.
    pub fn finer(self) -> Option<Level> {
        match self {
            Level::Host => None,
            Level::Rack => Some(Level::Host),
            Level::Cluster => Some(Level::Rack),
        }
    }

    /// Next coarser level, if any.
    pub fn coarser(self) -> Option<Level> {
        match self {
            Level::Host => Some(Level::Rack),
            Level::Rack => Some(Level::Cluster),
            Level::Cluster => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = PlacementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(Level::Host),
            "rack" => Ok(Level::Rack),
            "cluster" => Ok(Level::Cluster),
            _ => Err(PlacementError::InvalidLevel(s.to_string())),
        }
    }
}

/// The three resources a placement consumes, in tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cpu,
    Mem,
    Disk,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Cpu, ResourceKind::Mem, ResourceKind::Disk];

    /// The amount of this resource in `cap`.
    pub fn of(self, cap: &Capacity) -> u64 {
        match self {
            ResourceKind::Cpu => cap.vcpus,
            ResourceKind::Mem => cap.mem_mb,
            ResourceKind::Disk => cap.disk_gb,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Mem => "mem",
            ResourceKind::Disk => "disk",
        }
    }
}

// ── Groups ────────────────────────────────────────────────────────

/// Kind of membership group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GroupType {
    /// Availability zone, synced from infrastructure.
    #[serde(rename = "AZ")]
    Az,
    /// Host aggregate, synced from infrastructure.
    #[serde(rename = "AGGR")]
    Aggr,
    #[serde(rename = "EX")]
    Ex,
    #[serde(rename = "DIV")]
    Div,
    #[serde(rename = "AFF")]
    Aff,
}

impl GroupType {
    /// Parse a group type as written in an application request.
    pub fn from_request(s: &str) -> Result<Self, PlacementError> {
        match s.to_ascii_lowercase().as_str() {
            "affinity" | "aff" => Ok(GroupType::Aff),
            "diversity" | "div" => Ok(GroupType::Div),
            "exclusivity" | "ex" => Ok(GroupType::Ex),
            _ => Err(PlacementError::UnknownGroupType(s.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GroupType::Az => "AZ",
            GroupType::Aggr => "AGGR",
            GroupType::Ex => "EX",
            GroupType::Div => "DIV",
            GroupType::Aff => "AFF",
        }
    }

    /// Groups created and destroyed by application requests.
    pub fn is_app_group(self) -> bool {
        matches!(self, GroupType::Ex | GroupType::Div | GroupType::Aff)
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A membership group tracked by the topology.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub group_type: GroupType,
    /// Level at which memberships are recorded (always host for AZ/AGGR).
    pub level: Level,
    pub metadata: BTreeMap<String, String>,
    /// Member hosts of an AZ or aggregate.
    pub hosts: BTreeSet<String>,
    /// Resource name at `level` → keys of member VMs placed under it.
    pub vms_per_resource: BTreeMap<String, BTreeSet<String>>,
    pub last_update: u64,
}

impl Group {
    pub fn new(name: &str, group_type: GroupType, level: Level) -> Self {
        Self {
            name: name.to_string(),
            group_type,
            level,
            metadata: BTreeMap::new(),
            hosts: BTreeSet::new(),
            vms_per_resource: BTreeMap::new(),
            last_update: 0,
        }
    }

    pub fn vm_list(&self) -> BTreeSet<&str> {
        self.vms_per_resource
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

/// A group membership a VM brings to the resource it lands on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MembershipTag {
    pub name: String,
    pub group_type: GroupType,
    pub level: Level,
}

// ── Flavors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub vcpus: u64,
    pub mem_mb: u64,
    /// Root disk plus ephemeral plus swap, in GB.
    pub disk_gb: u64,
    pub extra_specs: BTreeMap<String, String>,
    pub enabled: bool,
}

impl Flavor {
    pub fn demand(&self) -> Capacity {
        Capacity::new(self.vcpus, self.mem_mb, self.disk_gb)
    }
}

// ── Hosts ─────────────────────────────────────────────────────────

/// Identity of a VM as known to the topology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VmRef {
    pub stack_id: String,
    pub orch_id: String,
    pub uuid: Option<String>,
}

impl VmRef {
    pub fn new(stack_id: &str, orch_id: &str) -> Self {
        Self {
            stack_id: stack_id.to_string(),
            orch_id: orch_id.to_string(),
            uuid: None,
        }
    }

    /// Stable key, independent of whether the uuid is known yet.
    pub fn key(&self) -> String {
        Placement::planned_key(&self.stack_id, &self.orch_id)
    }
}

/// A VM accounted on a host.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedVm {
    pub vm: VmRef,
    pub demand: Capacity,
    pub tags: Vec<MembershipTag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub status: HostStatus,
    pub state: HostState,
    /// Raw capacity reported by the infrastructure.
    pub original: Capacity,
    /// Capacity after overcommit and standby.
    pub capacity: Capacity,
    pub used: Capacity,
    pub memberships: BTreeSet<String>,
    /// VM key → accounted VM.
    pub vm_list: BTreeMap<String, PlacedVm>,
    /// Rack name.
    pub parent: String,
    pub last_update: u64,
}

impl Host {
    pub fn avail(&self) -> Capacity {
        self.capacity.saturating_sub(&self.used)
    }

    /// Enabled and up; only usable hosts take new VMs.
    pub fn is_usable(&self) -> bool {
        self.status == HostStatus::Enabled && self.state == HostState::Up
    }
}

/// A rack or cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct HostGroup {
    pub name: String,
    pub level: Level,
    /// Cluster of a rack; `None` for a cluster.
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
    pub capacity: Capacity,
    pub used: Capacity,
    pub memberships: BTreeSet<String>,
    pub last_update: u64,
}

impl HostGroup {
    pub fn new(name: &str, level: Level, parent: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            level,
            parent,
            children: BTreeSet::new(),
            capacity: Capacity::ZERO,
            used: Capacity::ZERO,
            memberships: BTreeSet::new(),
            last_update: 0,
        }
    }

    pub fn avail(&self) -> Capacity {
        self.capacity.saturating_sub(&self.used)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datacenter {
    pub name: String,
    pub capacity: Capacity,
    pub used: Capacity,
    /// Cluster names.
    pub children: BTreeSet<String>,
    pub last_update: u64,
}

impl Datacenter {
    pub fn avail(&self) -> Capacity {
        self.capacity.saturating_sub(&self.used)
    }
}

/// Field changes carried by a compute-node event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HostUpdate {
    #[serde(default)]
    pub vcpus: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub local_gb: Option<u64>,
    #[serde(default)]
    pub status: Option<HostStatus>,
    #[serde(default)]
    pub state: Option<HostState>,
}
