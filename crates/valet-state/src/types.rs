//! Record types for the Valet state store.
//!
//! These types represent placements, stack records, queued infrastructure
//! events, inventory records delivered by the infrastructure collaborator,
//! and resource-status snapshots. All types are serializable to/from JSON
//! for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a deployed stack (one application request scope).
pub type StackId = String;

/// Request-scoped identifier of a resource inside a stack.
pub type OrchId = String;

/// Heat resource type of a server.
pub const SERVER_TYPE: &str = "OS::Nova::Server";

/// Seconds since the Unix epoch, used for every record timestamp.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Capacity ──────────────────────────────────────────────────────

/// An amount of the three placement resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capacity {
    pub vcpus: u64,
    pub mem_mb: u64,
    pub disk_gb: u64,
}

impl Capacity {
    pub const ZERO: Capacity = Capacity {
        vcpus: 0,
        mem_mb: 0,
        disk_gb: 0,
    };

    pub fn new(vcpus: u64, mem_mb: u64, disk_gb: u64) -> Self {
        Self {
            vcpus,
            mem_mb,
            disk_gb,
        }
    }

    /// True if `demand` fits in `self` on every resource.
    pub fn fits(&self, demand: &Capacity) -> bool {
        self.vcpus >= demand.vcpus && self.mem_mb >= demand.mem_mb && self.disk_gb >= demand.disk_gb
    }

    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            vcpus: self.vcpus.saturating_sub(other.vcpus),
            mem_mb: self.mem_mb.saturating_sub(other.mem_mb),
            disk_gb: self.disk_gb.saturating_sub(other.disk_gb),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Add for Capacity {
    type Output = Capacity;

    fn add(self, other: Capacity) -> Capacity {
        Capacity {
            vcpus: self.vcpus + other.vcpus,
            mem_mb: self.mem_mb + other.mem_mb,
            disk_gb: self.disk_gb + other.disk_gb,
        }
    }
}

impl AddAssign for Capacity {
    fn add_assign(&mut self, other: Capacity) {
        *self = *self + other;
    }
}

impl Sum for Capacity {
    fn sum<I: Iterator<Item = Capacity>>(iter: I) -> Capacity {
        iter.fold(Capacity::ZERO, Add::add)
    }
}

// ── Placement ─────────────────────────────────────────────────────

/// Lifecycle tag of a placement.
///
/// `planned → planning → building → created` for new servers;
/// `rebuild → rebuilding → rebuilt` and `migrate → migrating → migrated`
/// for servers re-planned after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementState {
    Planned,
    Planning,
    Building,
    Created,
    Rebuild,
    Rebuilding,
    Rebuilt,
    Migrate,
    Migrating,
    Migrated,
}

impl PlacementState {
    /// Terminal states in which a server may be forgotten on deletion.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Created | Self::Rebuilt | Self::Migrated)
    }

    /// State after the hypervisor starts acting on the decision.
    pub fn in_flight(self) -> PlacementState {
        match self {
            Self::Planned | Self::Planning => Self::Building,
            Self::Rebuild => Self::Rebuilding,
            Self::Migrate => Self::Migrating,
            other => other,
        }
    }

    /// State after the server is reported active.
    pub fn activated(self) -> PlacementState {
        match self {
            Self::Planned | Self::Planning | Self::Building | Self::Created => Self::Created,
            Self::Rebuild | Self::Rebuilding | Self::Rebuilt => Self::Rebuilt,
            Self::Migrate | Self::Migrating | Self::Migrated => Self::Migrated,
        }
    }
}

/// The recorded host decision for one server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Placement {
    /// Physical uuid, or [`Placement::planned_key`] until the uuid is known.
    pub uuid: String,
    pub stack_id: StackId,
    pub orch_id: OrchId,
    pub host: String,
    pub state: Option<PlacementState>,
    /// Host held before the last migration or rebuild.
    pub original_host: Option<String>,
    pub verified: bool,
    /// Set when a field changed since the last verification.
    #[serde(default)]
    pub dirty: bool,
    /// Unix timestamp (seconds) of the last field change.
    pub timestamp: u64,
}

impl Placement {
    /// Key of a placement whose physical uuid is not yet known.
    pub fn planned_key(stack_id: &str, orch_id: &str) -> String {
        format!("{stack_id}:{orch_id}")
    }

    /// Build the key for the placements table.
    pub fn table_key(&self) -> &str {
        &self.uuid
    }
}

// ── Stack ─────────────────────────────────────────────────────────

/// One resource entry of a stack template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackResource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: ServerProperties,
}

impl StackResource {
    pub fn server(name: &str, flavor: &str) -> Self {
        Self {
            kind: SERVER_TYPE.to_string(),
            name: name.to_string(),
            properties: ServerProperties {
                flavor: flavor.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn is_server(&self) -> bool {
        self.kind == SERVER_TYPE
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerProperties {
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Decided host, filled in once a placement exists.
    #[serde(default)]
    pub host: Option<String>,
    /// Physical uuid, filled in once the server is built.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A grouping declaration: affinity, diversity or exclusivity over members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSpec {
    /// `affinity`, `diversity` or `exclusivity` (also `AFF`/`DIV`/`EX`).
    #[serde(rename = "type")]
    pub group_type: String,
    /// `host`, `rack` or `cluster`.
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Orch ids of member servers or nested groups.
    #[serde(default)]
    pub members: Vec<OrchId>,
}

/// Persisted application request: the resource map and group map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackRecord {
    pub stack_id: StackId,
    pub resources: BTreeMap<OrchId, StackResource>,
    pub groups: BTreeMap<OrchId, GroupSpec>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl StackRecord {
    /// Build the key for the stacks table.
    pub fn table_key(&self) -> &str {
        &self.stack_id
    }

    /// Find the server resource carrying a physical uuid.
    pub fn find_by_uuid(&self, uuid: &str) -> Option<(&OrchId, &StackResource)> {
        self.resources
            .iter()
            .find(|(_, r)| r.properties.uuid.as_deref() == Some(uuid))
    }
}

// ── Event ─────────────────────────────────────────────────────────

/// An infrastructure notification waiting to be reconciled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: u64,
    pub exchange: String,
    pub method: String,
    pub args: serde_json::Value,
}

impl EventRecord {
    /// Build the key for the events table. Zero padding keeps id order.
    pub fn table_key(&self) -> String {
        event_key(self.event_id)
    }
}

pub fn event_key(event_id: u64) -> String {
    format!("{event_id:020}")
}

// ── Inventory ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    #[default]
    Up,
    Down,
}

/// A compute host as reported by the infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInventory {
    pub name: String,
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default)]
    pub state: HostState,
    pub vcpus: u64,
    pub memory_mb: u64,
    pub local_gb: u64,
}

/// A flavor as reported by the infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlavorInventory {
    pub id: String,
    pub name: String,
    pub vcpus: u64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    #[serde(default)]
    pub ephemeral_gb: u64,
    #[serde(default)]
    pub swap_mb: u64,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    AvailabilityZone,
    Aggregate,
}

/// An availability zone or host aggregate with its member hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateInventory {
    pub name: String,
    pub kind: AggregateKind,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

// ── Resource snapshot ─────────────────────────────────────────────

/// Point-in-time copy of the resource topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    pub datacenter: String,
    pub capacity: Capacity,
    pub used: Capacity,
    pub hosts: Vec<HostSnapshot>,
    pub host_groups: Vec<HostGroupSnapshot>,
    pub groups: Vec<GroupSnapshot>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSnapshot {
    pub name: String,
    pub parent: String,
    pub status: HostStatus,
    pub state: HostState,
    pub original: Capacity,
    pub capacity: Capacity,
    pub used: Capacity,
    pub memberships: Vec<String>,
    pub vms: Vec<String>,
    pub last_update: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostGroupSnapshot {
    pub name: String,
    pub level: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub capacity: Capacity,
    pub used: Capacity,
    pub memberships: Vec<String>,
    pub last_update: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSnapshot {
    pub name: String,
    pub group_type: String,
    pub level: String,
    pub metadata: BTreeMap<String, String>,
    pub vms: Vec<String>,
    pub last_update: u64,
}

impl ResourceSnapshot {
    /// Build the key for the resources table.
    pub fn table_key(&self) -> &str {
        &self.datacenter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_fits_componentwise() {
        let avail = Capacity::new(4, 4096, 40);
        assert!(avail.fits(&Capacity::new(4, 4096, 40)));
        assert!(!avail.fits(&Capacity::new(5, 1, 1)));
        assert!(!avail.fits(&Capacity::new(1, 1, 41)));
    }

    #[test]
    fn capacity_sub_never_underflows() {
        let a = Capacity::new(1, 100, 10);
        let b = Capacity::new(2, 50, 20);
        assert_eq!(a.saturating_sub(&b), Capacity::new(0, 50, 0));
    }

    #[test]
    fn state_transitions() {
        assert_eq!(PlacementState::Planned.in_flight(), PlacementState::Building);
        assert_eq!(PlacementState::Migrate.in_flight(), PlacementState::Migrating);
        assert_eq!(PlacementState::Created.in_flight(), PlacementState::Created);
        assert_eq!(PlacementState::Building.activated(), PlacementState::Created);
        assert_eq!(PlacementState::Rebuild.activated(), PlacementState::Rebuilt);
        assert_eq!(PlacementState::Migrating.activated(), PlacementState::Migrated);
        assert!(PlacementState::Migrated.is_settled());
        assert!(!PlacementState::Migrating.is_settled());
    }

    #[test]
    fn event_keys_sort_by_id() {
        assert!(event_key(9) < event_key(10));
        assert!(event_key(99) < event_key(100_000));
    }

    #[test]
    fn group_spec_accepts_heat_style_type_field() {
        let json = r#"{"type": "affinity", "level": "host", "members": ["a", "b"]}"#;
        let spec: GroupSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.group_type, "affinity");
        assert_eq!(spec.level.as_deref(), Some("host"));
        assert!(spec.name.is_none());
        assert_eq!(spec.members.len(), 2);
    }
}
