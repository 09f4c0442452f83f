//! valet-placement — decides a host for every VM of a request.
//!
//! Nothing here does I/O. The engine owns a [`ResourceTopology`], feeds it
//! inventory and events, and runs [`parse`] then [`LevelSearch::place`] for
//! each request.
//!
//! # Components
//!
//! - **`topology`**: Datacenter → cluster → rack → host model with flavor
//!   and membership group catalogs
//! - **`parser`**: ConstraintMerger, turning flat resource/group maps
//!   into the VM/VGroup tree in **`app`**
//! - **`filters`**: The ordered candidate filter chain
//! - **`search`**: Greedy coarse-to-fine search over an **`avail`** view
//! - **`convert`**: Conversions from inventory records

pub mod app;
pub mod avail;
pub mod convert;
pub mod error;
pub mod filters;
pub mod parser;
pub mod resource;
pub mod search;
pub mod topology;

pub use app::{AppTopology, GroupTag, NodeId, NodeRef, VGroup, Vm};
pub use avail::{AvailResource, AvailResources, PlacedNodes};
pub use error::{PlacementError, PlacementResult, TopologyError, TopologyResult};
pub use filters::{Filter, FilterContext, FilterPipeline};
pub use parser::parse;
pub use resource::{
    Flavor, Group, GroupType, Host, HostGroup, HostUpdate, Level, MembershipTag, PlacedVm,
    ResourceKind, VmRef,
};
pub use search::{LevelSearch, Priority};
pub use topology::ResourceTopology;
