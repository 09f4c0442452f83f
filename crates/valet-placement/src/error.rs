//! Placement error types.
//!
//! [`PlacementError`] is the failure channel for parsing and search. Its
//! `Display` text is the status string handed back to callers, who branch
//! on the variant rather than on exceptions.

use thiserror::Error;

use crate::resource::{GroupType, Level};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlacementError {
    #[error("unknown group type = {0}")]
    UnknownGroupType(String),

    #[error("missing {field} in group = {orch_id}")]
    MissingField {
        orch_id: String,
        field: &'static str,
    },

    #[error("invalid level = {0}")]
    InvalidLevel(String),

    #[error("invalid resource = {0}")]
    DanglingReference(String),

    #[error("cyclic grouping = {0}")]
    CyclicGroup(String),

    #[error("grouping scope: nested group's level is higher")]
    GroupingScope,

    #[error("{inner} not allowed to be nested in {outer} group")]
    NestedGroup { inner: GroupType, outer: &'static str },

    #[error("{affinity} co-locates members of diversity group {diversity}")]
    ConflictingGroups { affinity: String, diversity: String },

    #[error("unknown flavor = {0}")]
    UnknownFlavor(String),

    #[error("no servers in request")]
    EmptyRequest,

    #[error("no available resource for {orch_id} at {level} ({filter})")]
    NoCandidate {
        orch_id: String,
        level: Level,
        filter: &'static str,
    },
}

impl PlacementError {
    /// Status string reported for a rejected request.
    pub fn status(&self) -> String {
        self.to_string()
    }

    /// Search failures, as opposed to malformed requests.
    pub fn is_search_failure(&self) -> bool {
        matches!(self, Self::NoCandidate { .. })
    }
}

pub type PlacementResult<T> = Result<T, PlacementError>;

/// Errors from resource topology bookkeeping.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TopologyError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("unknown {level}: {name}")]
    UnknownResource { level: Level, name: String },
}

pub type TopologyResult<T> = Result<T, TopologyError>;
