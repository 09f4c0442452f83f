//! Engine error types.

use thiserror::Error;
use valet_placement::{PlacementError, TopologyError};
use valet_state::StateError;

/// Errors returned by request handling, event reconciliation and inventory
/// refresh.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request was malformed or could not be placed. Terminal for that
    /// request; nothing was changed.
    #[error("{0}")]
    Rejected(#[from] PlacementError),

    #[error("no record for stack = {0}")]
    NoRecord(String),

    #[error("no target vm found for {0}")]
    NoTarget(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("resource accounting failed: {0}")]
    Topology(#[from] TopologyError),

    /// Store I/O failed; the caller may retry.
    #[error("infrastructure unavailable: {0}")]
    Unavailable(#[from] StateError),

    /// The inventory collaborator failed; the caller may retry.
    #[error("inventory unavailable: {0}")]
    Inventory(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Inventory(_))
    }

    /// Status string reported to the caller.
    pub fn status(&self) -> String {
        self.to_string()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use valet_placement::Level;

    #[test]
    fn rejection_keeps_placement_status() {
        let err = EngineError::from(PlacementError::GroupingScope);
        assert_eq!(err.status(), "grouping scope: nested group's level is higher");
        assert!(!err.is_retryable());

        let err = EngineError::from(PlacementError::NoCandidate {
            orch_id: "vm-1".into(),
            level: Level::Host,
            filter: "cpu",
        });
        assert!(err.status().contains("vm-1"));
    }

    #[test]
    fn store_failures_are_retryable() {
        let err = EngineError::from(StateError::Transaction("timeout".into()));
        assert!(err.is_retryable());
        assert_eq!(err.status(), "infrastructure unavailable: store unavailable: timeout");
        assert_eq!(
            EngineError::NoTarget("replan".into()).status(),
            "no target vm found for replan"
        );
    }
}
