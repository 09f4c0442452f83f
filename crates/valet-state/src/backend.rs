//! The narrow store interface the engine depends on.

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::*;

/// Keyed get/store/delete for everything the engine persists.
///
/// Implementations are assumed eventually consistent; callers never rely on
/// a write being visible to another reader immediately.
pub trait StateBackend: Send + Sync {
    fn get_placement(&self, uuid: &str) -> StateResult<Option<Placement>>;
    fn put_placement(&self, placement: &Placement) -> StateResult<()>;
    fn delete_placement(&self, uuid: &str) -> StateResult<bool>;

    fn get_stack(&self, stack_id: &str) -> StateResult<Option<StackRecord>>;
    fn put_stack(&self, stack: &StackRecord) -> StateResult<()>;

    fn list_events(&self, limit: usize) -> StateResult<Vec<EventRecord>>;
    fn delete_events(&self, event_ids: &[u64]) -> StateResult<u32>;

    fn put_resource_snapshot(&self, snapshot: &ResourceSnapshot) -> StateResult<()>;
}

impl StateBackend for StateStore {
    fn get_placement(&self, uuid: &str) -> StateResult<Option<Placement>> {
        StateStore::get_placement(self, uuid)
    }

    fn put_placement(&self, placement: &Placement) -> StateResult<()> {
        StateStore::put_placement(self, placement)
    }

    fn delete_placement(&self, uuid: &str) -> StateResult<bool> {
        StateStore::delete_placement(self, uuid)
    }

    fn get_stack(&self, stack_id: &str) -> StateResult<Option<StackRecord>> {
        StateStore::get_stack(self, stack_id)
    }

    fn put_stack(&self, stack: &StackRecord) -> StateResult<()> {
        StateStore::put_stack(self, stack)
    }

    fn list_events(&self, limit: usize) -> StateResult<Vec<EventRecord>> {
        StateStore::list_events(self, limit)
    }

    fn delete_events(&self, event_ids: &[u64]) -> StateResult<u32> {
        StateStore::delete_events(self, event_ids)
    }

    fn put_resource_snapshot(&self, snapshot: &ResourceSnapshot) -> StateResult<()> {
        StateStore::put_resource_snapshot(self, snapshot)
    }
}
