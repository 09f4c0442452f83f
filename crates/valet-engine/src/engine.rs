//! Shared engine state behind one coarse lock.
//!
//! [`EngineState`] owns the resource topology and every cache. [`Engine`]
//! wraps it in a single `tokio::sync::Mutex`, held for the whole of one
//! request, one event batch, or the apply step of an inventory refresh, so
//! searches never observe a half-applied mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use valet_core::ValetConfig;
use valet_placement::{FilterPipeline, ResourceTopology};
use valet_state::{
    OrchId, Placement, ResourceSnapshot, StackId, StackRecord, StateBackend,
};

use crate::cache::{LruCache, PlacementCache};
use crate::error::EngineResult;
use crate::handler::{AppRequest, AppResponse};
use crate::inventory::{Inventory, InventoryDump};
use crate::reconciler::BatchReport;

pub struct EngineState {
    pub(crate) topology: ResourceTopology,
    pub(crate) placements: PlacementCache,
    /// Stack records, write-through like placements.
    pub(crate) stacks: LruCache<StackId, StackRecord>,
    /// Request id → decided hosts, so a repeated request is answered from
    /// history instead of being placed again.
    pub(crate) decisions: LruCache<String, BTreeMap<OrchId, String>>,
    pub(crate) pipeline: FilterPipeline,
    pub(crate) store: Arc<dyn StateBackend>,
    pub(crate) event_batch_size: usize,
}

impl EngineState {
    pub fn new(config: &ValetConfig, store: Arc<dyn StateBackend>) -> Self {
        let engine = &config.engine;
        Self {
            topology: ResourceTopology::new(&engine.datacenter, config.overcommit),
            placements: PlacementCache::new(store.clone(), engine.max_cache, engine.min_cache),
            stacks: LruCache::new(engine.max_app_cache, engine.min_app_cache),
            decisions: LruCache::new(engine.max_decision_cache, engine.min_decision_cache),
            pipeline: FilterPipeline::standard(),
            store,
            event_batch_size: engine.event_batch_size,
        }
    }

    pub fn topology(&self) -> &ResourceTopology {
        &self.topology
    }

    pub fn placements(&mut self) -> &mut PlacementCache {
        &mut self.placements
    }

    /// Stack record from the cache, loading it from the store on a miss.
    pub fn get_stack(&mut self, stack_id: &str) -> EngineResult<Option<StackRecord>> {
        if let Some(record) = self.stacks.get(stack_id) {
            return Ok(Some(record.clone()));
        }
        let loaded = self.store.get_stack(stack_id)?;
        if let Some(record) = &loaded {
            self.stacks.insert(stack_id.to_string(), record.clone());
        }
        Ok(loaded)
    }

    pub(crate) fn put_stack(&mut self, record: StackRecord) -> EngineResult<()> {
        self.store.put_stack(&record)?;
        self.stacks.insert(record.stack_id.clone(), record);
        Ok(())
    }

    /// Apply the watermark policy to every cache.
    pub fn flush_caches(&mut self) {
        self.placements.flush_cache();
        let stacks = self.stacks.evict(|_| true);
        let decisions = self.decisions.evict(|_| true);
        if stacks + decisions > 0 {
            debug!(stacks, decisions, "stack and decision caches flushed");
        }
    }
}

/// Cloneable handle to the shared engine state.
#[derive(Clone)]
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
}

impl Engine {
    pub fn new(config: &ValetConfig, store: Arc<dyn StateBackend>) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::new(config, store))),
        }
    }

    /// Take the engine lock.
    pub async fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().await
    }

    /// Handle one application request.
    pub async fn handle(&self, request: &AppRequest) -> EngineResult<AppResponse> {
        let mut state = self.state.lock().await;
        let result = state.handle_request(request);
        state.flush_caches();
        result
    }

    /// Apply one batch of queued infrastructure events.
    pub async fn process_events(&self) -> EngineResult<BatchReport> {
        let mut state = self.state.lock().await;
        state.process_events()
    }

    /// Pull inventory outside the lock, then reconcile it inside.
    ///
    /// Returns true when the topology changed.
    pub async fn refresh_inventory(&self, inventory: &dyn Inventory) -> EngineResult<bool> {
        let dump = InventoryDump::fetch(inventory).await?;
        let mut state = self.state.lock().await;
        state.apply_inventory(&dump)
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        self.state.lock().await.topology.snapshot()
    }

    pub async fn placement(&self, uuid: &str) -> EngineResult<Option<Placement>> {
        self.state.lock().await.placements.get_placement(uuid)
    }
}
