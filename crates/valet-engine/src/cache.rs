//! Engine caches: a two-watermark LRU and the write-through placement cache.
//!
//! Every cache here follows the same policy. Nothing is evicted until the
//! cache grows past its high watermark; a flush then drops the least
//! recently used evictable entries until the low watermark is reached.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;
use valet_state::{Placement, PlacementState, StateBackend, epoch_secs};

use crate::error::EngineResult;

// ── LruCache ──────────────────────────────────────────────────────

/// Least-recently-used map with batch eviction between two watermarks.
///
/// Access order is kept in a tick-ordered index, so touching and evicting
/// an entry are both logarithmic.
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: HashMap<K, (u64, V)>,
    order: BTreeMap<u64, K>,
    tick: u64,
    max: usize,
    min: usize,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    pub fn new(max: usize, min: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            max,
            min,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up an entry and mark it most recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.0);
        entry.0 = tick;
        self.order.insert(tick, key.to_owned());
        Some(&entry.1)
    }

    /// Look up an entry without touching it.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry as most recently used.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        let previous = self.entries.insert(key, (tick, value))?;
        self.order.remove(&previous.0);
        Some(previous.1)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (tick, value) = self.entries.remove(key)?;
        self.order.remove(&tick);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict down to the low watermark once the high watermark is passed.
    ///
    /// Entries for which `evictable` is false are skipped, so the cache may
    /// stay above the low watermark. Returns the number of evicted entries.
    pub fn evict(&mut self, evictable: impl Fn(&V) -> bool) -> usize {
        if self.entries.len() <= self.max {
            return 0;
        }
        let excess = self.entries.len() - self.min;
        let victims: Vec<u64> = self
            .order
            .iter()
            .filter(|(_, key)| self.entries.get(*key).is_some_and(|(_, v)| evictable(v)))
            .map(|(tick, _)| *tick)
            .take(excess)
            .collect();
        for tick in &victims {
            if let Some(key) = self.order.remove(tick) {
                self.entries.remove(&key);
            }
        }
        victims.len()
    }
}

// ── PlacementCache ────────────────────────────────────────────────

/// Field changes applied by [`PlacementCache::update_placement`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlacementUpdate {
    pub host: Option<String>,
    pub state: Option<PlacementState>,
    pub stack_id: Option<String>,
    pub orch_id: Option<String>,
}

/// Write-through cache of placements keyed by uuid.
///
/// A cached `None` records that the store has no placement for the key, so
/// repeated misses do not reach the store. Every mutation is written to the
/// store before the cached copy changes.
pub struct PlacementCache {
    store: Arc<dyn StateBackend>,
    entries: LruCache<String, Option<Placement>>,
}

impl PlacementCache {
    pub fn new(store: Arc<dyn StateBackend>, max: usize, min: usize) -> Self {
        Self {
            store,
            entries: LruCache::new(max, min),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached entry, without loading or touching.
    pub fn peek(&self, uuid: &str) -> Option<&Option<Placement>> {
        self.entries.peek(uuid)
    }

    pub fn get_placement(&mut self, uuid: &str) -> EngineResult<Option<Placement>> {
        if let Some(cached) = self.entries.get(uuid) {
            return Ok(cached.clone());
        }
        let loaded = self.store.get_placement(uuid)?;
        self.entries.insert(uuid.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub fn insert_placement(&mut self, mut placement: Placement) -> EngineResult<()> {
        placement.timestamp = epoch_secs();
        self.store.put_placement(&placement)?;
        self.entries.insert(placement.uuid.clone(), Some(placement));
        Ok(())
    }

    /// Apply `change` to a copy of the placement; persist and cache it if
    /// anything changed. Returns false when the placement is unknown or
    /// already matched.
    fn modify(
        &mut self,
        uuid: &str,
        change: impl FnOnce(&mut Placement) -> bool,
    ) -> EngineResult<bool> {
        let Some(mut placement) = self.get_placement(uuid)? else {
            return Ok(false);
        };
        if !change(&mut placement) {
            return Ok(false);
        }
        placement.timestamp = epoch_secs();
        self.store.put_placement(&placement)?;
        self.entries.insert(uuid.to_string(), Some(placement));
        Ok(true)
    }

    /// Apply only the fields that differ; any change marks the entry dirty.
    pub fn update_placement(&mut self, uuid: &str, update: &PlacementUpdate) -> EngineResult<bool> {
        self.modify(uuid, |p| {
            let mut changed = false;
            if let Some(host) = &update.host {
                if p.host != *host {
                    p.host = host.clone();
                    changed = true;
                }
            }
            if let Some(state) = update.state {
                if p.state != Some(state) {
                    p.state = Some(state);
                    changed = true;
                }
            }
            if let Some(stack_id) = &update.stack_id {
                if p.stack_id != *stack_id {
                    p.stack_id = stack_id.clone();
                    changed = true;
                }
            }
            if let Some(orch_id) = &update.orch_id {
                if p.orch_id != *orch_id {
                    p.orch_id = orch_id.clone();
                    changed = true;
                }
            }
            if changed {
                p.dirty = true;
            }
            changed
        })
    }

    /// Remember the host held before a migration or rebuild.
    pub fn set_original_host(&mut self, uuid: &str, host: &str) -> EngineResult<bool> {
        self.modify(uuid, |p| {
            if p.original_host.as_deref() == Some(host) {
                return false;
            }
            p.original_host = Some(host.to_string());
            true
        })
    }

    pub fn set_verified(&mut self, uuid: &str) -> EngineResult<bool> {
        self.modify(uuid, |p| {
            if p.verified && !p.dirty {
                return false;
            }
            p.verified = true;
            p.dirty = false;
            true
        })
    }

    pub fn set_unverified(&mut self, uuid: &str) -> EngineResult<bool> {
        self.modify(uuid, |p| {
            if !p.verified {
                return false;
            }
            p.verified = false;
            true
        })
    }

    /// Delete a placement; the key is then cached as absent.
    pub fn delete_placement(&mut self, uuid: &str) -> EngineResult<bool> {
        let deleted = self.store.delete_placement(uuid)?;
        self.entries.insert(uuid.to_string(), None);
        Ok(deleted)
    }

    /// Move a placement to a new key, once its physical uuid is known.
    pub fn rekey(&mut self, from: &str, to: &str) -> EngineResult<Option<Placement>> {
        let Some(mut placement) = self.get_placement(from)? else {
            return Ok(None);
        };
        placement.uuid = to.to_string();
        placement.timestamp = epoch_secs();
        self.store.put_placement(&placement)?;
        self.store.delete_placement(from)?;
        self.entries.insert(from.to_string(), None);
        self.entries.insert(to.to_string(), Some(placement.clone()));
        Ok(Some(placement))
    }

    /// Evict clean entries once the high watermark is passed.
    pub fn flush_cache(&mut self) -> usize {
        let evicted = self
            .entries
            .evict(|entry| entry.as_ref().is_none_or(|p| !p.dirty));
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "placement cache flushed");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_state::StateStore;

    fn placement(uuid: &str, host: &str) -> Placement {
        Placement {
            uuid: uuid.to_string(),
            stack_id: "s1".to_string(),
            orch_id: uuid.to_string(),
            host: host.to_string(),
            state: Some(PlacementState::Planned),
            original_host: None,
            verified: false,
            dirty: false,
            timestamp: 0,
        }
    }

    fn cache(max: usize, min: usize) -> (PlacementCache, Arc<StateStore>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        (PlacementCache::new(store.clone(), max, min), store)
    }

    #[test]
    fn lru_evicts_least_recent_to_low_watermark() {
        let mut lru = LruCache::new(4, 2);
        for i in 0..4 {
            lru.insert(format!("k{i}"), i);
        }
        assert_eq!(lru.evict(|_| true), 0);

        lru.get("k0");
        lru.insert("k4".to_string(), 4);
        assert_eq!(lru.evict(|_| true), 3);
        assert_eq!(lru.len(), 2);
        assert!(lru.contains_key("k0"));
        assert!(lru.contains_key("k4"));
    }

    #[test]
    fn lru_replace_keeps_single_entry() {
        let mut lru = LruCache::new(10, 5);
        assert_eq!(lru.insert("a".to_string(), 1), None);
        assert_eq!(lru.insert("a".to_string(), 2), Some(1));
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.peek("a"), Some(&2));
        assert_eq!(lru.remove("a"), Some(2));
        assert!(lru.is_empty());
    }

    #[test]
    fn miss_is_cached_as_absent() {
        let (mut cache, store) = cache(10, 5);
        assert_eq!(cache.get_placement("nope").unwrap(), None);
        assert_eq!(cache.peek("nope"), Some(&None));

        // A later store write is not seen until the sentinel is replaced.
        store.put_placement(&placement("nope", "h1")).unwrap();
        assert_eq!(cache.get_placement("nope").unwrap(), None);
    }

    #[test]
    fn writes_go_through_to_the_store() {
        let (mut cache, store) = cache(10, 5);
        cache.insert_placement(placement("u1", "h1")).unwrap();
        assert_eq!(store.get_placement("u1").unwrap().unwrap().host, "h1");

        let update = PlacementUpdate {
            host: Some("h2".into()),
            ..Default::default()
        };
        assert!(cache.update_placement("u1", &update).unwrap());
        let stored = store.get_placement("u1").unwrap().unwrap();
        assert_eq!(stored.host, "h2");
        assert!(stored.dirty);
    }

    #[test]
    fn update_only_counts_real_changes() {
        let (mut cache, _) = cache(10, 5);
        cache.insert_placement(placement("u1", "h1")).unwrap();
        let same = PlacementUpdate {
            host: Some("h1".into()),
            state: Some(PlacementState::Planned),
            ..Default::default()
        };
        assert!(!cache.update_placement("u1", &same).unwrap());
        assert!(!cache.get_placement("u1").unwrap().unwrap().dirty);
        assert!(!cache.update_placement("missing", &same).unwrap());
    }

    #[test]
    fn verify_clears_dirty() {
        let (mut cache, _) = cache(10, 5);
        cache.insert_placement(placement("u1", "h1")).unwrap();
        cache
            .update_placement(
                "u1",
                &PlacementUpdate {
                    state: Some(PlacementState::Building),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cache.set_verified("u1").unwrap());
        let p = cache.get_placement("u1").unwrap().unwrap();
        assert!(p.verified && !p.dirty);
        assert!(cache.set_unverified("u1").unwrap());
        assert!(!cache.get_placement("u1").unwrap().unwrap().verified);
    }

    #[test]
    fn original_host_is_kept_separately() {
        let (mut cache, _) = cache(10, 5);
        cache.insert_placement(placement("u1", "h1")).unwrap();
        assert!(cache.set_original_host("u1", "h1").unwrap());
        assert!(!cache.set_original_host("u1", "h1").unwrap());
        let p = cache.get_placement("u1").unwrap().unwrap();
        assert_eq!(p.original_host.as_deref(), Some("h1"));
        assert_eq!(p.host, "h1");
    }

    #[test]
    fn rekey_moves_the_record() {
        let (mut cache, store) = cache(10, 5);
        cache.insert_placement(placement("s1:vm", "h1")).unwrap();
        let moved = cache.rekey("s1:vm", "uuid-1").unwrap().unwrap();
        assert_eq!(moved.uuid, "uuid-1");
        assert_eq!(store.get_placement("s1:vm").unwrap(), None);
        assert_eq!(cache.get_placement("uuid-1").unwrap().unwrap().host, "h1");
        assert_eq!(cache.get_placement("s1:vm").unwrap(), None);
    }

    #[test]
    fn flush_respects_watermarks_and_dirty_entries() {
        let (mut cache, _) = cache(6, 3);
        // The two oldest entries are dirty and must survive.
        for uuid in ["u0", "u1"] {
            cache.insert_placement(placement(uuid, "h1")).unwrap();
            cache
                .update_placement(
                    uuid,
                    &PlacementUpdate {
                        host: Some("h2".into()),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        for i in 2..7 {
            cache.insert_placement(placement(&format!("u{i}"), "h1")).unwrap();
        }
        assert_eq!(cache.len(), 7);
        assert_eq!(cache.flush_cache(), 4);
        assert_eq!(cache.len(), 3);
        assert!(cache.peek("u0").is_some());
        assert!(cache.peek("u1").is_some());
        assert!(cache.peek("u6").is_some());
        assert_eq!(cache.flush_cache(), 0);
    }
}
