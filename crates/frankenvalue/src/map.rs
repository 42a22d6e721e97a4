//! Authoritative per-context map.
//!
//! One mutex guards both the identity-keyed bindings and every mutation of
//! the context's cache array, so retracting a superseded promise and sweeping
//! the array around an invalidated definition are atomic with respect to each
//! other. Readers of the cache array never take this lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::{CacheArray, CacheSnapshot, CacheWriter};
use crate::config::CacheConfig;
use crate::entry::{Entry, ErasedValue};
use crate::identity::Identity;
use crate::metrics::{ValueMetrics, global_metrics};
use crate::version::DefinitionCore;

struct Binding {
    /// Non-owning; a dropped definition's binding is expunged on load reduction.
    owner: Weak<DefinitionCore>,
    entry: Arc<Entry>,
}

struct MapState {
    bindings: HashMap<Identity, Binding>,
    cache_load: usize,
    cache_load_limit: usize,
}

pub(crate) struct ValueMap {
    cache: ArcSwap<CacheArray>,
    state: Mutex<MapState>,
    config: CacheConfig,
}

impl ValueMap {
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            cache: ArcSwap::from_pointee(CacheArray::new(config.initial_entries)),
            state: Mutex::new(MapState {
                bindings: HashMap::new(),
                cache_load: 0,
                cache_load_limit: config.load_limit_for(config.initial_entries),
            }),
            config,
        }
    }

    /// Lock-free view of the current cache array.
    pub(crate) fn cache(&self) -> Guard<Arc<CacheArray>> {
        self.cache.load()
    }

    pub(crate) fn probe_limit(&self) -> usize {
        self.config.probe_limit
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().bindings.len()
    }

    // -----------------------------------------------------------------------
    // Entry protocol
    // -----------------------------------------------------------------------

    /// Begin a read that missed the cache.
    ///
    /// Returns the current generation's promise when the caller must compute,
    /// or the bound value (re-tagged to the live generation if needed) when
    /// one is already known.
    pub(crate) fn start_entry(&self, def: &Arc<DefinitionCore>) -> Arc<Entry> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let version = def.current_version();
        let key = def.identity();

        let existing = state.bindings.get(&key).map(|b| Arc::clone(&b.entry));
        let Some(existing) = existing else {
            let promise = Arc::clone(version.promise());
            state.bindings.insert(
                key,
                Binding {
                    owner: Arc::downgrade(def),
                    entry: Arc::clone(&promise),
                },
            );
            return promise;
        };

        if existing.is_promise() {
            let promise = Arc::clone(version.promise());
            if !Arc::ptr_eq(&existing, &promise) {
                // Left over from a generation that has since been superseded.
                self.bind(state, def, Arc::clone(&promise));
            }
            return promise;
        }

        let entry = if existing.is_version(&version) {
            existing
        } else {
            let fresh = existing.refresh_version(&version);
            self.bind(state, def, Arc::clone(&fresh));
            fresh
        };
        self.check_cache_load(state);
        self.add_to_cache(state, def.cache_hash(), Arc::clone(&entry));
        entry
    }

    /// Conclude a computation started by [`start_entry`](Self::start_entry).
    ///
    /// Passing the promise itself retracts it. Otherwise `candidate` is
    /// committed only if the promise it was derived from is still bound; if a
    /// concurrent `remove` or `put` intervened, the candidate is discarded and
    /// `None` tells the caller to start over.
    pub(crate) fn finish_entry(
        &self,
        def: &Arc<DefinitionCore>,
        candidate: Arc<Entry>,
    ) -> Option<Arc<Entry>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let key = def.identity();
        let current = state.bindings.get(&key).map(|b| Arc::clone(&b.entry))?;

        if Arc::ptr_eq(&current, &candidate) {
            state.bindings.remove(&key);
            trace!(cache_hash = def.cache_hash(), "promise retracted");
            return None;
        }
        if !(current.is_promise() && current.same_version(&candidate)) || candidate.is_promise() {
            return None;
        }

        let version = def.current_version();
        let entry = if candidate.is_version(&version) {
            candidate
        } else {
            candidate.refresh_version(&version)
        };
        self.bind(state, def, Arc::clone(&entry));
        self.check_cache_load(state);
        self.add_to_cache(state, def.cache_hash(), Arc::clone(&entry));
        Some(entry)
    }

    /// Invalidate a bound value. Returns whether anything was invalidated.
    ///
    /// A pending promise is left alone: the computation in flight commits as
    /// usual.
    pub(crate) fn remove_entry(&self, def: &Arc<DefinitionCore>) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let key = def.identity();
        match state.bindings.get(&key) {
            None => return false,
            Some(binding) if binding.entry.is_promise() => return false,
            Some(_) => {}
        }
        state.bindings.remove(&key);
        def.bump_version();
        ValueMetrics::inc(&global_metrics().invalidations);
        self.remove_stale_around(state, def.cache_hash());
        true
    }

    /// Bind `value` directly, skipping computation.
    ///
    /// Returns `false` without touching the generation when the very same
    /// value is already bound to the live generation.
    pub(crate) fn change_entry(&self, def: &Arc<DefinitionCore>, value: ErasedValue) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let key = def.identity();
        let existing = state.bindings.get(&key).map(|b| Arc::clone(&b.entry));
        if let Some(current) = existing {
            if current.holds(&value) && current.is_version(&def.load_version()) {
                return false;
            }
            def.bump_version();
            self.remove_stale_around(state, def.cache_hash());
        }
        ValueMetrics::inc(&global_metrics().puts);

        let version = def.current_version();
        let entry = Arc::new(Entry::ready(Arc::downgrade(&version), value));
        self.bind(state, def, Arc::clone(&entry));
        self.check_cache_load(state);
        self.add_to_cache(state, def.cache_hash(), entry);
        true
    }

    /// Move a backup-window hit into its home slot, if that can be done now.
    ///
    /// Gives up rather than wait for the lock, and gives up if the array the
    /// caller probed has been replaced in the meantime.
    pub(crate) fn try_promote(&self, def: &DefinitionCore, seen: &Arc<CacheArray>) -> bool {
        let Some(mut guard) = self.state.try_lock() else {
            return false;
        };
        let array = self.cache.load_full();
        if !Arc::ptr_eq(&array, seen) {
            return false;
        }
        let version = def.load_version();
        let state = &mut *guard;
        CacheWriter::new(&array, &mut state.cache_load, self.config.probe_limit)
            .promote(def.cache_hash(), &version)
    }

    pub(crate) fn snapshot(&self) -> CacheSnapshot {
        let state = self.state.lock();
        self.cache
            .load()
            .snapshot(state.cache_load, state.cache_load_limit, self.config.probe_limit)
    }

    // -----------------------------------------------------------------------
    // Locked helpers
    // -----------------------------------------------------------------------

    fn bind(&self, state: &mut MapState, def: &Arc<DefinitionCore>, entry: Arc<Entry>) {
        state.bindings.insert(
            def.identity(),
            Binding {
                owner: Arc::downgrade(def),
                entry,
            },
        );
    }

    fn add_to_cache(&self, state: &mut MapState, cache_hash: u32, entry: Arc<Entry>) {
        let array = self.cache.load_full();
        CacheWriter::new(&array, &mut state.cache_load, self.config.probe_limit)
            .add(cache_hash, entry);
    }

    fn remove_stale_around(&self, state: &mut MapState, cache_hash: u32) {
        let array = self.cache.load_full();
        let evicted = CacheWriter::new(&array, &mut state.cache_load, self.config.probe_limit)
            .remove_stale_around(cache_hash);
        ValueMetrics::add(&global_metrics().stale_evictions, evicted as u64);
    }

    fn check_cache_load(&self, state: &mut MapState) {
        if state.cache_load >= state.cache_load_limit {
            self.reduce_cache_load(state);
        }
    }

    /// Reclaim space: drop bindings of dead definitions, sweep every stale
    /// slot, and double the array if that was not enough.
    fn reduce_cache_load(&self, state: &mut MapState) {
        let before = state.bindings.len();
        state
            .bindings
            .retain(|_, binding| binding.owner.strong_count() > 0);
        let expunged = before - state.bindings.len();
        if expunged > 0 {
            ValueMetrics::add(&global_metrics().expunged_bindings, expunged as u64);
            debug!(expunged, remaining = state.bindings.len(), "expunged dropped definitions");
        }

        let old = self.cache.load_full();
        let evicted = CacheWriter::new(&old, &mut state.cache_load, self.config.probe_limit)
            .remove_all_stale();
        ValueMetrics::add(&global_metrics().stale_evictions, evicted as u64);
        if state.cache_load < state.cache_load_limit {
            return;
        }

        let new_len = old.len() * 2;
        if new_len > self.config.max_entries {
            return;
        }
        let grown = Arc::new(CacheArray::new(new_len));
        state.cache_load = 0;
        state.cache_load_limit = self.config.load_limit_for(new_len);
        {
            let mut writer =
                CacheWriter::new(&grown, &mut state.cache_load, self.config.probe_limit);
            for entry in old.entries().filter(|e| e.is_live()) {
                writer.readd(entry);
            }
        }
        self.cache.store(grown);
        ValueMetrics::inc(&global_metrics().resizes);
        debug!(
            from = old.len(),
            to = new_len,
            load = state.cache_load,
            "cache array grown"
        );
    }
}

impl std::fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueMap")
            .field("bindings", &self.len())
            .field("capacity", &self.cache.load().len())
            .finish_non_exhaustive()
    }
}
