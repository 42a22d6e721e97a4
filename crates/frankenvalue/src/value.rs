//! Value definitions and the public read/invalidate/set operations.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::entry::{Entry, ErasedValue};
use crate::identity::Identity;
use crate::map::ValueMap;
use crate::metrics::{ValueMetrics, global_metrics};
use crate::version::DefinitionCore;

/// The computation behind a [`ContextValue`].
///
/// Runs outside every lock. It may run more than once for the same context
/// and generation when threads race, but only one result is ever published.
pub trait ComputeValue<T> {
    type Value: Send + Sync + 'static;
    type Error;

    fn compute_value(&self, context: &Context<T>) -> Result<Self::Value, Self::Error>;
}

/// [`ComputeValue`] backed by a closure.
pub struct FnCompute<F, V, E> {
    f: F,
    _marker: PhantomData<fn() -> (V, E)>,
}

impl<T, F, V, E> ComputeValue<T> for FnCompute<F, V, E>
where
    F: Fn(&Context<T>) -> Result<V, E>,
    V: Send + Sync + 'static,
{
    type Value = V;
    type Error = E;

    fn compute_value(&self, context: &Context<T>) -> Result<V, E> {
        (self.f)(context)
    }
}

/// A lazily computed value, cached separately in every [`Context`].
///
/// Lookups are by definition identity. Two definitions built from the same
/// closure are still distinct keys.
pub struct ContextValue<C> {
    core: Arc<DefinitionCore>,
    compute: C,
}

impl<F, V, E> ContextValue<FnCompute<F, V, E>> {
    pub fn from_fn<T>(f: F) -> Self
    where
        F: Fn(&Context<T>) -> Result<V, E>,
        V: Send + Sync + 'static,
    {
        Self::new(FnCompute {
            f,
            _marker: PhantomData,
        })
    }
}

impl<C> ContextValue<C> {
    pub fn new(compute: C) -> Self {
        Self {
            core: DefinitionCore::new(),
            compute,
        }
    }

    /// The value for `context`, computing it on first use.
    ///
    /// A cache hit takes no lock and allocates nothing. On a miss the
    /// computation runs with no lock held; if the binding was invalidated or
    /// replaced while it ran, the result is discarded and the read starts
    /// over. A computation error is returned unchanged and nothing is cached.
    pub fn get<T>(&self, context: &Context<T>) -> Result<Arc<C::Value>, C::Error>
    where
        C: ComputeValue<T>,
    {
        if let Some(map) = context.existing_values() {
            let cache = map.cache();
            let version = self.core.load_version();
            let hash = self.core.cache_hash();
            if let Some(value) = cache.probe_home(hash, &version) {
                global_metrics().home_hits.inc();
                return Ok(downcast(value));
            }
            if let Some((_, value)) = cache.probe_backup(hash, &version, map.probe_limit()) {
                global_metrics().backup_hits.inc();
                if map.try_promote(&self.core, &cache) {
                    ValueMetrics::inc(&global_metrics().relocations);
                }
                return Ok(downcast(value));
            }
        }
        self.get_from_map(context)
    }

    fn get_from_map<T>(&self, context: &Context<T>) -> Result<Arc<C::Value>, C::Error>
    where
        C: ComputeValue<T>,
    {
        let map = context.values();
        ValueMetrics::inc(&global_metrics().map_lookups);
        loop {
            let entry = map.start_entry(&self.core);
            if !entry.is_promise() {
                return Ok(bound_value(&entry));
            }

            let mut guard = PromiseGuard {
                map,
                core: &self.core,
                promise: &entry,
                armed: true,
            };
            ValueMetrics::inc(&global_metrics().computations);
            let value = Arc::new(self.compute.compute_value(context)?);
            guard.disarm();

            let erased: ErasedValue = value.clone();
            if map
                .finish_entry(&self.core, Arc::new(entry.fulfil(erased)))
                .is_some()
            {
                return Ok(value);
            }
            ValueMetrics::inc(&global_metrics().publish_retries);
            trace!(
                cache_hash = self.core.cache_hash(),
                "computed value superseded, retrying"
            );
        }
    }

    /// Forget the value for `context`; the next `get` recomputes it.
    ///
    /// Safe to call on a context that never computed this value. A
    /// computation already in flight is not cancelled and still publishes.
    pub fn remove<T>(&self, context: &Context<T>) {
        if let Some(map) = context.existing_values() {
            map.remove_entry(&self.core);
        }
    }

    /// Bind `value` in `context` without running the computation.
    ///
    /// Putting the value that is already bound (the same `Arc`) changes
    /// nothing. Otherwise the old value is invalidated first, and a
    /// computation in flight for this context is discarded.
    pub fn put<T>(&self, context: &Context<T>, value: impl Into<Arc<C::Value>>)
    where
        C: ComputeValue<T>,
    {
        let value: Arc<C::Value> = value.into();
        context.values().change_entry(&self.core, value);
    }

    /// Ordinal of the live generation: 0 at construction, +1 per invalidation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.core.load_version().generation()
    }

    #[must_use]
    pub fn cache_hash(&self) -> u32 {
        self.core.cache_hash()
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        self.core.identity()
    }

    pub fn compute(&self) -> &C {
        &self.compute
    }
}

impl<C> fmt::Debug for ContextValue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextValue")
            .field("identity", &self.identity())
            .field("cache_hash", &self.cache_hash())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Retracts an outstanding promise unless disarmed, including on unwind.
struct PromiseGuard<'a> {
    map: &'a ValueMap,
    core: &'a Arc<DefinitionCore>,
    promise: &'a Arc<Entry>,
    armed: bool,
}

impl PromiseGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PromiseGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            ValueMetrics::inc(&global_metrics().compute_failures);
            self.map.finish_entry(self.core, Arc::clone(self.promise));
        }
    }
}

fn downcast<V: Send + Sync + 'static>(value: ErasedValue) -> Arc<V> {
    match value.downcast::<V>() {
        Ok(value) => value,
        Err(_) => unreachable!("a definition identity only ever binds its own value type"),
    }
}

fn bound_value<V: Send + Sync + 'static>(entry: &Entry) -> Arc<V> {
    match entry.value() {
        Some(value) => downcast(Arc::clone(value)),
        None => unreachable!("bound entries that are not promises carry a value"),
    }
}
