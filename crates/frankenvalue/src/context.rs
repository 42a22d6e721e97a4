//! Contexts: the objects values are cached against.
//!
//! A [`Context`] wraps caller data and lazily owns exactly one authoritative
//! map. The map is created on first use; creation is serialized by one
//! process-wide lock so two racing threads can never each install their own.

use std::ops::Deref;
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::CacheSnapshot;
use crate::config::{CacheConfig, ConfigError, cache_config};
use crate::map::ValueMap;

static MAP_INIT: Mutex<()> = Mutex::new(());

/// Caller data plus its private value cache.
pub struct Context<T> {
    data: T,
    config: CacheConfig,
    values: OnceLock<ValueMap>,
}

impl<T> Context<T> {
    /// Wrap `data` using the process-wide cache configuration.
    pub fn new(data: T) -> Self {
        Self {
            data,
            config: cache_config(),
            values: OnceLock::new(),
        }
    }

    /// Wrap `data` with explicit cache tuning.
    pub fn with_config(data: T, config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            data,
            config,
            values: OnceLock::new(),
        })
    }

    pub fn get_ref(&self) -> &T {
        &self.data
    }

    /// Unwrap the data. Every cached value for this context is dropped.
    pub fn into_inner(self) -> T {
        self.data
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Copy of the cache array and its bookkeeping, for tests and diagnostics.
    ///
    /// A context that never cached anything reports capacity 0.
    #[must_use]
    pub fn inspect_cache(&self) -> CacheSnapshot {
        match self.existing_values() {
            Some(map) => map.snapshot(),
            None => CacheSnapshot::unallocated(self.config.probe_limit),
        }
    }

    /// Number of definitions with a binding (pending or computed) here.
    #[must_use]
    pub fn bound_definitions(&self) -> usize {
        self.existing_values().map_or(0, ValueMap::len)
    }

    pub(crate) fn existing_values(&self) -> Option<&ValueMap> {
        self.values.get()
    }

    pub(crate) fn values(&self) -> &ValueMap {
        if let Some(map) = self.values.get() {
            return map;
        }
        let _init = MAP_INIT.lock();
        self.values.get_or_init(|| {
            debug!(
                initial_entries = self.config.initial_entries,
                probe_limit = self.config.probe_limit,
                "creating context value map"
            );
            ValueMap::new(self.config)
        })
    }
}

impl<T: Default> Default for Context<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Deref for Context<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("data", &self.data)
            .field("bound_definitions", &self.bound_definitions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_created_lazily_and_once() {
        let ctx = Context::new(5u8);
        assert!(ctx.existing_values().is_none());
        assert_eq!(ctx.inspect_cache().capacity, 0);
        assert_eq!(ctx.bound_definitions(), 0);

        let first: *const ValueMap = ctx.values();
        let second: *const ValueMap = ctx.values();
        assert_eq!(first, second);
        assert_eq!(ctx.inspect_cache().capacity, ctx.config().initial_entries);
    }

    #[test]
    fn racing_first_use_agrees_on_one_map() {
        let ctx = Context::new(());
        let addrs: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| std::ptr::from_ref(ctx.values()) as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn data_is_reachable() {
        let ctx = Context::new(String::from("payload"));
        assert_eq!(ctx.len(), 7);
        assert_eq!(ctx.get_ref(), "payload");
        assert_eq!(ctx.into_inner(), "payload");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CacheConfig {
            initial_entries: 3,
            ..CacheConfig::default()
        };
        assert!(Context::with_config((), config).is_err());

        let config = CacheConfig {
            initial_entries: 8,
            probe_limit: 3,
            ..CacheConfig::default()
        };
        let ctx = Context::with_config((), config).unwrap();
        assert_eq!(ctx.config().initial_entries, 8);
    }
}
