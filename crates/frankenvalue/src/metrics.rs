//! Atomic counters for cache observability.
//!
//! All counters use relaxed ordering; they are diagnostic only and never
//! order anything else. The two cache-hit counters sit on the lock-free read
//! path of every context, so they are striped across cache-padded shards
//! picked per thread.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use serde::Serialize;

const STRIPES: usize = 16;

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STRIPE: Cell<Option<usize>> = const { Cell::new(None) };
}

fn stripe_index() -> usize {
    STRIPE.with(|slot| match slot.get() {
        Some(index) => index,
        None => {
            let index = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed) % STRIPES;
            slot.set(Some(index));
            index
        }
    })
}

/// Counter split across padded shards; a thread always bumps the same shard.
pub struct StripedCounter {
    shards: [CachePadded<AtomicU64>; STRIPES],
}

impl StripedCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shards: [const { CachePadded::new(AtomicU64::new(0)) }; STRIPES],
        }
    }

    pub fn inc(&self) {
        self.shards[stripe_index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Sum over all shards.
    pub fn get(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.load(Ordering::Relaxed))
            .fold(0, u64::wrapping_add)
    }
}

impl Default for StripedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Global cache operation counters.
pub struct ValueMetrics {
    /// Reads answered by the home slot.
    pub home_hits: StripedCounter,
    /// Reads answered further along the probe window.
    pub backup_hits: StripedCounter,
    /// Backup hits moved into their home slot.
    pub relocations: AtomicU64,
    /// Reads that fell through to the authoritative map.
    pub map_lookups: AtomicU64,
    /// `compute_value` invocations.
    pub computations: AtomicU64,
    /// `compute_value` calls that returned an error or panicked.
    pub compute_failures: AtomicU64,
    /// Computed values discarded because the promise was superseded.
    pub publish_retries: AtomicU64,
    /// Generation bumps caused by `remove`.
    pub invalidations: AtomicU64,
    /// Generation bumps caused by `put`.
    pub puts: AtomicU64,
    /// Non-live entries evicted from cache arrays.
    pub stale_evictions: AtomicU64,
    /// Cache arrays replaced by a larger one.
    pub resizes: AtomicU64,
    /// Map bindings dropped because their definition is gone.
    pub expunged_bindings: AtomicU64,
}

impl ValueMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            home_hits: StripedCounter::new(),
            backup_hits: StripedCounter::new(),
            relocations: AtomicU64::new(0),
            map_lookups: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            compute_failures: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            stale_evictions: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            expunged_bindings: AtomicU64::new(0),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            home_hits: self.home_hits.get(),
            backup_hits: self.backup_hits.get(),
            relocations: Self::get(&self.relocations),
            map_lookups: Self::get(&self.map_lookups),
            computations: Self::get(&self.computations),
            compute_failures: Self::get(&self.compute_failures),
            publish_retries: Self::get(&self.publish_retries),
            invalidations: Self::get(&self.invalidations),
            puts: Self::get(&self.puts),
            stale_evictions: Self::get(&self.stale_evictions),
            resizes: Self::get(&self.resizes),
            expunged_bindings: Self::get(&self.expunged_bindings),
        }
    }
}

impl Default for ValueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub home_hits: u64,
    pub backup_hits: u64,
    pub relocations: u64,
    pub map_lookups: u64,
    pub computations: u64,
    pub compute_failures: u64,
    pub publish_retries: u64,
    pub invalidations: u64,
    pub puts: u64,
    pub stale_evictions: u64,
    pub resizes: u64,
    pub expunged_bindings: u64,
}

impl MetricsSnapshot {
    /// Counter-wise difference `self - earlier`, saturating at zero.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            home_hits: self.home_hits.saturating_sub(earlier.home_hits),
            backup_hits: self.backup_hits.saturating_sub(earlier.backup_hits),
            relocations: self.relocations.saturating_sub(earlier.relocations),
            map_lookups: self.map_lookups.saturating_sub(earlier.map_lookups),
            computations: self.computations.saturating_sub(earlier.computations),
            compute_failures: self.compute_failures.saturating_sub(earlier.compute_failures),
            publish_retries: self.publish_retries.saturating_sub(earlier.publish_retries),
            invalidations: self.invalidations.saturating_sub(earlier.invalidations),
            puts: self.puts.saturating_sub(earlier.puts),
            stale_evictions: self.stale_evictions.saturating_sub(earlier.stale_evictions),
            resizes: self.resizes.saturating_sub(earlier.resizes),
            expunged_bindings: self.expunged_bindings.saturating_sub(earlier.expunged_bindings),
        }
    }
}

static GLOBAL_METRICS: ValueMetrics = ValueMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static ValueMetrics {
    &GLOBAL_METRICS
}
