//! Definition identity and cache-slot hashing.
//!
//! Every definition gets an [`Identity`] that is distinct from the definition
//! value itself, so map lookups never depend on user-visible equality. The
//! cache-slot hash is a Fibonacci sequence over a process-wide counter: each
//! new definition lands far from the previous one in any power-of-two table.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Golden-ratio increment (2^32 / phi) for spreading consecutive hashes.
pub const HASH_INCREMENT: u32 = 0x61c8_8647;

/// Keeps cache hashes positive and bounds the largest usable array.
pub const HASH_MASK: u32 = u32::MAX >> 2;

static NEXT_HASH: AtomicU32 = AtomicU32::new(0);
static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Opaque, unforgeable map key for one definition instance.
///
/// Only [`Identity::fresh`] mints values, and the counter never repeats, so a
/// key cannot collide with a dropped definition's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u64);

impl Identity {
    pub(crate) fn fresh() -> Self {
        Self(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw ordinal, for diagnostics.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Draw the next cache-slot hash. Fixed for the lifetime of a definition.
pub(crate) fn next_cache_hash() -> u32 {
    NEXT_HASH.fetch_add(HASH_INCREMENT, Ordering::Relaxed) & HASH_MASK
}
