//! Definition state and generation tokens.
//!
//! A definition's current [`Version`] is the only cross-thread visibility
//! channel: it is published through an `ArcSwap` (release on store, acquire
//! on load), so any reader that sees generation `G` and an entry tagged with
//! `G` also sees that entry's fully constructed value.
//!
//! Versions are compared by address, never by value. A superseded version is
//! owned by nobody and is freed once the last transient reader lets go; cache
//! entries only ever hold it weakly.

use std::sync::{Arc, Weak};

use arc_swap::{ArcSwap, Guard};

use crate::entry::Entry;
use crate::identity::{Identity, next_cache_hash};

/// Shared state behind one definition: identity, slot hash, live version.
pub(crate) struct DefinitionCore {
    identity: Identity,
    cache_hash: u32,
    version: ArcSwap<Version>,
}

impl DefinitionCore {
    pub(crate) fn new() -> Arc<Self> {
        let cache_hash = next_cache_hash();
        Arc::new_cyclic(|me| Self {
            identity: Identity::fresh(),
            cache_hash,
            version: ArcSwap::new(Version::new(me.clone(), cache_hash, 0)),
        })
    }

    pub(crate) fn identity(&self) -> Identity {
        self.identity
    }

    pub(crate) fn cache_hash(&self) -> u32 {
        self.cache_hash
    }

    /// Lock-free, allocation-free view of the live version.
    pub(crate) fn load_version(&self) -> Guard<Arc<Version>> {
        self.version.load()
    }

    pub(crate) fn current_version(&self) -> Arc<Version> {
        self.version.load_full()
    }

    pub(crate) fn is_current(&self, version: &Version) -> bool {
        std::ptr::eq(Arc::as_ptr(&*self.version.load()), version)
    }

    /// Supersede the live version.
    ///
    /// Always advances, even on back-to-back calls. Callers hold the map lock
    /// of the context being changed; other contexts may bump concurrently
    /// under their own locks, so the swap is a compare-and-swap loop.
    pub(crate) fn bump_version(self: &Arc<Self>) {
        let owner = Arc::downgrade(self);
        self.version.rcu(|current| {
            Version::new(owner.clone(), self.cache_hash, current.generation + 1)
        });
    }
}

/// One generation of a definition's value.
pub(crate) struct Version {
    owner: Weak<DefinitionCore>,
    cache_hash: u32,
    generation: u64,
    promise: Arc<Entry>,
}

impl Version {
    fn new(owner: Weak<DefinitionCore>, cache_hash: u32, generation: u64) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            owner,
            cache_hash,
            generation,
            promise: Arc::new(Entry::promise(me.clone())),
        })
    }

    /// The unique placeholder for this generation.
    pub(crate) fn promise(&self) -> &Arc<Entry> {
        &self.promise
    }

    pub(crate) fn cache_hash(&self) -> u32 {
        self.cache_hash
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// True while the owning definition still points at this exact version.
    pub(crate) fn is_live(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.is_current(self))
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("cache_hash", &self.cache_hash)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
