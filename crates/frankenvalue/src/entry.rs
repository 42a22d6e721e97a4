//! Cache entries.
//!
//! An entry binds a generation token (held weakly) to a computed value. Its
//! state is derived on demand, never stored:
//!
//! | state   | condition                                          |
//! |---------|----------------------------------------------------|
//! | Promise | placeholder for a computation in flight            |
//! | Dead    | token already freed, or the tombstone sentinel     |
//! | Stale   | token alive but superseded                         |
//! | Live    | token is the definition's current version          |
//!
//! Entries are immutable. Promise to Live is a replacement in the
//! authoritative map, never an in-place write.

use std::any::Any;
use std::sync::{Arc, LazyLock, Weak};

use serde::Serialize;

use crate::version::Version;

/// Type-erased value shared by every context slot of one definition.
pub(crate) type ErasedValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
enum Payload {
    Promise,
    Ready(ErasedValue),
    Tombstone,
}

/// Derived entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Promise,
    Dead,
    Stale,
    Live,
}

pub(crate) struct Entry {
    version: Weak<Version>,
    payload: Payload,
}

static TOMBSTONE: LazyLock<Arc<Entry>> = LazyLock::new(|| {
    Arc::new(Entry {
        version: Weak::new(),
        payload: Payload::Tombstone,
    })
});

impl Entry {
    pub(crate) fn promise(version: Weak<Version>) -> Self {
        Self {
            version,
            payload: Payload::Promise,
        }
    }

    pub(crate) fn ready(version: Weak<Version>, value: ErasedValue) -> Self {
        Self {
            version,
            payload: Payload::Ready(value),
        }
    }

    /// Shared occupied-but-empty marker; keeps probe runs unbroken.
    pub(crate) fn tombstone() -> Arc<Self> {
        Arc::clone(&TOMBSTONE)
    }

    /// A live entry carrying `value` for the same generation as `self`.
    pub(crate) fn fulfil(&self, value: ErasedValue) -> Self {
        Self::ready(self.version.clone(), value)
    }

    pub(crate) fn is_promise(&self) -> bool {
        matches!(self.payload, Payload::Promise)
    }

    /// The computed value; `None` for promises and tombstones.
    pub(crate) fn value(&self) -> Option<&ErasedValue> {
        match &self.payload {
            Payload::Ready(value) => Some(value),
            Payload::Promise | Payload::Tombstone => None,
        }
    }

    /// Identity test against a version, valid even if our token is gone:
    /// a `Weak` pins its allocation, so the address cannot be reused.
    pub(crate) fn is_version(&self, version: &Version) -> bool {
        std::ptr::eq(self.version.as_ptr(), version)
    }

    pub(crate) fn same_version(&self, other: &Entry) -> bool {
        self.version.ptr_eq(&other.version)
    }

    /// Value identity, used to skip no-op puts.
    pub(crate) fn holds(&self, value: &ErasedValue) -> bool {
        self.value().is_some_and(|mine| {
            std::ptr::eq(
                Arc::as_ptr(mine).cast::<()>(),
                Arc::as_ptr(value).cast::<()>(),
            )
        })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.version.upgrade().is_some_and(|v| v.is_live())
    }

    /// Slot hash of the owning definition, if the token is still reachable.
    pub(crate) fn cache_hash(&self) -> Option<u32> {
        self.version.upgrade().map(|v| v.cache_hash())
    }

    pub(crate) fn state(&self) -> EntryState {
        if self.is_promise() {
            return EntryState::Promise;
        }
        match self.version.upgrade() {
            None => EntryState::Dead,
            Some(v) if v.is_live() => EntryState::Live,
            Some(_) => EntryState::Stale,
        }
    }

    /// Re-tag a value with a newer version without recomputing it.
    pub(crate) fn refresh_version(&self, version: &Arc<Version>) -> Arc<Self> {
        debug_assert!(!self.is_promise(), "promises are replaced, not refreshed");
        Arc::new(Self {
            version: Arc::downgrade(version),
            payload: self.payload.clone(),
        })
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
