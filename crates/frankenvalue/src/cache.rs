//! Per-context fast-path cache array.
//!
//! A small power-of-two open-addressing table of entry references. It holds
//! live entries only (never promises), may hold stale or dead leftovers until
//! they are swept, and uses the shared tombstone to keep probe runs intact.
//!
//! Readers index it without any lock. Every mutation goes through a
//! [`CacheWriter`], which can only be built by code holding the owning map's
//! lock (it borrows the lock-protected load counter).
//!
//! Positions passed around here are unmasked; every slot access masks. A
//! probe run starting at `p` covers `p..p + probe_limit`.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;

use crate::entry::{Entry, EntryState, ErasedValue};
use crate::version::Version;

// ---------------------------------------------------------------------------
// Array and lock-free read path
// ---------------------------------------------------------------------------

pub(crate) struct CacheArray {
    slots: Box<[ArcSwapOption<Entry>]>,
}

impl CacheArray {
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        Self {
            slots: (0..len).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn slot(&self, pos: usize) -> &ArcSwapOption<Entry> {
        &self.slots[pos & self.mask()]
    }

    fn load(&self, pos: usize) -> Option<Arc<Entry>> {
        self.slot(pos).load_full()
    }

    fn is_occupied(&self, pos: usize) -> bool {
        self.slot(pos).load().is_some()
    }

    pub(crate) fn home_of(&self, cache_hash: u32) -> usize {
        cache_hash as usize & self.mask()
    }

    /// Distance from an entry's home slot to `pos`. Entries whose token is
    /// gone count as sitting at home.
    pub(crate) fn dislocation(&self, pos: usize, entry: &Entry) -> usize {
        entry
            .cache_hash()
            .map_or(0, |hash| pos.wrapping_sub(hash as usize) & self.mask())
    }

    /// Home-slot lookup. No lock, no allocation.
    ///
    /// Only a hit on the exact live version counts; anything else is a miss,
    /// and a spurious miss merely costs a trip to the map.
    pub(crate) fn probe_home(&self, cache_hash: u32, current: &Version) -> Option<ErasedValue> {
        let guard = self.slot(cache_hash as usize).load();
        let Some(entry) = &*guard else {
            return None;
        };
        if entry.is_version(current) {
            entry.value().cloned()
        } else {
            None
        }
    }

    /// Scan the rest of the probe window, stopping at the first gap.
    ///
    /// Returns the hit's position so the caller can try to promote it.
    pub(crate) fn probe_backup(
        &self,
        cache_hash: u32,
        current: &Version,
        probe_limit: usize,
    ) -> Option<(usize, ErasedValue)> {
        let home = self.home_of(cache_hash);
        if !self.is_occupied(home) {
            return None;
        }
        for pos in home + 1..home + probe_limit {
            let guard = self.slot(pos).load();
            let Some(entry) = &*guard else {
                break;
            };
            if entry.is_version(current)
                && let Some(value) = entry.value()
            {
                return Some((pos, Arc::clone(value)));
            }
        }
        None
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = Arc<Entry>> + '_ {
        self.slots.iter().filter_map(|slot| slot.load_full())
    }

    pub(crate) fn snapshot(&self, load: usize, load_limit: usize, probe_limit: usize) -> CacheSnapshot {
        let slots = (0..self.len())
            .map(|index| match self.load(index) {
                None => SlotView {
                    index,
                    state: None,
                    cache_hash: None,
                    dislocation: None,
                },
                Some(entry) => SlotView {
                    index,
                    state: Some(entry.state()),
                    cache_hash: entry.cache_hash(),
                    dislocation: entry.cache_hash().map(|_| self.dislocation(index, &entry)),
                },
            })
            .collect();
        CacheSnapshot {
            capacity: self.len(),
            load,
            load_limit,
            probe_limit,
            slots,
        }
    }
}

// ---------------------------------------------------------------------------
// Locked mutation
// ---------------------------------------------------------------------------

/// Mutating view of a cache array; exists only under the owning map's lock.
pub(crate) struct CacheWriter<'a> {
    array: &'a CacheArray,
    load: &'a mut usize,
    probe_limit: usize,
}

impl<'a> CacheWriter<'a> {
    pub(crate) fn new(array: &'a CacheArray, load: &'a mut usize, probe_limit: usize) -> Self {
        Self {
            array,
            load,
            probe_limit,
        }
    }

    /// Insert a live entry at its definition's home slot.
    ///
    /// A live occupant that gets displaced is moved to the first free slot of
    /// its own probe window. If there is none it simply falls out of the
    /// cache; the map still has it.
    pub(crate) fn add(&mut self, cache_hash: u32, entry: Arc<Entry>) {
        debug_assert!(!entry.is_promise(), "promises never enter the cache");
        let home = self.array.home_of(cache_hash);
        let Some(displaced) = self.place(home, entry, false) else {
            return;
        };
        let home2 = home.wrapping_sub(self.array.dislocation(home, &displaced));
        let mut pending = displaced;
        for pos in (0..self.probe_limit).map(|k| home2.wrapping_add(k)) {
            match self.place(pos, pending, true) {
                None => return,
                Some(rejected) => pending = rejected,
            }
        }
    }

    /// Re-add an entry found in an older array, keyed by its own token.
    pub(crate) fn readd(&mut self, entry: Arc<Entry>) {
        if let Some(hash) = entry.cache_hash() {
            self.add(hash, entry);
        }
    }

    /// Write `entry` at `pos`, returning whichever live entry is pushed out.
    ///
    /// With `gently`, a live occupant wins and `entry` comes back instead.
    /// Stale and dead occupants are overwritten silently.
    fn place(&mut self, pos: usize, entry: Arc<Entry>, gently: bool) -> Option<Arc<Entry>> {
        let slot = self.array.slot(pos);
        let occupant = match slot.load_full() {
            None => {
                *self.load += 1;
                None
            }
            Some(current) if Arc::ptr_eq(&current, &entry) => return None,
            Some(current) if current.is_live() => Some(current),
            Some(_) => None,
        };
        if gently && occupant.is_some() {
            return Some(entry);
        }
        slot.store(Some(entry));
        occupant
    }

    /// Move a backup-window hit for `current` into its home slot.
    ///
    /// The old home occupant takes the first non-live slot seen during the
    /// scan (or the hit's old slot), provided that spot is still inside its
    /// own window; otherwise it is replaced by a tombstone.
    pub(crate) fn promote(&mut self, cache_hash: u32, current: &Version) -> bool {
        let home = self.array.home_of(cache_hash);
        let Some(old_home) = self.array.load(home) else {
            return false;
        };
        let mut vacancy: Option<usize> = None;
        for pos in home + 1..home + self.probe_limit {
            let Some(entry) = self.array.load(pos) else {
                break;
            };
            if entry.is_version(current) && !entry.is_promise() {
                self.array.slot(home).store(Some(entry));
                let target = match vacancy {
                    Some(earlier) => {
                        self.array.slot(pos).store(Some(Entry::tombstone()));
                        earlier
                    }
                    None => pos,
                };
                let keep = old_home.is_live()
                    && self.array.dislocation(target, &old_home) < self.probe_limit;
                let moved = if keep { old_home } else { Entry::tombstone() };
                self.array.slot(target).store(Some(moved));
                return true;
            }
            if vacancy.is_none() && !entry.is_live() {
                vacancy = Some(pos);
            }
        }
        false
    }

    /// Evict non-live entries in `begin..begin + count`.
    ///
    /// A freed slot is refilled, when possible, by a later live entry whose
    /// home is at or before it, so no run that passes through the slot is cut
    /// short. Returns the number of evicted entries.
    pub(crate) fn remove_stale(&mut self, begin: usize, count: usize) -> usize {
        let mut evicted = 0;
        let mut removed = 0;
        for pos in begin..begin + count {
            let Some(entry) = self.array.load(pos) else {
                continue;
            };
            if entry.is_live() {
                continue;
            }
            let replacement = if self.probe_limit > 1 {
                self.find_replacement(pos)
            } else {
                None
            };
            if replacement.is_none() {
                removed += 1;
            }
            self.array.slot(pos).store(replacement);
            evicted += 1;
        }
        *self.load = self.load.saturating_sub(removed);
        evicted
    }

    /// Sweep every slot, wrapping far enough to finish runs crossing the end.
    pub(crate) fn remove_all_stale(&mut self) -> usize {
        let count = self.array.len() + self.probe_limit - 1;
        self.remove_stale(0, count)
    }

    /// Sweep the probe window that starts at a definition's home slot.
    pub(crate) fn remove_stale_around(&mut self, cache_hash: u32) -> usize {
        self.remove_stale(cache_hash as usize, self.probe_limit)
    }

    /// Find a live entry after `hole` that may legally move into it.
    ///
    /// An entry whose home is exactly `hole` is preferred; otherwise the last
    /// one whose home lies before `hole`. The chosen entry's old slot becomes
    /// a tombstone if the run continues past it, else it is cleared.
    fn find_replacement(&mut self, hole: usize) -> Option<Arc<Entry>> {
        let mut chosen: Option<(usize, Arc<Entry>)> = None;
        let mut exact = false;
        let hole_at = hole as isize;
        for pos in hole + 1..hole + self.probe_limit {
            let Some(candidate) = self.array.load(pos) else {
                break;
            };
            if !candidate.is_live() {
                continue;
            }
            let dislocation = self.array.dislocation(pos, &candidate);
            if dislocation == 0 {
                continue;
            }
            let candidate_home = pos as isize - dislocation as isize;
            if candidate_home == hole_at {
                chosen = Some((pos, candidate));
                exact = true;
            } else if candidate_home < hole_at && !exact {
                chosen = Some((pos, candidate));
            }
        }
        let (pos, entry) = chosen?;
        if self.array.is_occupied(pos + 1) {
            self.array.slot(pos).store(Some(Entry::tombstone()));
        } else {
            self.array.slot(pos).store(None);
            *self.load = self.load.saturating_sub(1);
        }
        Some(entry)
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// One slot as seen by [`CacheSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub index: usize,
    /// `None` for an empty slot.
    pub state: Option<EntryState>,
    pub cache_hash: Option<u32>,
    /// Distance from the home slot, when the owner is still reachable.
    pub dislocation: Option<usize>,
}

/// Point-in-time copy of a context's cache array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    pub capacity: usize,
    /// Occupied-slot count as tracked by the map (tombstones included).
    pub load: usize,
    pub load_limit: usize,
    pub probe_limit: usize,
    pub slots: Vec<SlotView>,
}

impl CacheSnapshot {
    pub(crate) fn unallocated(probe_limit: usize) -> Self {
        Self {
            capacity: 0,
            load: 0,
            load_limit: 0,
            probe_limit,
            slots: Vec::new(),
        }
    }

    fn count(&self, state: EntryState) -> usize {
        self.slots.iter().filter(|s| s.state == Some(state)).count()
    }

    #[must_use]
    pub fn live_slots(&self) -> usize {
        self.count(EntryState::Live)
    }

    #[must_use]
    pub fn occupied_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_some()).count()
    }

    #[must_use]
    pub fn contains_promise(&self) -> bool {
        self.count(EntryState::Promise) > 0
    }

    /// Live slots sitting outside their definition's probe window.
    #[must_use]
    pub fn misplaced_live_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.state == Some(EntryState::Live))
            .filter(|s| s.dislocation.is_none_or(|d| d >= self.probe_limit))
            .map(|s| s.index)
            .collect()
    }

    /// Live slots belonging to the definition with this cache hash.
    #[must_use]
    pub fn live_slots_for(&self, cache_hash: u32) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == Some(EntryState::Live) && s.cache_hash == Some(cache_hash))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::DefinitionCore;

    const PROBE: usize = 4;

    /// A definition whose home is `home` in a table of `len` slots.
    fn def_at(home: usize, len: usize) -> Arc<DefinitionCore> {
        loop {
            let def = DefinitionCore::new();
            if def.cache_hash() as usize & (len - 1) == home {
                return def;
            }
        }
    }

    fn live(def: &DefinitionCore, v: u32) -> Arc<Entry> {
        Arc::new(def.current_version().promise().fulfil(Arc::new(v)))
    }

    fn value_of(value: &ErasedValue) -> u32 {
        *value.downcast_ref::<u32>().expect("u32 payload")
    }

    #[test]
    fn home_hit_requires_current_version() {
        let array = CacheArray::new(8);
        let mut load = 0;
        let def = def_at(3, 8);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        w.add(def.cache_hash(), live(&def, 11));
        assert_eq!(load, 1);

        let v = def.load_version();
        assert_eq!(array.probe_home(def.cache_hash(), &v).map(|x| value_of(&x)), Some(11));
        drop(v);

        def.bump_version();
        assert!(array.probe_home(def.cache_hash(), &def.load_version()).is_none());
    }

    #[test]
    fn displaced_entry_moves_within_its_window() {
        let array = CacheArray::new(16);
        let mut load = 0;
        let a = def_at(5, 16);
        let b = def_at(5, 16);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        w.add(a.cache_hash(), live(&a, 1));
        w.add(b.cache_hash(), live(&b, 2));
        assert_eq!(load, 2);

        // b owns home; a moved one step along.
        assert!(array.probe_home(b.cache_hash(), &b.load_version()).is_some());
        assert!(array.probe_home(a.cache_hash(), &a.load_version()).is_none());
        let (pos, value) = array
            .probe_backup(a.cache_hash(), &a.load_version(), PROBE)
            .expect("backup hit");
        assert_eq!(pos, 6);
        assert_eq!(value_of(&value), 1);
    }

    #[test]
    fn full_window_drops_the_displaced_entry() {
        let array = CacheArray::new(16);
        let mut load = 0;
        let defs: Vec<_> = (0..PROBE + 1).map(|_| def_at(2, 16)).collect();
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        for (i, def) in defs.iter().enumerate() {
            w.add(def.cache_hash(), live(def, i as u32));
        }
        let snap = array.snapshot(load, 0, PROBE);
        assert_eq!(snap.live_slots(), PROBE);
        assert!(snap.misplaced_live_slots().is_empty());
    }

    #[test]
    fn backup_probe_stops_at_gap() {
        let array = CacheArray::new(16);
        let mut load = 0;
        let a = def_at(1, 16);
        let other = def_at(1, 16);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        // Home is occupied, the next slot is a gap, the hit sits past it.
        w.add(other.cache_hash(), live(&other, 8));
        w.place(3, live(&a, 9), false);
        assert!(array.probe_backup(a.cache_hash(), &a.load_version(), PROBE).is_none());
    }

    #[test]
    fn promote_swaps_hit_into_home() {
        let array = CacheArray::new(16);
        let mut load = 0;
        let a = def_at(7, 16);
        let b = def_at(7, 16);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        w.add(a.cache_hash(), live(&a, 1));
        w.add(b.cache_hash(), live(&b, 2));
        assert!(w.promote(a.cache_hash(), &a.load_version()));
        assert!(array.probe_home(a.cache_hash(), &a.load_version()).is_some());
        let (pos, _) = array
            .probe_backup(b.cache_hash(), &b.load_version(), PROBE)
            .expect("b still reachable");
        assert_eq!(pos, 8);
        assert_eq!(load, 2);
    }

    #[test]
    fn stale_eviction_backfills_from_later_run() {
        let array = CacheArray::new(16);
        let mut load = 0;
        let a = def_at(4, 16);
        let b = def_at(4, 16);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        w.add(a.cache_hash(), live(&a, 1));
        w.add(b.cache_hash(), live(&b, 2));
        // b at 4, a at 5. Invalidate b; a should shift back into 4.
        b.bump_version();
        let evicted = w.remove_stale_around(b.cache_hash());
        assert_eq!(evicted, 1);
        assert_eq!(load, 1);
        assert!(array.probe_home(a.cache_hash(), &a.load_version()).is_some());
        assert!(!array.is_occupied(5));
    }

    #[test]
    fn replacement_leaves_tombstone_when_run_continues() {
        let array = CacheArray::new(16);
        let mut load = 0;
        let a = def_at(4, 16);
        let b = def_at(4, 16);
        let c = def_at(6, 16);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        w.add(a.cache_hash(), live(&a, 1));
        w.add(b.cache_hash(), live(&b, 2));
        w.add(c.cache_hash(), live(&c, 3));
        // Layout: 4=b, 5=a, 6=c. Moving a out of 5 must not cut the run at 5.
        let moved = w.find_replacement(4).expect("a may move into 4");
        assert!(moved.is_version(&a.load_version()));
        let snap = array.snapshot(load, 0, PROBE);
        assert_eq!(snap.slots[5].state, Some(EntryState::Dead));
        assert_eq!(snap.load, 3);
    }

    #[test]
    fn backfill_reaches_past_entries_that_cannot_move() {
        let array = CacheArray::new(16);
        let mut load = 0;
        let a = def_at(4, 16);
        let b = def_at(4, 16);
        let d = def_at(5, 16);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        w.add(d.cache_hash(), live(&d, 4));
        w.add(a.cache_hash(), live(&a, 1));
        w.add(b.cache_hash(), live(&b, 2));
        // Layout: 4=b, 5=d, 6=a. d is home; a is the only candidate for 4.
        b.bump_version();
        assert_eq!(w.remove_stale_around(b.cache_hash()), 1);
        assert_eq!(load, 2);
        assert!(array.probe_home(a.cache_hash(), &a.load_version()).is_some());
        assert!(array.probe_home(d.cache_hash(), &d.load_version()).is_some());
        assert!(!array.is_occupied(6));
    }

    #[test]
    fn full_sweep_clears_dead_entries_everywhere() {
        let array = CacheArray::new(8);
        let mut load = 0;
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        for home in 0..8 {
            let def = def_at(home, 8);
            w.add(def.cache_hash(), live(&def, home as u32));
            // def drops here, so every entry is dead.
        }
        assert_eq!(w.remove_all_stale(), 8);
        assert_eq!(load, 0);
        assert_eq!(array.entries().count(), 0);
    }

    #[test]
    fn snapshot_reports_dislocation() {
        let array = CacheArray::new(8);
        let mut load = 0;
        let a = def_at(6, 8);
        let b = def_at(6, 8);
        let mut w = CacheWriter::new(&array, &mut load, PROBE);
        w.add(a.cache_hash(), live(&a, 1));
        w.add(b.cache_hash(), live(&b, 2));
        let snap = array.snapshot(load, 5, PROBE);
        assert_eq!(snap.slots[6].dislocation, Some(0));
        assert_eq!(snap.slots[7].dislocation, Some(1));
        assert_eq!(snap.occupied_slots(), 2);
        assert!(!snap.contains_promise());
    }
}
