//! Key table — maps opaque segment keys to the segments they name.
//!
//! Storage is **direct-address slotting**: a key lives in slot
//! `key % capacity` and nowhere else, so lookup and removal are a single
//! indexed probe. Two keys may never share a slot. When an insert lands on
//! an occupied slot the table grows to `2 * capacity + 1` and tries to
//! re-place every existing entry; if any two entries collide at the new
//! capacity the attempt is discarded and the table grows again. Only a
//! collision-free layout is committed.
//!
//! Keys are sparse random 30-bit integers drawn from a `KeySource`, so
//! collisions are rare and the retry loop terminates quickly in practice.
//!
//! Freeing a segment empties its slot and records the key as **retired**.
//! Slots only ever hold live segments, so growth depends on the live set
//! alone; the retired set is what keeps a freed key from being handed out
//! again, and what distinguishes a stale key from one never issued.

use core::fmt;
use std::collections::HashSet;

use crate::keys::KeySource;
use crate::segment::Segment;
use crate::{ConstructionError, EngineConfig, TrapKind};

/// Capacity of a fresh table.
pub const INITIAL_CAPACITY: usize = 11;

/// Keys occupy 30 bits so they fit the handle wire format.
pub const KEY_MASK: u32 = (1 << 30) - 1;

/// Draws per insert before giving up on the key source.
const KEY_DRAWS: usize = 64;

/// Owner of every segment of one engine (or of a group of duplicated
/// engines sharing it).
pub struct KeyTable {
    /// `slots[key % capacity]` holds the segment with that key, if any.
    slots: Vec<Option<Segment>>,
    /// Number of occupied slots (live segments).
    len: usize,
    /// Keys of freed segments. Never reissued.
    retired: HashSet<u32>,
    max_capacity: usize,
    keys: Box<dyn KeySource>,
}

impl KeyTable {
    /// Create an empty table sized by `config`.
    ///
    /// # Errors
    /// Returns a `ConstructionError` if the capacities are invalid or the
    /// initial slots cannot be reserved.
    pub fn try_new(
        config: &EngineConfig,
        keys: Box<dyn KeySource>,
    ) -> Result<Self, ConstructionError> {
        config.validate()?;
        let slots = empty_slots(config.initial_capacity).ok_or(
            ConstructionError::TableAllocation {
                capacity: config.initial_capacity,
            },
        )?;
        Ok(Self {
            slots,
            len: 0,
            retired: HashSet::new(),
            max_capacity: config.max_capacity,
            keys,
        })
    }

    /// Take ownership of `segment`, assign it a fresh key and return the key.
    ///
    /// # Errors
    /// `AllocationFailed` if the key source is exhausted or the table would
    /// have to grow beyond its maximum capacity. The table is unchanged.
    pub fn insert(&mut self, mut segment: Segment) -> Result<u32, TrapKind> {
        let key = self.fresh_key()?;
        let idx = loop {
            let idx = slot_index(key, self.slots.len());
            if !matches!(self.slots.get(idx), Some(Some(_))) {
                break idx;
            }
            self.expand()?;
        };
        let slot = self.slots.get_mut(idx).ok_or(TrapKind::AllocationFailed)?;
        segment.set_key(key);
        *slot = Some(segment);
        self.len += 1;
        tracing::debug!(key, slot = idx, capacity = self.slots.len(), "inserted segment");
        Ok(key)
    }

    /// Look up a segment by key. Key 0 (null) never resolves.
    #[inline]
    pub fn get(&self, key: u32) -> Option<&Segment> {
        let idx = self.index_of(key)?;
        self.slots.get(idx)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, key: u32) -> Option<&mut Segment> {
        let idx = self.index_of(key)?;
        self.slots.get_mut(idx)?.as_mut()
    }

    #[inline]
    pub fn contains(&self, key: u32) -> bool {
        self.index_of(key).is_some()
    }

    /// Remove and return the segment stored under `key`, retiring the key.
    /// A slot holding a different key is left alone.
    pub fn remove(&mut self, key: u32) -> Option<Segment> {
        let idx = self.index_of(key)?;
        let removed = self.slots.get_mut(idx)?.take();
        if removed.is_some() {
            self.len -= 1;
            self.retired.insert(key);
            tracing::debug!(key, slot = idx, "removed segment");
        }
        removed
    }

    /// Whether `key` named a segment that has since been freed.
    #[inline]
    pub fn is_retired(&self, key: u32) -> bool {
        self.retired.contains(&key)
    }

    /// Number of keys retired so far.
    #[inline(always)]
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Drop every segment, releasing its storage, and retire its key.
    /// Capacity is kept.
    pub fn clear(&mut self) {
        if self.len == 0 {
            return;
        }
        for segment in self.slots.iter_mut().filter_map(Option::take) {
            self.retired.insert(segment.key());
        }
        tracing::debug!(entries = self.len, "cleared key table");
        self.len = 0;
    }

    /// Number of live segments.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of slots.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of segments not yet freed.
    #[inline(always)]
    pub fn live_count(&self) -> usize {
        self.len
    }

    /// All entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.slots.iter().flatten()
    }

    /// Slot holding `key`, if the table contains it.
    #[inline]
    fn index_of(&self, key: u32) -> Option<usize> {
        if key == 0 {
            return None;
        }
        let idx = slot_index(key, self.slots.len());
        match self.slots.get(idx) {
            Some(Some(seg)) if seg.key() == key => Some(idx),
            _ => None,
        }
    }

    /// Draw a nonzero key that is neither live nor retired.
    fn fresh_key(&mut self) -> Result<u32, TrapKind> {
        for _ in 0..KEY_DRAWS {
            let key = self.keys.next_key().ok_or(TrapKind::AllocationFailed)? & KEY_MASK;
            if key != 0 && !self.contains(key) && !self.is_retired(key) {
                return Ok(key);
            }
        }
        tracing::warn!(draws = KEY_DRAWS, "key source produced no usable key");
        Err(TrapKind::AllocationFailed)
    }

    /// Grow until every existing entry has a slot of its own, then move
    /// the entries over.
    fn expand(&mut self) -> Result<(), TrapKind> {
        let old_capacity = self.slots.len();
        let mut capacity = old_capacity;
        let mut attempts = 0u32;
        loop {
            capacity = grown_capacity(capacity)
                .filter(|&cap| cap <= self.max_capacity)
                .ok_or_else(|| {
                    tracing::warn!(
                        capacity = old_capacity,
                        max = self.max_capacity,
                        "key table cannot grow further"
                    );
                    TrapKind::AllocationFailed
                })?;
            attempts += 1;
            if is_collision_free(self.iter().map(Segment::key), capacity)? {
                break;
            }
        }

        let mut slots = empty_slots(capacity).ok_or(TrapKind::AllocationFailed)?;
        for segment in self.slots.drain(..).flatten() {
            if let Some(slot) = slots.get_mut(slot_index(segment.key(), capacity)) {
                *slot = Some(segment);
            }
        }
        self.slots = slots;
        tracing::debug!(
            from = old_capacity,
            to = capacity,
            attempts,
            "expanded key table"
        );
        Ok(())
    }
}

impl fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyTable")
            .field("len", &self.len)
            .field("retired", &self.retired.len())
            .field("capacity", &self.slots.len())
            .field("max_capacity", &self.max_capacity)
            .finish_non_exhaustive()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

#[inline(always)]
fn slot_index(key: u32, capacity: usize) -> usize {
    key as usize % capacity
}

#[inline(always)]
fn grown_capacity(capacity: usize) -> Option<usize> {
    capacity.checked_mul(2)?.checked_add(1)
}

fn empty_slots(capacity: usize) -> Option<Vec<Option<Segment>>> {
    let mut slots = Vec::new();
    slots.try_reserve_exact(capacity).ok()?;
    slots.resize_with(capacity, || None);
    Some(slots)
}

/// Whether `keys` land in pairwise distinct slots at `capacity`.
#[inline(never)]
fn is_collision_free(keys: impl Iterator<Item = u32>, capacity: usize) -> Result<bool, TrapKind> {
    let mut taken = Vec::new();
    taken
        .try_reserve_exact(capacity)
        .map_err(|_| TrapKind::AllocationFailed)?;
    taken.resize(capacity, false);
    for key in keys {
        match taken.get_mut(slot_index(key, capacity)) {
            Some(slot) if !*slot => *slot = true,
            _ => return Ok(false),
        }
    }
    Ok(true)
}


// ── Kani Formal Verification Proofs ──────────────────────────────────────

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: slot_index is always in range for a nonzero capacity.
    #[kani::proof]
    fn slot_index_in_range() {
        let key: u32 = kani::any();
        let capacity: usize = kani::any();
        kani::assume(capacity > 0);
        kani::assert(slot_index(key, capacity) < capacity, "slot index in range");
    }

    /// Proof: growth is strictly increasing or reports overflow.
    #[kani::proof]
    fn grown_capacity_increases() {
        let capacity: usize = kani::any();
        if let Some(next) = grown_capacity(capacity) {
            kani::assert(next > capacity, "capacity strictly grows");
        }
    }
}
