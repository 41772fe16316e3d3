//! Handle wire format — one 64-bit little-endian word per stored handle.
//!
//! ```text
//!  63   62   61 ............ 32   31 ............. 0
//! +----+----+------------------+--------------------+
//! | C  | S  |  segment key     |  offset (i32)      |
//! +----+----+------------------+--------------------+
//! C = corrupted, S = slice, key 0 = null
//! ```
//!
//! The all-zero word is the null handle. This layout is the only form in
//! which a handle crosses into ordinary integer memory.
//!
//! Decoding never fails: a word whose key was never issued decodes to a
//! handle marked corrupted, and the trap is deferred to the first
//! dereference. A retired key decodes to a stale handle that traps
//! `UseAfterFree`. A slice's narrowed window does not fit in the word, so a
//! bare decoded word spans its whole segment; the slice flag survives, so
//! it still cannot free the segment. `MemoryEngine::load_handle` restores
//! the stored window from the slot's handle tag.

use crate::handle::Handle;
use crate::key_table::{KeyTable, KEY_MASK};

pub const CORRUPTED_BIT: u64 = 1 << 63;
pub const SLICE_BIT: u64 = 1 << 62;
pub const KEY_SHIFT: u32 = 32;

/// Serialize `handle` into its wire word.
#[inline(never)]
pub fn encode(handle: &Handle) -> u64 {
    let mut word = (u64::from(handle.key() & KEY_MASK) << KEY_SHIFT)
        | u64::from(handle.offset() as u32);
    if handle.is_corrupted() {
        word |= CORRUPTED_BIT;
    }
    if handle.is_slice() {
        word |= SLICE_BIT;
    }
    word
}

/// Deserialize a wire word, resolving its key against `table`.
#[inline(never)]
pub fn decode(word: u64, table: &KeyTable) -> Handle {
    let key = (word >> KEY_SHIFT) as u32 & KEY_MASK;
    let offset = word as u32 as i32;
    let corrupted = word & CORRUPTED_BIT != 0;
    let slice = word & SLICE_BIT != 0;

    if key == 0 {
        return Handle::from_parts(0, (0, 0), offset, corrupted, slice);
    }
    match table.get(key) {
        Some(segment) => Handle::from_parts(
            key,
            (segment.base(), segment.bound()),
            offset,
            corrupted,
            slice,
        ),
        None if table.is_retired(key) => {
            Handle::from_parts(key, (0, 0), offset, corrupted, slice)
        }
        None => {
            tracing::debug!(word = format_args!("{word:#018x}"), "decoded handle with unknown key");
            Handle::from_parts(key, (0, 0), offset, true, slice)
        }
    }
}


// ── Kani Formal Verification Proofs ──────────────────────────────────────

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: the key field never spills into the flag bits.
    #[kani::proof]
    fn key_field_stays_in_place() {
        let key: u32 = kani::any();
        let offset: i32 = kani::any();
        let mut h = Handle::from_parts(key, (0, 0), offset, false, false);
        let word = encode(&h);
        kani::assert(word & (CORRUPTED_BIT | SLICE_BIT) == 0, "flags clear");
        kani::assert(word as u32 as i32 == offset, "offset in low word");
        h.mark_corrupted();
        kani::assert(encode(&h) & CORRUPTED_BIT != 0, "corrupted flag set");
    }
}
