//! Capability handles — bounds-carrying references into a segment.
//!
//! A handle names its segment by key only; it never owns storage and has
//! no destructor effect. Every dereference is validated in a fixed order:
//!
//! 1. `CorruptedHandle` — the handle came out of memory damaged
//! 2. `NullHandle` — key 0
//! 3. `UseAfterFree` — the key is unknown or its segment was freed (retired)
//! 4. `OutOfBounds` — `offset < 0` or `offset + size` past the window
//!
//! Corruption is checked first because it is the stronger violation and
//! must never be reported as a mere bounds error.
//!
//! Pointer arithmetic only moves the cursor and never traps: an
//! out-of-window handle is legal to hold, only using it traps.

use core::fmt;

use crate::key_table::KeyTable;
use crate::segment::Segment;
use crate::TrapKind;

/// A capability into one segment: key, accessible window, cursor and flags.
///
/// The window `base..bound` is segment-relative and always lies within
/// the segment. Addresses are `base + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    key: u32,
    base: u32,
    bound: u32,
    offset: i32,
    corrupted: bool,
    slice: bool,
}

impl Handle {
    /// The null handle: key 0, empty window.
    pub const NULL: Handle = Handle {
        key: 0,
        base: 0,
        bound: 0,
        offset: 0,
        corrupted: false,
        slice: false,
    };

    /// Handle to a whole, freshly allocated segment.
    pub(crate) fn for_segment(key: u32, size: u32) -> Self {
        Self {
            key,
            base: 0,
            bound: size,
            ..Self::NULL
        }
    }

    /// Rebuild a handle from its decoded parts.
    pub(crate) fn from_parts(
        key: u32,
        window: (u32, u32),
        offset: i32,
        corrupted: bool,
        slice: bool,
    ) -> Self {
        Self {
            key,
            base: window.0,
            bound: window.1,
            offset,
            corrupted,
            slice,
        }
    }

    /// Same handle with its window replaced by one recorded when it was
    /// stored.
    pub(crate) fn with_window(self, window: (u32, u32)) -> Self {
        Self {
            base: window.0,
            bound: window.1,
            ..self
        }
    }

    /// Key of the referenced segment (0 for null).
    #[inline(always)]
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Accessible range `(base, bound)` within the segment.
    #[inline(always)]
    pub fn window(&self) -> (u32, u32) {
        (self.base, self.bound)
    }

    /// Bytes between window base and bound.
    #[inline(always)]
    pub fn window_len(&self) -> u32 {
        self.bound.saturating_sub(self.base)
    }

    #[inline(always)]
    pub fn offset(&self) -> i32 {
        self.offset
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.key == 0
    }

    #[inline(always)]
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    #[inline(always)]
    pub fn is_slice(&self) -> bool {
        self.slice
    }

    /// Copy with the same segment and window; its cursor moves independently.
    #[inline(always)]
    pub fn duplicate(&self) -> Handle {
        *self
    }

    /// Mark as corrupted. Sticky: no operation clears it.
    #[inline(always)]
    pub fn mark_corrupted(&mut self) {
        self.corrupted = true;
    }

    /// Move the cursor forward by `delta` bytes (wrapping). Never traps.
    #[inline(always)]
    pub fn add_offset(&mut self, delta: i32) {
        self.offset = self.offset.wrapping_add(delta);
    }

    /// Move the cursor back by `delta` bytes (wrapping). Never traps.
    #[inline(always)]
    pub fn sub_offset(&mut self, delta: i32) {
        self.offset = self.offset.wrapping_sub(delta);
    }

    /// Check that an access of `access_size` bytes through this handle is
    /// allowed right now.
    pub fn validate(&self, table: &KeyTable, access_size: u32) -> Result<(), TrapKind> {
        self.resolve(table, access_size).map(|_| ())
    }

    /// Validate and return the segment plus the segment-relative address.
    pub(crate) fn resolve<'t>(
        &self,
        table: &'t KeyTable,
        access_size: u32,
    ) -> Result<(&'t Segment, u32), TrapKind> {
        self.check_identity()?;
        let segment = live(table.get(self.key))?;
        let addr = self.address(access_size)?;
        Ok((segment, addr))
    }

    /// Mutable variant of `resolve`.
    pub(crate) fn resolve_mut<'t>(
        &self,
        table: &'t mut KeyTable,
        access_size: u32,
    ) -> Result<(&'t mut Segment, u32), TrapKind> {
        self.check_identity()?;
        let segment = table
            .get_mut(self.key)
            .filter(|seg| !seg.is_free())
            .ok_or(TrapKind::UseAfterFree)?;
        let addr = self.address(access_size)?;
        Ok((segment, addr))
    }

    /// Narrow the window to `[base_off, bound_off)` relative to this
    /// handle's window. The result shares the segment, is marked as a
    /// slice and starts at cursor 0.
    pub fn slice(&self, table: &KeyTable, base_off: i32, bound_off: i32) -> Result<Handle, TrapKind> {
        self.check_identity()?;
        live(table.get(self.key))?;
        let (base, bound) = narrow(self.base, self.bound, base_off, bound_off)?;
        Ok(Handle {
            key: self.key,
            base,
            bound,
            offset: 0,
            corrupted: false,
            slice: true,
        })
    }

    /// Free the referenced segment and retire its key.
    ///
    /// Freeing null is a no-op. Slices can never free their segment.
    pub fn free(&self, table: &mut KeyTable) -> Result<(), TrapKind> {
        if self.corrupted {
            return Err(TrapKind::CorruptedHandle);
        }
        if self.is_null() {
            return Ok(());
        }
        if self.slice {
            return Err(TrapKind::InvalidFree);
        }
        table
            .remove(self.key)
            .ok_or(TrapKind::UseAfterFree)?
            .free()
    }

    #[inline(always)]
    fn check_identity(&self) -> Result<(), TrapKind> {
        if self.corrupted {
            return Err(TrapKind::CorruptedHandle);
        }
        if self.is_null() {
            return Err(TrapKind::NullHandle);
        }
        Ok(())
    }

    #[inline(always)]
    fn address(&self, access_size: u32) -> Result<u32, TrapKind> {
        window_address(self.base, self.bound, self.offset, access_size)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::NULL
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() && !self.corrupted {
            return write!(f, "handle(null, offset {})", self.offset);
        }
        write!(
            f,
            "handle(key {:#x}, window [{}, {}), offset {}",
            self.key, self.base, self.bound, self.offset
        )?;
        if self.corrupted {
            f.write_str(", corrupted")?;
        }
        if self.slice {
            f.write_str(", slice")?;
        }
        f.write_str(")")
    }
}

// ── Non-generic inner functions ──────────────────────────────────────
//
// No unwrap(), no indexing, no panic paths. Arithmetic is done in i64 so
// no combination of u32 window and i32 cursor can overflow.

#[inline(always)]
fn live(segment: Option<&Segment>) -> Result<&Segment, TrapKind> {
    segment
        .filter(|seg| !seg.is_free())
        .ok_or(TrapKind::UseAfterFree)
}

/// Segment-relative address of an `access_size`-byte access, or
/// `OutOfBounds` unless `0 <= offset` and `offset + access_size <= bound - base`.
#[inline(never)]
fn window_address(base: u32, bound: u32, offset: i32, access_size: u32) -> Result<u32, TrapKind> {
    let len = i64::from(bound) - i64::from(base);
    let offset = i64::from(offset);
    if offset < 0 || offset + i64::from(access_size) > len {
        return Err(TrapKind::OutOfBounds);
    }
    u32::try_from(i64::from(base) + offset).map_err(|_| TrapKind::OutOfBounds)
}

/// Sub-window `[base + base_off, base + bound_off)` of `[base, bound)`.
#[inline(never)]
fn narrow(base: u32, bound: u32, base_off: i32, bound_off: i32) -> Result<(u32, u32), TrapKind> {
    let len = i64::from(bound) - i64::from(base);
    let (lo, hi) = (i64::from(base_off), i64::from(bound_off));
    if lo < 0 || hi < lo || hi > len {
        return Err(TrapKind::InvalidSlice);
    }
    let new_base = u32::try_from(i64::from(base) + lo).map_err(|_| TrapKind::InvalidSlice)?;
    let new_bound = u32::try_from(i64::from(base) + hi).map_err(|_| TrapKind::InvalidSlice)?;
    Ok((new_base, new_bound))
}


// ── Kani Formal Verification Proofs ──────────────────────────────────────

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: window_address never panics and a successful result lies
    /// within the window.
    #[kani::proof]
    fn window_address_sound() {
        let base: u32 = kani::any();
        let bound: u32 = kani::any();
        let offset: i32 = kani::any();
        let size: u32 = kani::any();
        kani::assume(base <= bound);

        if let Ok(addr) = window_address(base, bound, offset, size) {
            kani::assert(offset >= 0, "successful access has nonnegative cursor");
            kani::assert(addr >= base, "address not below window");
            kani::assert(
                u64::from(addr) + u64::from(size) <= u64::from(bound),
                "access ends within window",
            );
        }
    }

    /// Proof: narrow never widens the parent window.
    #[kani::proof]
    fn narrow_stays_within_parent() {
        let base: u32 = kani::any();
        let bound: u32 = kani::any();
        let lo: i32 = kani::any();
        let hi: i32 = kani::any();
        kani::assume(base <= bound);

        if let Ok((new_base, new_bound)) = narrow(base, bound, lo, hi) {
            kani::assert(base <= new_base, "slice starts inside parent");
            kani::assert(new_base <= new_bound, "slice is not inverted");
            kani::assert(new_bound <= bound, "slice ends inside parent");
        }
    }
}
