//! A single heap allocation — the unit of `alloc` and `free`.
//!
//! Addressing is segment-relative: `base()` is always 0 and `bound()` is the
//! allocation size. A segment never validates handles or windows; all
//! policy lives in `Handle` and `MemoryEngine`. Byte access goes through
//! checked-slice helpers, so even a caller bug cannot index outside the
//! storage.
//!
//! Besides the bytes, a segment keeps **handle tags**: for every 8-byte slot
//! written by `store_handle`, the exact word stored and the window of the
//! stored handle. The word alone cannot carry a slice's window, so the tag
//! is what lets a loaded slice stay as narrow as the one stored. Plain
//! stores erase any tag they overlap, which is how a handle forged or
//! modified through integer stores is recognized as corrupted when loaded
//! back.

use std::collections::BTreeMap;

use crate::{TrapKind, HANDLE_BYTES};

/// What a handle store left in one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HandleTag {
    word: u64,
    window: (u32, u32),
}

/// One contiguous allocation plus its liveness state.
#[derive(Debug)]
pub struct Segment {
    key: u32,
    size: u32,
    /// `None` once freed: the storage is released, never reused.
    data: Option<Box<[u8]>>,
    /// Slot address → what a handle store wrote there.
    handle_tags: BTreeMap<u32, HandleTag>,
}

impl Segment {
    /// Reserve `byte_size` zeroed bytes.
    ///
    /// # Errors
    /// `AllocationFailed` if `byte_size` is zero or the host cannot reserve
    /// the storage.
    pub fn allocate(byte_size: u32) -> Result<Self, TrapKind> {
        if byte_size == 0 {
            return Err(TrapKind::AllocationFailed);
        }
        let len = byte_size as usize;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| TrapKind::AllocationFailed)?;
        bytes.resize(len, 0);
        Ok(Self {
            key: 0,
            size: byte_size,
            data: Some(bytes.into_boxed_slice()),
            handle_tags: BTreeMap::new(),
        })
    }

    /// Key assigned by the owning `KeyTable` (0 until inserted).
    #[inline(always)]
    pub fn key(&self) -> u32 {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: u32) {
        self.key = key;
    }

    #[inline(always)]
    pub fn base(&self) -> u32 {
        0
    }

    /// Exclusive end. Still reported after `free` so stale handles keep a
    /// well-formed window.
    #[inline(always)]
    pub fn bound(&self) -> u32 {
        self.size
    }

    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.data.is_none()
    }

    /// Mark the segment free and release its storage.
    ///
    /// # Errors
    /// `DoubleFree` if the segment was already released.
    pub fn free(&mut self) -> Result<(), TrapKind> {
        if self.data.take().is_none() {
            return Err(TrapKind::DoubleFree);
        }
        self.handle_tags.clear();
        Ok(())
    }

    /// Read `len` bytes at `addr`.
    pub fn read(&self, addr: u32, len: u32) -> Result<&[u8], TrapKind> {
        let data = self.data.as_deref().ok_or(TrapKind::UseAfterFree)?;
        checked_slice(data, addr, len)
    }

    /// Write `bytes` at `addr`, erasing any handle tag the write overlaps.
    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), TrapKind> {
        let len = u32::try_from(bytes.len()).map_err(|_| TrapKind::OutOfBounds)?;
        let data = self.data.as_deref_mut().ok_or(TrapKind::UseAfterFree)?;
        checked_slice_mut(data, addr, len)?.copy_from_slice(bytes);
        clear_tags(&mut self.handle_tags, addr, len);
        Ok(())
    }

    /// Write a serialized handle and tag the slot with it and the window
    /// of the handle it encodes.
    pub fn write_handle_word(
        &mut self,
        addr: u32,
        word: u64,
        window: (u32, u32),
    ) -> Result<(), TrapKind> {
        self.write(addr, &word.to_le_bytes())?;
        self.handle_tags.insert(addr, HandleTag { word, window });
        Ok(())
    }

    /// Read a serialized handle. The window is returned only if the slot
    /// still holds exactly the word a handle store put there.
    pub fn read_handle_word(&self, addr: u32) -> Result<(u64, Option<(u32, u32)>), TrapKind> {
        let bytes = self.read(addr, HANDLE_BYTES)?;
        let word = u64::from_le_bytes(bytes.try_into().map_err(|_| TrapKind::OutOfBounds)?);
        let window = self
            .handle_tags
            .get(&addr)
            .filter(|tag| tag.word == word)
            .map(|tag| tag.window);
        Ok((word, window))
    }

    /// Number of slots currently holding an intact stored handle.
    pub fn tagged_slots(&self) -> usize {
        self.handle_tags.len()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Bounds-check and return `memory[addr..addr+len]`. Never panics.
#[inline(always)]
fn checked_slice(memory: &[u8], addr: u32, len: u32) -> Result<&[u8], TrapKind> {
    let start = addr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or(TrapKind::OutOfBounds)?;
    memory.get(start..end).ok_or(TrapKind::OutOfBounds)
}

/// Mutable variant of `checked_slice`.
#[inline(always)]
fn checked_slice_mut(memory: &mut [u8], addr: u32, len: u32) -> Result<&mut [u8], TrapKind> {
    let start = addr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or(TrapKind::OutOfBounds)?;
    memory.get_mut(start..end).ok_or(TrapKind::OutOfBounds)
}

/// Drop every tag whose 8-byte slot intersects `[addr, addr + len)`.
#[inline(never)]
fn clear_tags(tags: &mut BTreeMap<u32, HandleTag>, addr: u32, len: u32) {
    if tags.is_empty() || len == 0 {
        return;
    }
    let first = addr.saturating_sub(HANDLE_BYTES - 1);
    let end = u64::from(addr) + u64::from(len);
    let stale: Vec<u32> = tags
        .range(first..)
        .map(|(&slot, _)| slot)
        .take_while(|&slot| u64::from(slot) < end)
        .collect();
    for slot in stale {
        tags.remove(&slot);
    }
}
