//! Segment memory engine — `MemoryEngine`.
//!
//! The façade the interpreter calls for every handle operation. It owns
//! (or shares, after `duplicate`) one `KeyTable`, delegates validation to
//! `Handle`, and is the single place a `TrapKind` becomes a `Trap` with
//! operation name, location, handle state and access size attached.
//!
//! Load/store operations use the **outline pattern**: the typed public
//! methods are thin wrappers over a `[u8; N]` read or write, which in turn
//! delegates to one non-generic inner function holding all of the checks.
//!
//! Segment memory is not a flat address space. `grow`, `copy` and
//! `as_contiguous_buffer` exist only to refuse the operations a linear
//! memory would offer.
//!
//! The engine is single-threaded: the table is shared through
//! `Rc<RefCell<_>>`, so an engine is neither `Send` nor `Sync`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::codec;
use crate::handle::Handle;
use crate::key_table::KeyTable;
use crate::keys::{KeySource, OsKeys};
use crate::segment::Segment;
use crate::value::{LoadOp, StoreOp, Value};
use crate::{
    ConstructionError, EngineConfig, Location, Trap, TrapKind, TrapResult, HANDLE_BYTES,
};

/// Validated load/store/alloc/free/slice over capability handles.
#[derive(Debug)]
pub struct MemoryEngine {
    table: Rc<RefCell<KeyTable>>,
    config: EngineConfig,
}

impl MemoryEngine {
    /// Create an engine with its own key table, drawing keys from the
    /// operating system's random number generator.
    ///
    /// # Errors
    /// Returns `ConstructionError` if `config` is invalid or no entropy
    /// source is available.
    #[inline(never)]
    pub fn try_new(config: EngineConfig) -> Result<Self, ConstructionError> {
        let keys = OsKeys::probe().map_err(ConstructionError::Entropy)?;
        Self::with_key_source(config, Box::new(keys))
    }

    /// Create an engine drawing segment keys from `keys`.
    ///
    /// # Errors
    /// Returns `ConstructionError` if `config` is invalid.
    #[inline(never)]
    pub fn with_key_source(
        config: EngineConfig,
        keys: Box<dyn KeySource>,
    ) -> Result<Self, ConstructionError> {
        let table = KeyTable::try_new(&config, keys)?;
        Ok(Self {
            table: Rc::new(RefCell::new(table)),
            config,
        })
    }

    /// A second façade over the **same** key table. Segments allocated or
    /// freed through either engine are visible through both.
    pub fn duplicate(&self) -> MemoryEngine {
        MemoryEngine {
            table: Rc::clone(&self.table),
            config: self.config,
        }
    }

    /// Whether `self` and `other` operate on the same key table.
    pub fn shares_table_with(&self, other: &MemoryEngine) -> bool {
        Rc::ptr_eq(&self.table, &other.table)
    }

    #[inline(always)]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of allocated segments not yet freed.
    pub fn live_segments(&self) -> usize {
        self.table.borrow().live_count()
    }

    /// Run `f` with read access to the key table.
    pub fn inspect_table<R>(&self, f: impl FnOnce(&KeyTable) -> R) -> R {
        f(&self.table.borrow())
    }

    /// Drop every segment and release its storage. Affects all duplicates.
    /// Handles that outlive a reset trap `UseAfterFree` on dereference.
    pub fn reset(&self) {
        self.table.borrow_mut().clear();
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate a zeroed segment of `size` bytes and return a handle to
    /// all of it.
    pub fn allocate(&self, loc: Location, size: u32) -> TrapResult<Handle> {
        const OP: &str = "segment.alloc";
        if size > self.config.max_segment_size {
            return Err(trap(TrapKind::AllocationFailed, OP, loc, Handle::NULL, size));
        }
        let segment =
            Segment::allocate(size).map_err(|kind| trap(kind, OP, loc, Handle::NULL, size))?;
        let key = self
            .table
            .borrow_mut()
            .insert(segment)
            .map_err(|kind| trap(kind, OP, loc, Handle::NULL, size))?;
        tracing::trace!(key, size, %loc, "allocated segment");
        Ok(Handle::for_segment(key, size))
    }

    /// Free the segment `handle` refers to. Every handle sharing its key,
    /// slices included, becomes permanently invalid.
    pub fn free(&self, loc: Location, handle: Handle) -> TrapResult<()> {
        handle
            .free(&mut self.table.borrow_mut())
            .map_err(|kind| trap(kind, "segment.free", loc, handle, 0))?;
        tracing::trace!(key = handle.key(), %loc, "freed segment");
        Ok(())
    }

    /// Derive a slice handle with window `[base, bound)` relative to
    /// `handle`'s window.
    pub fn slice(&self, loc: Location, handle: Handle, base: i32, bound: i32) -> TrapResult<Handle> {
        let size = u32::try_from(i64::from(bound) - i64::from(base)).unwrap_or(0);
        let sliced = handle
            .slice(&self.table.borrow(), base, bound)
            .map_err(|kind| trap(kind, "segment.slice", loc, handle, size))?;
        tracing::trace!(key = handle.key(), base, bound, %loc, "sliced segment");
        Ok(sliced)
    }

    /// `handle.add`: advance the cursor. Never traps.
    #[inline(always)]
    pub fn add_offset(&self, mut handle: Handle, delta: i32) -> Handle {
        handle.add_offset(delta);
        handle
    }

    /// `handle.sub`: move the cursor back. Never traps.
    #[inline(always)]
    pub fn sub_offset(&self, mut handle: Handle, delta: i32) -> Handle {
        handle.sub_offset(delta);
        handle
    }

    // ── Codec ─────────────────────────────────────────────────────────

    /// Wire word for `handle` (see `codec`).
    #[inline(always)]
    pub fn encode(&self, handle: &Handle) -> u64 {
        codec::encode(handle)
    }

    /// Handle for a wire word. Never fails; unknown keys yield a handle
    /// marked corrupted.
    pub fn decode(&self, word: u64) -> Handle {
        codec::decode(word, &self.table.borrow())
    }

    // ── Bounds-checked load ───────────────────────────────────────────

    #[inline(always)]
    pub fn load_i32(&self, loc: Location, h: Handle) -> TrapResult<i32> {
        self.read(loc, LoadOp::I32, h).map(i32::from_le_bytes)
    }

    #[inline(always)]
    pub fn load_i64(&self, loc: Location, h: Handle) -> TrapResult<i64> {
        self.read(loc, LoadOp::I64, h).map(i64::from_le_bytes)
    }

    #[inline(always)]
    pub fn load_f32(&self, loc: Location, h: Handle) -> TrapResult<f32> {
        self.read(loc, LoadOp::F32, h).map(f32::from_le_bytes)
    }

    #[inline(always)]
    pub fn load_f64(&self, loc: Location, h: Handle) -> TrapResult<f64> {
        self.read(loc, LoadOp::F64, h).map(f64::from_le_bytes)
    }

    #[inline(always)]
    pub fn load_i32_8s(&self, loc: Location, h: Handle) -> TrapResult<i32> {
        self.read(loc, LoadOp::I32_8S, h)
            .map(|b| i32::from(i8::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i32_8u(&self, loc: Location, h: Handle) -> TrapResult<i32> {
        self.read(loc, LoadOp::I32_8U, h)
            .map(|b| i32::from(u8::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i32_16s(&self, loc: Location, h: Handle) -> TrapResult<i32> {
        self.read(loc, LoadOp::I32_16S, h)
            .map(|b| i32::from(i16::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i32_16u(&self, loc: Location, h: Handle) -> TrapResult<i32> {
        self.read(loc, LoadOp::I32_16U, h)
            .map(|b| i32::from(u16::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i64_8s(&self, loc: Location, h: Handle) -> TrapResult<i64> {
        self.read(loc, LoadOp::I64_8S, h)
            .map(|b| i64::from(i8::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i64_8u(&self, loc: Location, h: Handle) -> TrapResult<i64> {
        self.read(loc, LoadOp::I64_8U, h)
            .map(|b| i64::from(u8::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i64_16s(&self, loc: Location, h: Handle) -> TrapResult<i64> {
        self.read(loc, LoadOp::I64_16S, h)
            .map(|b| i64::from(i16::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i64_16u(&self, loc: Location, h: Handle) -> TrapResult<i64> {
        self.read(loc, LoadOp::I64_16U, h)
            .map(|b| i64::from(u16::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i64_32s(&self, loc: Location, h: Handle) -> TrapResult<i64> {
        self.read(loc, LoadOp::I64_32S, h)
            .map(|b| i64::from(i32::from_le_bytes(b)))
    }

    #[inline(always)]
    pub fn load_i64_32u(&self, loc: Location, h: Handle) -> TrapResult<i64> {
        self.read(loc, LoadOp::I64_32U, h)
            .map(|b| i64::from(u32::from_le_bytes(b)))
    }

    /// Load a handle stored by `store_handle`.
    ///
    /// The loaded handle keeps the window it was stored with, so a slice
    /// never widens by passing through memory. Never traps on the loaded
    /// word itself: an unknown key, or a slot whose bytes were changed by
    /// anything other than a handle store, yields a handle marked
    /// corrupted. An all-zero word is null.
    pub fn load_handle(&self, loc: Location, h: Handle) -> TrapResult<Handle> {
        let table = self.table.borrow();
        let (word, window) = h
            .resolve(&table, HANDLE_BYTES)
            .and_then(|(segment, addr)| segment.read_handle_word(addr))
            .map_err(|kind| trap(kind, LoadOp::Handle.name(), loc, h, HANDLE_BYTES))?;
        let loaded = codec::decode(word, &table);
        match window {
            Some(window) if !loaded.is_null() => Ok(loaded.with_window(window)),
            Some(_) => Ok(loaded),
            None if word == 0 || loaded.is_corrupted() => Ok(loaded),
            None => {
                tracing::debug!(
                    word = format_args!("{word:#018x}"),
                    %loc,
                    "handle slot altered by a data store"
                );
                let mut loaded = loaded;
                loaded.mark_corrupted();
                Ok(loaded)
            }
        }
    }

    // ── Bounds-checked store ──────────────────────────────────────────

    #[inline(always)]
    pub fn store_i32(&self, loc: Location, h: Handle, value: i32) -> TrapResult<()> {
        self.write(loc, StoreOp::I32, h, value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_i64(&self, loc: Location, h: Handle, value: i64) -> TrapResult<()> {
        self.write(loc, StoreOp::I64, h, value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_f32(&self, loc: Location, h: Handle, value: f32) -> TrapResult<()> {
        self.write(loc, StoreOp::F32, h, value.to_le_bytes())
    }

    #[inline(always)]
    pub fn store_f64(&self, loc: Location, h: Handle, value: f64) -> TrapResult<()> {
        self.write(loc, StoreOp::F64, h, value.to_le_bytes())
    }

    /// `i32.store8`: low byte of `value`.
    #[inline(always)]
    pub fn store_i32_8(&self, loc: Location, h: Handle, value: i32) -> TrapResult<()> {
        self.write(loc, StoreOp::I32_8, h, (value as u8).to_le_bytes())
    }

    #[inline(always)]
    pub fn store_i32_16(&self, loc: Location, h: Handle, value: i32) -> TrapResult<()> {
        self.write(loc, StoreOp::I32_16, h, (value as u16).to_le_bytes())
    }

    #[inline(always)]
    pub fn store_i64_8(&self, loc: Location, h: Handle, value: i64) -> TrapResult<()> {
        self.write(loc, StoreOp::I64_8, h, (value as u8).to_le_bytes())
    }

    #[inline(always)]
    pub fn store_i64_16(&self, loc: Location, h: Handle, value: i64) -> TrapResult<()> {
        self.write(loc, StoreOp::I64_16, h, (value as u16).to_le_bytes())
    }

    #[inline(always)]
    pub fn store_i64_32(&self, loc: Location, h: Handle, value: i64) -> TrapResult<()> {
        self.write(loc, StoreOp::I64_32, h, (value as u32).to_le_bytes())
    }

    /// Serialize `value` into the 8 bytes at `dst` and tag the slot as
    /// holding a handle.
    pub fn store_handle(&self, loc: Location, dst: Handle, value: Handle) -> TrapResult<()> {
        let word = codec::encode(&value);
        let mut table = self.table.borrow_mut();
        dst.resolve_mut(&mut table, HANDLE_BYTES)
            .and_then(|(segment, addr)| segment.write_handle_word(addr, word, value.window()))
            .map_err(|kind| trap(kind, StoreOp::Handle.name(), loc, dst, HANDLE_BYTES))
    }

    // ── Generic dispatch over `Value` ─────────────────────────────────

    /// Execute the load instruction `op` through `h`.
    pub fn load(&self, loc: Location, h: Handle, op: LoadOp) -> TrapResult<Value> {
        Ok(match op {
            LoadOp::I32 => Value::I32(self.load_i32(loc, h)?),
            LoadOp::I64 => Value::I64(self.load_i64(loc, h)?),
            LoadOp::F32 => Value::F32(self.load_f32(loc, h)?),
            LoadOp::F64 => Value::F64(self.load_f64(loc, h)?),
            LoadOp::I32_8S => Value::I32(self.load_i32_8s(loc, h)?),
            LoadOp::I32_8U => Value::I32(self.load_i32_8u(loc, h)?),
            LoadOp::I32_16S => Value::I32(self.load_i32_16s(loc, h)?),
            LoadOp::I32_16U => Value::I32(self.load_i32_16u(loc, h)?),
            LoadOp::I64_8S => Value::I64(self.load_i64_8s(loc, h)?),
            LoadOp::I64_8U => Value::I64(self.load_i64_8u(loc, h)?),
            LoadOp::I64_16S => Value::I64(self.load_i64_16s(loc, h)?),
            LoadOp::I64_16U => Value::I64(self.load_i64_16u(loc, h)?),
            LoadOp::I64_32S => Value::I64(self.load_i64_32s(loc, h)?),
            LoadOp::I64_32U => Value::I64(self.load_i64_32u(loc, h)?),
            LoadOp::Handle => Value::Handle(self.load_handle(loc, h)?),
        })
    }

    /// Execute the store instruction `op` through `h`.
    ///
    /// Traps `OperandTypeMismatch` if `value` is not the operand type `op`
    /// expects; memory is left untouched.
    pub fn store(&self, loc: Location, h: Handle, op: StoreOp, value: Value) -> TrapResult<()> {
        match (op, value) {
            (StoreOp::I32, Value::I32(v)) => self.store_i32(loc, h, v),
            (StoreOp::I32_8, Value::I32(v)) => self.store_i32_8(loc, h, v),
            (StoreOp::I32_16, Value::I32(v)) => self.store_i32_16(loc, h, v),
            (StoreOp::I64, Value::I64(v)) => self.store_i64(loc, h, v),
            (StoreOp::I64_8, Value::I64(v)) => self.store_i64_8(loc, h, v),
            (StoreOp::I64_16, Value::I64(v)) => self.store_i64_16(loc, h, v),
            (StoreOp::I64_32, Value::I64(v)) => self.store_i64_32(loc, h, v),
            (StoreOp::F32, Value::F32(v)) => self.store_f32(loc, h, v),
            (StoreOp::F64, Value::F64(v)) => self.store_f64(loc, h, v),
            (StoreOp::Handle, Value::Handle(v)) => self.store_handle(loc, h, v),
            _ => Err(trap(
                TrapKind::OperandTypeMismatch,
                op.name(),
                loc,
                h,
                op.width(),
            )),
        }
    }

    // ── Flat-memory operations (always refused) ───────────────────────

    /// `memory.grow` has no meaning for segment memory.
    pub fn grow(&self, loc: Location, extra: u32) -> TrapResult<i32> {
        Err(trap(
            TrapKind::UnsupportedOperation,
            "memory.grow",
            loc,
            Handle::NULL,
            extra,
        ))
    }

    /// `memory.copy` assumes one flat address space; segments have none.
    pub fn copy(&self, loc: Location, dst: Handle, _src: Handle, len: u32) -> TrapResult<()> {
        Err(trap(TrapKind::UnsupportedOperation, "memory.copy", loc, dst, len))
    }

    /// There is no contiguous buffer behind segment memory.
    pub fn as_contiguous_buffer(&self, loc: Location) -> TrapResult<&[u8]> {
        Err(trap(
            TrapKind::UnsupportedOperation,
            "memory.flatten",
            loc,
            Handle::NULL,
            0,
        ))
    }

    // ── Raw byte access ───────────────────────────────────────────────

    #[inline(always)]
    fn read<const N: usize>(&self, loc: Location, op: LoadOp, h: Handle) -> TrapResult<[u8; N]> {
        let mut buf = [0u8; N];
        read_inner(&self.table.borrow(), h, &mut buf)
            .map_err(|kind| trap(kind, op.name(), loc, h, op.width()))?;
        Ok(buf)
    }

    #[inline(always)]
    fn write<const N: usize>(
        &self,
        loc: Location,
        op: StoreOp,
        h: Handle,
        bytes: [u8; N],
    ) -> TrapResult<()> {
        write_inner(&mut self.table.borrow_mut(), h, &bytes)
            .map_err(|kind| trap(kind, op.name(), loc, h, op.width()))
    }
}

// ── Non-generic inner functions (outline pattern) ─────────────────────
//
// ONE copy of the checks, regardless of access width.

#[inline(never)]
fn read_inner(table: &KeyTable, h: Handle, dst: &mut [u8]) -> Result<(), TrapKind> {
    let len = u32::try_from(dst.len()).map_err(|_| TrapKind::OutOfBounds)?;
    let (segment, addr) = h.resolve(table, len)?;
    let src = segment.read(addr, len)?;
    dst.copy_from_slice(src);
    Ok(())
}

#[inline(never)]
fn write_inner(table: &mut KeyTable, h: Handle, src: &[u8]) -> Result<(), TrapKind> {
    let len = u32::try_from(src.len()).map_err(|_| TrapKind::OutOfBounds)?;
    let (segment, addr) = h.resolve_mut(table, len)?;
    segment.write(addr, src)
}

/// Attach context to a trap kind.
#[inline(never)]
fn trap(kind: TrapKind, op: &'static str, location: Location, handle: Handle, size: u32) -> Trap {
    tracing::debug!(%kind, op, %location, %handle, size, "trap");
    Trap {
        kind,
        op,
        location,
        handle,
        size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{FixedKeys, SeededKeys};

    const LOC: Location = Location::new(0, 0);

    fn engine() -> MemoryEngine {
        MemoryEngine::with_key_source(EngineConfig::default(), Box::new(SeededKeys::new(7)))
            .unwrap()
    }

    fn kind<T: core::fmt::Debug>(result: TrapResult<T>) -> TrapKind {
        result.unwrap_err().kind()
    }

    // ── allocate ──

    #[test]
    fn allocate_returns_whole_segment_handle() {
        let e = engine();
        let h = e.allocate(LOC, 16).unwrap();
        assert_ne!(h.key(), 0);
        assert_eq!(h.window(), (0, 16));
        assert_eq!(e.live_segments(), 1);
    }

    #[test]
    fn allocate_zero_traps() {
        let e = engine();
        assert_eq!(kind(e.allocate(LOC, 0)), TrapKind::AllocationFailed);
    }

    #[test]
    fn allocate_above_limit_traps() {
        let config = EngineConfig {
            max_segment_size: 64,
            ..EngineConfig::default()
        };
        let e = MemoryEngine::with_key_source(config, Box::new(SeededKeys::new(1))).unwrap();
        assert!(e.allocate(LOC, 64).is_ok());
        let trap = e.allocate(LOC, 65).unwrap_err();
        assert_eq!(trap.kind, TrapKind::AllocationFailed);
        assert_eq!(trap.size, 65);
        assert_eq!(trap.op, "segment.alloc");
    }

    #[test]
    fn allocate_with_exhausted_keys_traps() {
        let e = MemoryEngine::with_key_source(EngineConfig::default(), Box::new(FixedKeys::new([3])))
            .unwrap();
        assert!(e.allocate(LOC, 4).is_ok());
        assert_eq!(kind(e.allocate(LOC, 4)), TrapKind::AllocationFailed);
        assert_eq!(e.live_segments(), 1);
    }

    // ── typed load/store ──

    #[test]
    fn store_load_i32_roundtrip() {
        let e = engine();
        let h = e.allocate(LOC, 16).unwrap();
        e.store_i32(LOC, h, 0x12345678).unwrap();
        assert_eq!(e.load_i32(LOC, h), Ok(0x12345678));
    }

    #[test]
    fn store_load_i64_roundtrip() {
        let e = engine();
        let h = e.allocate(LOC, 16).unwrap();
        let h8 = e.add_offset(h, 8);
        e.store_i64(LOC, h8, 0x0102030405060708).unwrap();
        assert_eq!(e.load_i64(LOC, h8), Ok(0x0102030405060708));
    }

    #[test]
    fn store_load_floats() {
        let e = engine();
        let h = e.allocate(LOC, 12).unwrap();
        e.store_f32(LOC, h, core::f32::consts::PI).unwrap();
        let h4 = e.add_offset(h, 4);
        e.store_f64(LOC, h4, core::f64::consts::E).unwrap();
        assert_eq!(e.load_f32(LOC, h), Ok(core::f32::consts::PI));
        assert_eq!(e.load_f64(LOC, h4), Ok(core::f64::consts::E));
    }

    #[test]
    fn i32_is_little_endian() {
        let e = engine();
        let h = e.allocate(LOC, 4).unwrap();
        e.store_i32(LOC, h, 0x04030201).unwrap();
        for i in 0..4 {
            assert_eq!(e.load_i32_8u(LOC, e.add_offset(h, i)), Ok(i + 1));
        }
    }

    #[test]
    fn narrow_loads_extend() {
        let e = engine();
        let h = e.allocate(LOC, 8).unwrap();
        e.store_i64(LOC, h, -1).unwrap();
        assert_eq!(e.load_i32_8s(LOC, h), Ok(-1));
        assert_eq!(e.load_i32_8u(LOC, h), Ok(0xFF));
        assert_eq!(e.load_i32_16s(LOC, h), Ok(-1));
        assert_eq!(e.load_i32_16u(LOC, h), Ok(0xFFFF));
        assert_eq!(e.load_i64_8s(LOC, h), Ok(-1));
        assert_eq!(e.load_i64_8u(LOC, h), Ok(0xFF));
        assert_eq!(e.load_i64_16s(LOC, h), Ok(-1));
        assert_eq!(e.load_i64_16u(LOC, h), Ok(0xFFFF));
        assert_eq!(e.load_i64_32s(LOC, h), Ok(-1));
        assert_eq!(e.load_i64_32u(LOC, h), Ok(0xFFFF_FFFF));
    }

    #[test]
    fn narrow_stores_truncate() {
        let e = engine();
        let h = e.allocate(LOC, 8).unwrap();
        e.store_i32_8(LOC, h, 0x1FF).unwrap();
        assert_eq!(e.load_i64(LOC, h), Ok(0xFF));
        e.store_i32_16(LOC, h, 0x12_3456).unwrap();
        assert_eq!(e.load_i64(LOC, h), Ok(0x3456));
        e.store_i64_8(LOC, h, -2).unwrap();
        assert_eq!(e.load_i64(LOC, h), Ok(0x34FE));
        e.store_i64_16(LOC, h, 0x7_0001).unwrap();
        assert_eq!(e.load_i64(LOC, h), Ok(0x0001));
        e.store_i64_32(LOC, h, 0x1_8000_0000).unwrap();
        assert_eq!(e.load_i64(LOC, h), Ok(0x8000_0000));
    }

    #[test]
    fn access_past_window_traps_with_context() {
        let e = engine();
        let h = e.allocate(LOC, 16).unwrap();
        let h13 = e.add_offset(h, 13);
        let trap = e.load_i32(Location::new(2, 0x40), h13).unwrap_err();
        assert_eq!(trap.kind, TrapKind::OutOfBounds);
        assert_eq!(trap.op, "i32.load");
        assert_eq!(trap.handle, h13);
        assert_eq!(trap.size, 4);
        assert_eq!(trap.location, Location::new(2, 0x40));
        assert!(e.load_i32_8u(LOC, e.add_offset(h, 15)).is_ok());
    }

    #[test]
    fn failed_store_leaves_memory_untouched() {
        let e = engine();
        let h = e.allocate(LOC, 4).unwrap();
        e.store_i32(LOC, h, 7).unwrap();
        assert!(e.store_i64(LOC, h, -1).is_err());
        assert_eq!(e.load_i32(LOC, h), Ok(7));
    }

    // ── handles in memory ──

    #[test]
    fn store_load_handle_roundtrip() {
        let e = engine();
        let cell = e.allocate(LOC, 8).unwrap();
        let target = e.add_offset(e.allocate(LOC, 32).unwrap(), 12);
        e.store_handle(LOC, cell, target).unwrap();
        let loaded = e.load_handle(LOC, cell).unwrap();
        assert_eq!(loaded, target);
        assert!(!loaded.is_corrupted());
    }

    #[test]
    fn stored_slice_keeps_its_window() {
        let e = engine();
        let cell = e.allocate(LOC, 8).unwrap();
        let h = e.allocate(LOC, 16).unwrap();
        let s = e.add_offset(e.slice(LOC, h, 4, 8).unwrap(), 1);
        e.store_handle(LOC, cell, s).unwrap();
        let loaded = e.load_handle(LOC, cell).unwrap();
        assert_eq!(loaded, s);
        assert_eq!(loaded.window(), (4, 8));
        assert_eq!(kind(e.load_i32(LOC, e.add_offset(loaded, 11))), TrapKind::OutOfBounds);
        // The bare word still decodes to the whole segment.
        assert_eq!(e.decode(e.encode(&s)).window(), (0, 16));
    }

    #[test]
    fn handle_stored_word_is_wire_format() {
        let e = engine();
        let cell = e.allocate(LOC, 8).unwrap();
        let target = e.allocate(LOC, 4).unwrap();
        e.store_handle(LOC, cell, target).unwrap();
        assert_eq!(e.load_i64(LOC, cell), Ok(e.encode(&target) as i64));
    }

    #[test]
    fn data_store_over_handle_corrupts_it() {
        let e = engine();
        let cell = e.allocate(LOC, 8).unwrap();
        let target = e.allocate(LOC, 4).unwrap();
        e.store_handle(LOC, cell, target).unwrap();
        // Rewrite the identical word through an integer store.
        let word = e.load_i64(LOC, cell).unwrap();
        e.store_i64(LOC, cell, word).unwrap();
        let loaded = e.load_handle(LOC, cell).unwrap();
        assert!(loaded.is_corrupted());
        assert_eq!(kind(e.load_i32(LOC, loaded)), TrapKind::CorruptedHandle);
    }

    #[test]
    fn zeroed_memory_loads_null_handle() {
        let e = engine();
        let cell = e.allocate(LOC, 8).unwrap();
        let loaded = e.load_handle(LOC, cell).unwrap();
        assert!(loaded.is_null());
        assert!(!loaded.is_corrupted());
        assert_eq!(kind(e.load_i32(LOC, loaded)), TrapKind::NullHandle);
    }

    #[test]
    fn null_handle_roundtrips_through_memory() {
        let e = engine();
        let cell = e.allocate(LOC, 8).unwrap();
        e.store_i64(LOC, cell, -1).unwrap();
        e.store_handle(LOC, cell, Handle::NULL).unwrap();
        assert_eq!(e.load_handle(LOC, cell), Ok(Handle::NULL));
    }

    #[test]
    fn load_handle_needs_eight_bytes() {
        let e = engine();
        let cell = e.allocate(LOC, 4).unwrap();
        assert_eq!(kind(e.load_handle(LOC, cell)), TrapKind::OutOfBounds);
        assert_eq!(kind(e.store_handle(LOC, cell, cell)), TrapKind::OutOfBounds);
    }

    // ── generic dispatch ──

    #[test]
    fn generic_load_store() {
        let e = engine();
        let h = e.allocate(LOC, 8).unwrap();
        e.store(LOC, h, StoreOp::I32_16, Value::I32(-2)).unwrap();
        assert_eq!(e.load(LOC, h, LoadOp::I32_16S), Ok(Value::I32(-2)));
        assert_eq!(e.load(LOC, h, LoadOp::I64_16U), Ok(Value::I64(0xFFFE)));
        e.store(LOC, h, StoreOp::Handle, Value::Handle(h)).unwrap();
        assert_eq!(e.load(LOC, h, LoadOp::Handle), Ok(Value::Handle(h)));
    }

    #[test]
    fn generic_store_rejects_wrong_operand() {
        let e = engine();
        let h = e.allocate(LOC, 8).unwrap();
        e.store_i32(LOC, h, 5).unwrap();
        let trap = e.store(LOC, h, StoreOp::I32, Value::I64(1)).unwrap_err();
        assert_eq!(trap.kind, TrapKind::OperandTypeMismatch);
        assert_eq!(trap.op, "i32.store");
        assert_eq!(e.load_i32(LOC, h), Ok(5));
    }

    // ── duplicate / reset ──

    #[test]
    fn duplicate_shares_segments() {
        let a = engine();
        let b = a.duplicate();
        assert!(a.shares_table_with(&b));
        let h = a.allocate(LOC, 4).unwrap();
        b.store_i32(LOC, h, 99).unwrap();
        assert_eq!(a.load_i32(LOC, h), Ok(99));
        b.free(LOC, h).unwrap();
        assert_eq!(kind(a.load_i32(LOC, h)), TrapKind::UseAfterFree);
    }

    #[test]
    fn separate_engines_do_not_share() {
        let a = engine();
        let b = engine();
        assert!(!a.shares_table_with(&b));
        let h = a.allocate(LOC, 4).unwrap();
        assert_eq!(kind(b.load_i32(LOC, h)), TrapKind::UseAfterFree);
    }

    #[test]
    fn reset_releases_everything() {
        let e = engine();
        let h = e.allocate(LOC, 4).unwrap();
        e.allocate(LOC, 4).unwrap();
        e.reset();
        assert_eq!(e.live_segments(), 0);
        assert!(e.inspect_table(KeyTable::is_empty));
        assert_eq!(kind(e.load_i32(LOC, h)), TrapKind::UseAfterFree);
        // Engine stays usable.
        assert!(e.allocate(LOC, 4).is_ok());
    }

    // ── refused operations ──

    #[test]
    fn flat_memory_operations_trap() {
        let e = engine();
        let h = e.allocate(LOC, 4).unwrap();
        assert_eq!(kind(e.grow(LOC, 1)), TrapKind::UnsupportedOperation);
        assert_eq!(kind(e.grow(LOC, 0)), TrapKind::UnsupportedOperation);
        assert_eq!(kind(e.copy(LOC, h, h, 0)), TrapKind::UnsupportedOperation);
        assert_eq!(
            e.as_contiguous_buffer(LOC).unwrap_err().kind,
            TrapKind::UnsupportedOperation
        );
        // Refusals do not disturb live segments.
        assert!(e.load_i32(LOC, h).is_ok());
    }
}
