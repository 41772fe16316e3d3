//! `mswasm-runtime` — memory-safety core for segment-based WebAssembly.
//!
//! Linear memory is replaced by dynamically allocated **segments** reached
//! only through **handles**: bounds-carrying capabilities that are validated
//! on every load, store, slice and free. This crate provides:
//! - `Segment` / `KeyTable` — segment storage keyed by sparse random keys
//! - `Handle` — the capability value and its validity rules
//! - `MemoryEngine` — the façade the interpreter calls; the one place traps
//!   are constructed
//! - `codec` — the fixed 64-bit wire format of a handle stored in memory
//! - `Trap` / `TrapResult<T>` for trap reporting

use core::fmt;

mod codec;
pub use codec::{decode, encode, CORRUPTED_BIT, KEY_SHIFT, SLICE_BIT};

mod config;
pub use config::EngineConfig;

mod engine;
pub use engine::MemoryEngine;

mod handle;
pub use handle::Handle;

mod key_table;
pub use key_table::{KeyTable, INITIAL_CAPACITY, KEY_MASK};

mod keys;
pub use keys::{FixedKeys, KeySource, OsKeys, SeededKeys};

mod segment;
pub use segment::Segment;

mod value;
pub use value::{LoadOp, StoreOp, Value};

/// Width in bytes of a handle serialized into segment memory.
pub const HANDLE_BYTES: u32 = 8;

/// Reasons an operation on segment memory is rejected — no panics, no unwinding.
///
/// Every kind is fatal to the operation that raised it and leaves the
/// engine (key table and all other segments) intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapKind {
    /// Dereference of the null handle.
    NullHandle,
    /// Handle whose encoded form did not resolve to a segment, or was
    /// altered while stored in memory.
    CorruptedHandle,
    /// The handle's segment has been freed (or the table was reset).
    UseAfterFree,
    /// Access outside the handle's window, or a negative cursor.
    OutOfBounds,
    /// Slice bounds negative, inverted, or wider than the parent window.
    InvalidSlice,
    /// Free through a slice handle.
    InvalidFree,
    /// Segment released twice.
    DoubleFree,
    /// Flat-memory operation (`grow`, `copy`, contiguous view).
    UnsupportedOperation,
    /// Host could not reserve the segment, or the key table cannot grow.
    AllocationFailed,
    /// A `Value` of the wrong variant was passed to a typed store.
    OperandTypeMismatch,
}

impl TrapKind {
    /// Stable lowercase name used in trap messages.
    pub fn as_str(self) -> &'static str {
        match self {
            TrapKind::NullHandle => "null handle",
            TrapKind::CorruptedHandle => "corrupted handle",
            TrapKind::UseAfterFree => "use after free",
            TrapKind::OutOfBounds => "out-of-bounds handle",
            TrapKind::InvalidSlice => "invalid slice",
            TrapKind::InvalidFree => "invalid free",
            TrapKind::DoubleFree => "double free",
            TrapKind::UnsupportedOperation => "unsupported operation",
            TrapKind::AllocationFailed => "allocation failed",
            TrapKind::OperandTypeMismatch => "operand type mismatch",
        }
    }
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque diagnostic token identifying where in the guest an operation
/// was issued. Only used to annotate traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Location {
    /// Index of the executing function.
    pub func_index: u32,
    /// Instruction offset within that function.
    pub offset: u32,
}

impl Location {
    /// Location used when the caller has no source position.
    pub const UNKNOWN: Location = Location {
        func_index: u32::MAX,
        offset: u32::MAX,
    };

    pub const fn new(func_index: u32, offset: u32) -> Self {
        Self { func_index, offset }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Location::UNKNOWN {
            f.write_str("<unknown>")
        } else {
            write!(f, "func[{}]+{:#x}", self.func_index, self.offset)
        }
    }
}

/// A trap raised by the `MemoryEngine`, carrying enough context to
/// reconstruct the failing condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} in {op} at {location}: {handle}, access of {size} bytes")]
pub struct Trap {
    pub kind: TrapKind,
    /// Operation name, e.g. `"i32.load8_s"` or `"segment.free"`.
    pub op: &'static str,
    pub location: Location,
    /// State of the offending handle (null for operations without one).
    pub handle: Handle,
    /// Requested access or allocation size in bytes.
    pub size: u32,
}

impl Trap {
    #[inline(always)]
    pub fn kind(&self) -> TrapKind {
        self.kind
    }
}

/// Result type for engine operations — `Result<T, Trap>`.
pub type TrapResult<T> = Result<T, Trap>;

/// Errors that occur while building an engine.
///
/// These are configuration problems on the embedder side, not guest traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConstructionError {
    #[error("key table initial capacity must be nonzero")]
    ZeroInitialCapacity,
    #[error("key table initial capacity {initial} exceeds maximum {max}")]
    InitialCapacityExceedsMax { initial: usize, max: usize },
    #[error("cannot reserve key table of {capacity} slots")]
    TableAllocation { capacity: usize },
    #[error("entropy source unavailable: {0}")]
    Entropy(getrandom::Error),
}
