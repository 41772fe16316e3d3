//! Operand values and memory-access opcodes.
//!
//! `Value` is the closed set of things that can be loaded from or stored
//! to segment memory. The interpreter's operand stack carries these; the
//! engine's generic `load`/`store` dispatch on `LoadOp`/`StoreOp` instead
//! of inspecting values at runtime.

use core::fmt;

use crate::handle::Handle;
use crate::HANDLE_BYTES;

/// A typed operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Handle(Handle),
}

impl Value {
    /// Name of the value's type, as in Wasm text format.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Handle(_) => "handle",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "i32:{v}"),
            Value::I64(v) => write!(f, "i64:{v}"),
            Value::F32(v) => write!(f, "f32:{v}"),
            Value::F64(v) => write!(f, "f64:{v}"),
            Value::Handle(h) => fmt::Display::fmt(h, f),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Handle(h)
    }
}

/// Load instructions over segment memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    I32,
    I64,
    F32,
    F64,
    I32_8S,
    I32_8U,
    I32_16S,
    I32_16U,
    I64_8S,
    I64_8U,
    I64_16S,
    I64_16U,
    I64_32S,
    I64_32U,
    Handle,
}

impl LoadOp {
    pub const ALL: [LoadOp; 15] = [
        LoadOp::I32,
        LoadOp::I64,
        LoadOp::F32,
        LoadOp::F64,
        LoadOp::I32_8S,
        LoadOp::I32_8U,
        LoadOp::I32_16S,
        LoadOp::I32_16U,
        LoadOp::I64_8S,
        LoadOp::I64_8U,
        LoadOp::I64_16S,
        LoadOp::I64_16U,
        LoadOp::I64_32S,
        LoadOp::I64_32U,
        LoadOp::Handle,
    ];

    /// Instruction name, e.g. `"i64.load16_u"`.
    pub fn name(self) -> &'static str {
        match self {
            LoadOp::I32 => "i32.load",
            LoadOp::I64 => "i64.load",
            LoadOp::F32 => "f32.load",
            LoadOp::F64 => "f64.load",
            LoadOp::I32_8S => "i32.load8_s",
            LoadOp::I32_8U => "i32.load8_u",
            LoadOp::I32_16S => "i32.load16_s",
            LoadOp::I32_16U => "i32.load16_u",
            LoadOp::I64_8S => "i64.load8_s",
            LoadOp::I64_8U => "i64.load8_u",
            LoadOp::I64_16S => "i64.load16_s",
            LoadOp::I64_16U => "i64.load16_u",
            LoadOp::I64_32S => "i64.load32_s",
            LoadOp::I64_32U => "i64.load32_u",
            LoadOp::Handle => "handle.load",
        }
    }

    /// Bytes read from memory.
    pub fn width(self) -> u32 {
        match self {
            LoadOp::I32_8S | LoadOp::I32_8U | LoadOp::I64_8S | LoadOp::I64_8U => 1,
            LoadOp::I32_16S | LoadOp::I32_16U | LoadOp::I64_16S | LoadOp::I64_16U => 2,
            LoadOp::I32 | LoadOp::F32 | LoadOp::I64_32S | LoadOp::I64_32U => 4,
            LoadOp::I64 | LoadOp::F64 => 8,
            LoadOp::Handle => HANDLE_BYTES,
        }
    }

    /// Parse an instruction name produced by `name`.
    pub fn from_name(name: &str) -> Option<LoadOp> {
        LoadOp::ALL.into_iter().find(|op| op.name() == name)
    }
}

/// Store instructions over segment memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    I32,
    I64,
    F32,
    F64,
    I32_8,
    I32_16,
    I64_8,
    I64_16,
    I64_32,
    Handle,
}

impl StoreOp {
    pub const ALL: [StoreOp; 10] = [
        StoreOp::I32,
        StoreOp::I64,
        StoreOp::F32,
        StoreOp::F64,
        StoreOp::I32_8,
        StoreOp::I32_16,
        StoreOp::I64_8,
        StoreOp::I64_16,
        StoreOp::I64_32,
        StoreOp::Handle,
    ];

    /// Instruction name, e.g. `"i32.store8"`.
    pub fn name(self) -> &'static str {
        match self {
            StoreOp::I32 => "i32.store",
            StoreOp::I64 => "i64.store",
            StoreOp::F32 => "f32.store",
            StoreOp::F64 => "f64.store",
            StoreOp::I32_8 => "i32.store8",
            StoreOp::I32_16 => "i32.store16",
            StoreOp::I64_8 => "i64.store8",
            StoreOp::I64_16 => "i64.store16",
            StoreOp::I64_32 => "i64.store32",
            StoreOp::Handle => "handle.store",
        }
    }

    /// Bytes written to memory.
    pub fn width(self) -> u32 {
        match self {
            StoreOp::I32_8 | StoreOp::I64_8 => 1,
            StoreOp::I32_16 | StoreOp::I64_16 => 2,
            StoreOp::I32 | StoreOp::F32 | StoreOp::I64_32 => 4,
            StoreOp::I64 | StoreOp::F64 => 8,
            StoreOp::Handle => HANDLE_BYTES,
        }
    }

    pub fn from_name(name: &str) -> Option<StoreOp> {
        StoreOp::ALL.into_iter().find(|op| op.name() == name)
    }
}
