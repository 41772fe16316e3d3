//! Trace replay.
//!
//! Executes parsed statements one by one against a `MemoryEngine`. Traps
//! are results, not errors: each is reported on its line and replay goes
//! on (or stops, with `fail_fast`). Errors are reserved for traces that
//! cannot be executed at all, such as a name used before it is bound.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use mswasm_runtime::{Handle, Location, MemoryEngine, StoreOp, TrapResult, Value};

use crate::parser::{int_to_i32, int_to_i64, Command, Operand, Statement};

/// Outcome of replaying a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// One `line N: ...` entry per executed statement.
    pub output: Vec<String>,
    pub executed: usize,
    pub traps: usize,
    /// Replay stopped at the first trap.
    pub stopped_early: bool,
}

/// Replays statements against one engine, keeping name bindings between them.
#[derive(Debug)]
pub struct Replayer {
    engine: MemoryEngine,
    bindings: HashMap<String, Value>,
    fail_fast: bool,
}

impl Replayer {
    pub fn new(engine: MemoryEngine, fail_fast: bool) -> Self {
        Self {
            engine,
            bindings: HashMap::new(),
            fail_fast,
        }
    }

    pub fn engine(&self) -> &MemoryEngine {
        &self.engine
    }

    /// Value currently bound to `name`.
    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn run(&mut self, statements: &[Statement]) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        for stmt in statements {
            let loc = Location::new(0, stmt.line);
            let outcome = self
                .execute(loc, &stmt.command)
                .with_context(|| format!("line {}", stmt.line))?;
            report.executed += 1;
            match outcome {
                Ok(Some(value)) => {
                    let line = match &stmt.bind {
                        Some(name) => format!("line {}: {name} = {value}", stmt.line),
                        None => format!("line {}: {value}", stmt.line),
                    };
                    report.output.push(line);
                    if let Some(name) = &stmt.bind {
                        self.bindings.insert(name.clone(), value);
                    }
                }
                Ok(None) => report.output.push(format!("line {}: ok", stmt.line)),
                Err(trap) => {
                    tracing::info!(line = stmt.line, %trap, "trace trapped");
                    report.output.push(format!("line {}: trap: {trap}", stmt.line));
                    report.traps += 1;
                    if self.fail_fast {
                        report.stopped_early = true;
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Outer `Result`: the statement cannot be executed. Inner: the engine
    /// trapped.
    fn execute(&self, loc: Location, command: &Command) -> Result<TrapResult<Option<Value>>> {
        let e = &self.engine;
        Ok(match command {
            Command::Alloc(size) => e.allocate(loc, self.u32_arg(size)?).map(|h| Some(h.into())),
            Command::Free(h) => e.free(loc, self.handle_arg(h)?).map(|()| None),
            Command::Slice {
                handle,
                base,
                bound,
            } => e
                .slice(loc, self.handle_arg(handle)?, self.i32_arg(base)?, self.i32_arg(bound)?)
                .map(|s| Some(s.into())),
            Command::Add(h, delta) => Ok(Some(
                e.add_offset(self.handle_arg(h)?, self.i32_arg(delta)?).into(),
            )),
            Command::Sub(h, delta) => Ok(Some(
                e.sub_offset(self.handle_arg(h)?, self.i32_arg(delta)?).into(),
            )),
            Command::Dup(h) => Ok(Some(self.handle_arg(h)?.duplicate().into())),
            Command::Load(op, h) => e.load(loc, self.handle_arg(h)?, *op).map(Some),
            Command::Store(op, h, value) => e
                .store(loc, self.handle_arg(h)?, *op, self.store_operand(*op, value)?)
                .map(|()| None),
            Command::Encode(h) => Ok(Some(Value::I64(e.encode(&self.handle_arg(h)?) as i64))),
            Command::Decode(word) => Ok(Some(e.decode(self.i64_arg(word)? as u64).into())),
            Command::Grow(extra) => e.grow(loc, self.u32_arg(extra)?).map(|r| Some(r.into())),
            Command::Copy { dst, src, len } => e
                .copy(loc, self.handle_arg(dst)?, self.handle_arg(src)?, self.u32_arg(len)?)
                .map(|()| None),
            Command::Reset => {
                e.reset();
                Ok(None)
            }
            Command::Print(value) => Ok(Some(self.value(value)?)),
        })
    }

    // ── Operand resolution ────────────────────────────────────────────

    fn lookup(&self, name: &str) -> Result<Value> {
        self.bindings
            .get(name)
            .copied()
            .with_context(|| format!("`{name}` is not bound"))
    }

    /// Any value; untyped integers become `i32` when they fit.
    fn value(&self, operand: &Operand) -> Result<Value> {
        match operand {
            Operand::Var(name) => self.lookup(name),
            Operand::Value(value) => Ok(*value),
            Operand::Int(v) => match int_to_i32(*v) {
                Some(v) => Ok(Value::I32(v)),
                None => int_to_i64(*v)
                    .map(Value::I64)
                    .with_context(|| format!("integer {v} does not fit in 64 bits")),
            },
        }
    }

    fn handle_arg(&self, operand: &Operand) -> Result<Handle> {
        match self.value(operand)? {
            Value::Handle(h) => Ok(h),
            other => bail!("expected a handle, found {other}"),
        }
    }

    fn i32_arg(&self, operand: &Operand) -> Result<i32> {
        if let Operand::Int(v) = operand {
            return int_to_i32(*v).with_context(|| format!("integer {v} does not fit in i32"));
        }
        match self.value(operand)? {
            Value::I32(v) => Ok(v),
            other => bail!("expected an i32, found {other}"),
        }
    }

    /// An `i32` read as unsigned, as Wasm does for sizes.
    fn u32_arg(&self, operand: &Operand) -> Result<u32> {
        self.i32_arg(operand).map(|v| v as u32)
    }

    fn i64_arg(&self, operand: &Operand) -> Result<i64> {
        if let Operand::Int(v) = operand {
            return int_to_i64(*v).with_context(|| format!("integer {v} does not fit in i64"));
        }
        match self.value(operand)? {
            Value::I64(v) => Ok(v),
            other => bail!("expected an i64, found {other}"),
        }
    }

    /// Untyped integers take the store's operand type. Everything else is
    /// passed through for the engine to check.
    fn store_operand(&self, op: StoreOp, operand: &Operand) -> Result<Value> {
        if !matches!(operand, Operand::Int(_)) {
            return self.value(operand);
        }
        Ok(match op {
            StoreOp::I32 | StoreOp::I32_8 | StoreOp::I32_16 => Value::I32(self.i32_arg(operand)?),
            StoreOp::I64 | StoreOp::I64_8 | StoreOp::I64_16 | StoreOp::I64_32 => {
                Value::I64(self.i64_arg(operand)?)
            }
            StoreOp::F32 | StoreOp::F64 | StoreOp::Handle => {
                bail!("`{}` needs a typed operand, not a bare integer", op.name())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_trace;
    use mswasm_runtime::{EngineConfig, SeededKeys, TrapKind};

    fn replayer(fail_fast: bool) -> Replayer {
        let engine =
            MemoryEngine::with_key_source(EngineConfig::default(), Box::new(SeededKeys::new(42)))
                .unwrap();
        Replayer::new(engine, fail_fast)
    }

    fn run(trace: &str) -> ReplayReport {
        replayer(false).run(&parse_trace(trace).unwrap()).unwrap()
    }

    #[test]
    fn store_then_load() {
        let report = run("h = alloc 16\nstore.i32 h 0x12345678\nx = load.i32 h\nprint x");
        assert_eq!(report.executed, 4);
        assert_eq!(report.traps, 0);
        assert_eq!(report.output[1], "line 2: ok");
        assert_eq!(report.output[2], "line 3: x = i32:305419896");
        assert_eq!(report.output[3], "line 4: i32:305419896");
    }

    #[test]
    fn trap_is_reported_and_replay_continues() {
        let report = run("h = alloc 8\nfree h\nx = load.i32 h\nprint 7");
        assert_eq!(report.traps, 1);
        assert!(report.output[2].starts_with("line 3: trap: use after free in i32.load at func[0]+0x3"));
        assert_eq!(report.output[3], "line 4: i32:7");
        assert!(!report.stopped_early);
    }

    #[test]
    fn fail_fast_stops_at_first_trap() {
        let statements = parse_trace("h = alloc 16\ns = slice h 4 12\nfree s\nfree h").unwrap();
        let mut r = replayer(true);
        let report = r.run(&statements).unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.executed, 3);
        assert!(report.output[2].contains("invalid free"));
        assert_eq!(r.engine().live_segments(), 1);
    }

    #[test]
    fn trapped_command_binds_nothing() {
        let statements = parse_trace("h = alloc 0\nfree h").unwrap();
        let err = replayer(false).run(&statements).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("line 2"), "{msg}");
        assert!(msg.contains("`h` is not bound"), "{msg}");
    }

    #[test]
    fn bare_integers_take_store_width() {
        let report = run("h = alloc 8\nstore.i64 h 0xFFFFFFFFFFFFFFFF\nx = load.i64 h");
        assert_eq!(report.output[2], "line 3: x = i64:-1");
    }

    #[test]
    fn typed_operand_mismatch_traps() {
        let report = run("h = alloc 8\nstore.i32 h 1i64");
        assert_eq!(report.traps, 1);
        assert!(report.output[1].contains("operand type mismatch in i32.store"));
    }

    #[test]
    fn wrong_operand_kind_is_an_error() {
        let statements = parse_trace("x = alloc 4\nstore.i32 7 x").unwrap();
        assert!(replayer(false).run(&statements).is_err());
        let statements = parse_trace("h = alloc 4\nstore.f32 h 1").unwrap();
        assert!(replayer(false).run(&statements).is_err());
    }

    #[test]
    fn handles_through_memory_and_corruption() {
        let trace = "\
h = alloc 8
store.handle h h
w = load.i64 h
store.i64 h w
c = load.handle h
x = load.i32 c";
        let mut r = replayer(false);
        let report = r.run(&parse_trace(trace).unwrap()).unwrap();
        let Some(Value::Handle(c)) = r.binding("c") else {
            panic!("c should be a handle");
        };
        assert!(c.is_corrupted());
        assert!(report.output[5].contains("corrupted handle in i32.load"));
    }

    #[test]
    fn encode_decode_and_arithmetic() {
        let trace = "\
h = alloc 16
p = add h 12
q = sub p 4
w = encode q
d = decode w
x = load.i32_8u d";
        let mut r = replayer(false);
        let report = r.run(&parse_trace(trace).unwrap()).unwrap();
        assert_eq!(report.traps, 0);
        let Some(Value::Handle(d)) = r.binding("d") else {
            panic!("d should be a handle");
        };
        assert_eq!(d.offset(), 8);
        assert_eq!(r.binding("x"), Some(&Value::I32(0)));
    }

    #[test]
    fn flat_memory_commands_trap() {
        let report = run("h = alloc 16\nn = grow 1\ncopy h h 4\nreset\nx = load.i32 h");
        assert_eq!(report.traps, 3);
        assert!(report.output[1].contains("unsupported operation in memory.grow"));
        assert!(report.output[2].contains("unsupported operation in memory.copy"));
        assert_eq!(report.output[3], "line 4: ok");
        assert!(report.output[4].contains("use after free"));
    }

    #[test]
    fn same_seed_same_output() {
        let trace = "a = alloc 4\nb = alloc 4\nw = encode b";
        assert_eq!(run(trace), run(trace));
    }

    #[test]
    fn slice_then_free_parent() {
        let report = run("h = alloc 16\ns = slice h 4 12\nfree s\nfree h\nx = load.i32 s");
        let kinds: Vec<bool> = report
            .output
            .iter()
            .map(|line| line.contains("trap:"))
            .collect();
        assert_eq!(kinds, [false, false, true, false, true]);
        assert!(report.output[4].contains(TrapKind::UseAfterFree.as_str()));
    }
}
