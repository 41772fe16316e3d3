//! Trace parser.
//!
//! A trace is one command per line, optionally bound to a name:
//!
//! ```text
//! h = alloc 16
//! store.i32 h 0x12345678
//! x = load.i32 h        # comment
//! ```
//!
//! Parsing is purely syntactic: names are resolved and operand types are
//! checked when the trace is replayed.

use anyhow::{bail, Context, Result};
use mswasm_runtime::{Handle, LoadOp, StoreOp, Value};

/// One parsed trace line.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// 1-based source line.
    pub line: u32,
    /// Name the result is bound to, if any.
    pub bind: Option<String>,
    pub command: Command,
}

/// An operand as written in the trace.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A previously bound name.
    Var(String),
    /// Integer literal without a type suffix; typed by its use.
    Int(i128),
    /// Suffixed literal (`5i64`, `1.5f32`) or `null`.
    Value(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Alloc(Operand),
    Free(Operand),
    Slice {
        handle: Operand,
        base: Operand,
        bound: Operand,
    },
    Add(Operand, Operand),
    Sub(Operand, Operand),
    Dup(Operand),
    Load(LoadOp, Operand),
    Store(StoreOp, Operand, Operand),
    Encode(Operand),
    Decode(Operand),
    Grow(Operand),
    Copy {
        dst: Operand,
        src: Operand,
        len: Operand,
    },
    Reset,
    Print(Operand),
}

impl Command {
    /// Whether the command yields a value that can be bound to a name.
    pub fn produces_value(&self) -> bool {
        matches!(
            self,
            Command::Alloc(_)
                | Command::Slice { .. }
                | Command::Add(..)
                | Command::Sub(..)
                | Command::Dup(_)
                | Command::Load(..)
                | Command::Encode(_)
                | Command::Decode(_)
                | Command::Grow(_)
        )
    }
}

/// Parse a whole trace. Blank and comment-only lines are skipped.
pub fn parse_trace(source: &str) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let line = u32::try_from(idx + 1).context("trace has too many lines")?;
        let text = raw.split_once('#').map_or(raw, |(code, _)| code);
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        let statement = parse_statement(line, &tokens).with_context(|| format!("line {line}"))?;
        statements.push(statement);
    }
    Ok(statements)
}

fn parse_statement(line: u32, tokens: &[&str]) -> Result<Statement> {
    let (bind, rest) = match tokens {
        [name, "=", rest @ ..] => {
            if !is_identifier(name) {
                bail!("`{name}` is not a valid name");
            }
            (Some((*name).to_string()), rest)
        }
        _ => (None, tokens),
    };
    let Some((mnemonic, args)) = rest.split_first() else {
        bail!("missing command after `=`");
    };
    let command = parse_command(mnemonic, args)?;
    if bind.is_some() && !command.produces_value() {
        bail!("`{mnemonic}` produces no value to bind");
    }
    Ok(Statement {
        line,
        bind,
        command,
    })
}

fn parse_command(mnemonic: &str, args: &[&str]) -> Result<Command> {
    if let Some(ty) = mnemonic.strip_prefix("load.") {
        let op = load_op(ty).with_context(|| format!("unknown load `{mnemonic}`"))?;
        let [h] = operands(mnemonic, args)?;
        return Ok(Command::Load(op, h));
    }
    if let Some(ty) = mnemonic.strip_prefix("store.") {
        let op = store_op(ty).with_context(|| format!("unknown store `{mnemonic}`"))?;
        let [h, value] = operands(mnemonic, args)?;
        return Ok(Command::Store(op, h, value));
    }
    Ok(match mnemonic {
        "alloc" => {
            let [size] = operands(mnemonic, args)?;
            Command::Alloc(size)
        }
        "free" => {
            let [h] = operands(mnemonic, args)?;
            Command::Free(h)
        }
        "slice" => {
            let [handle, base, bound] = operands(mnemonic, args)?;
            Command::Slice {
                handle,
                base,
                bound,
            }
        }
        "add" => {
            let [h, delta] = operands(mnemonic, args)?;
            Command::Add(h, delta)
        }
        "sub" => {
            let [h, delta] = operands(mnemonic, args)?;
            Command::Sub(h, delta)
        }
        "dup" => {
            let [h] = operands(mnemonic, args)?;
            Command::Dup(h)
        }
        "encode" => {
            let [h] = operands(mnemonic, args)?;
            Command::Encode(h)
        }
        "decode" => {
            let [word] = operands(mnemonic, args)?;
            Command::Decode(word)
        }
        "grow" => {
            let [extra] = operands(mnemonic, args)?;
            Command::Grow(extra)
        }
        "copy" => {
            let [dst, src, len] = operands(mnemonic, args)?;
            Command::Copy { dst, src, len }
        }
        "reset" => {
            let [] = operands(mnemonic, args)?;
            Command::Reset
        }
        "print" => {
            let [value] = operands(mnemonic, args)?;
            Command::Print(value)
        }
        other => bail!("unknown command `{other}`"),
    })
}

/// Exactly `N` operands.
fn operands<const N: usize>(mnemonic: &str, args: &[&str]) -> Result<[Operand; N]> {
    if args.len() != N {
        bail!("`{mnemonic}` takes {N} operand(s), got {}", args.len());
    }
    let parsed = args
        .iter()
        .map(|tok| parse_operand(tok))
        .collect::<Result<Vec<_>>>()?;
    parsed
        .try_into()
        .map_err(|_| anyhow::anyhow!("`{mnemonic}` takes {N} operand(s)"))
}

fn parse_operand(token: &str) -> Result<Operand> {
    if token == "null" {
        return Ok(Operand::Value(Value::Handle(Handle::NULL)));
    }
    if is_identifier(token) {
        return Ok(Operand::Var(token.to_string()));
    }
    parse_literal(token).with_context(|| format!("invalid operand `{token}`"))
}

fn parse_literal(token: &str) -> Option<Operand> {
    let unsigned = token.strip_prefix('-').unwrap_or(token);
    let is_hex = unsigned.starts_with("0x");
    if !is_hex {
        if let Some(body) = token.strip_suffix("f32") {
            return body.parse().ok().map(|v| Operand::Value(Value::F32(v)));
        }
        if let Some(body) = token.strip_suffix("f64") {
            return body.parse().ok().map(|v| Operand::Value(Value::F64(v)));
        }
    }
    if let Some(body) = token.strip_suffix("i64") {
        return parse_int(body)
            .and_then(int_to_i64)
            .map(|v| Operand::Value(Value::I64(v)));
    }
    if let Some(body) = token.strip_suffix("i32") {
        return parse_int(body)
            .and_then(int_to_i32)
            .map(|v| Operand::Value(Value::I32(v)));
    }
    parse_int(token).map(Operand::Int)
}

fn parse_int(text: &str) -> Option<i128> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    // Integer parsing accepts a leading sign; reject "--5" and "0x-5".
    let body = digits.strip_prefix("0x").unwrap_or(digits);
    if body.starts_with(['-', '+']) {
        return None;
    }
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

/// Signed or unsigned 32-bit value, as its two's complement bit pattern.
pub fn int_to_i32(v: i128) -> Option<i32> {
    (i128::from(i32::MIN)..=i128::from(u32::MAX))
        .contains(&v)
        .then_some(v as i32)
}

/// Signed or unsigned 64-bit value, as its two's complement bit pattern.
pub fn int_to_i64(v: i128) -> Option<i64> {
    (i128::from(i64::MIN)..=i128::from(u64::MAX))
        .contains(&v)
        .then_some(v as i64)
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && token != "null"
}

/// `i32` → `i32.load`, `i64_32u` → `i64.load32_u`, `handle` → `handle.load`.
fn load_op(ty: &str) -> Option<LoadOp> {
    let name = match ty.split_once('_') {
        None => format!("{ty}.load"),
        Some((base, narrow)) => {
            let (bits, sign) = narrow
                .strip_suffix('s')
                .map(|bits| (bits, "s"))
                .or_else(|| narrow.strip_suffix('u').map(|bits| (bits, "u")))?;
            format!("{base}.load{bits}_{sign}")
        }
    };
    LoadOp::from_name(&name)
}

/// `i32` → `i32.store`, `i64_16` → `i64.store16`.
fn store_op(ty: &str) -> Option<StoreOp> {
    let name = match ty.split_once('_') {
        None => format!("{ty}.store"),
        Some((base, bits)) => format!("{base}.store{bits}"),
    };
    StoreOp::from_name(&name)
}
