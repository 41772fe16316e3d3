//! mswasm — replay memory-operation traces against the segment memory engine.
//!
//! This crate provides the trace pipeline behind the `mswasm` binary: parse a
//! trace, build a `MemoryEngine` from the options, and execute every
//! statement, collecting one line of output per command.

pub mod parser;
pub mod replay;

// Re-export key types for convenience
pub use anyhow::{Context, Result};
pub use replay::{ReplayReport, Replayer};

use mswasm_runtime::{EngineConfig, MemoryEngine, SeededKeys};
use parser::parse_trace;

/// Configuration options for a replay
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Engine limits (key table capacity, largest segment)
    pub config: EngineConfig,
    /// Seed for reproducible segment keys; `None` draws keys from the OS
    pub seed: Option<u64>,
    /// Stop at the first trap instead of reporting it and continuing
    pub fail_fast: bool,
}

/// Replay a trace.
///
/// This is the main entry point: it parses `source`, builds a fresh engine
/// and executes every statement in order.
///
/// # Example
/// ```
/// use mswasm::{replay, ReplayOptions};
///
/// let options = ReplayOptions { seed: Some(1), ..ReplayOptions::default() };
/// let report = replay("h = alloc 4\nfree h\nx = load.i32 h", &options).unwrap();
/// assert_eq!(report.traps, 1);
/// ```
pub fn replay(source: &str, options: &ReplayOptions) -> Result<ReplayReport> {
    let statements = parse_trace(source).context("failed to parse trace")?;
    let engine = build_engine(options)?;
    Replayer::new(engine, options.fail_fast).run(&statements)
}

fn build_engine(options: &ReplayOptions) -> Result<MemoryEngine> {
    let engine = match options.seed {
        Some(seed) => {
            MemoryEngine::with_key_source(options.config, Box::new(SeededKeys::new(seed)))
        }
        None => MemoryEngine::try_new(options.config),
    };
    engine.context("failed to build memory engine")
}
