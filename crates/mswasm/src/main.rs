use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mswasm::{replay, ReplayOptions};
use mswasm_runtime::{EngineConfig, INITIAL_CAPACITY};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// mswasm — replay memory-operation traces against capability-handle segment memory.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Log filter (e.g. `debug`, `mswasm_runtime=trace`); overrides RUST_LOG
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a trace file and print one result per command
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Trace file (`-` for stdin)
    trace: PathBuf,

    /// Initial key table capacity
    #[arg(long, default_value_t = INITIAL_CAPACITY)]
    initial_capacity: usize,

    /// Maximum key table capacity
    #[arg(long, default_value_t = EngineConfig::default().max_capacity)]
    max_capacity: usize,

    /// Largest single allocation in bytes
    #[arg(long, default_value_t = EngineConfig::default().max_segment_size)]
    max_segment_size: u32,

    /// Seed for reproducible segment keys (default: OS entropy)
    #[arg(long)]
    seed: Option<u64>,

    /// Stop at the first trap and exit with an error
    #[arg(long)]
    fail_fast: bool,
}

impl RunArgs {
    fn options(&self) -> ReplayOptions {
        ReplayOptions {
            config: EngineConfig {
                initial_capacity: self.initial_capacity,
                max_capacity: self.max_capacity,
                max_segment_size: self.max_segment_size,
            },
            seed: self.seed,
            fail_fast: self.fail_fast,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref())?;

    match cli.command {
        Commands::Run(args) => run(&args),
    }
}

fn run(args: &RunArgs) -> Result<()> {
    let source = read_trace(&args.trace)?;
    tracing::debug!(trace = %args.trace.display(), seed = ?args.seed, "replaying trace");

    let report = replay(&source, &args.options())
        .with_context(|| format!("failed to replay {}", args.trace.display()))?;

    for line in &report.output {
        println!("{line}");
    }
    eprintln!(
        "mswasm: {} commands, {} traps",
        report.executed, report.traps
    );

    if report.stopped_early {
        bail!("stopped at first trap");
    }
    Ok(())
}

fn read_trace(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut source = String::new();
        io::stdin()
            .read_to_string(&mut source)
            .context("failed to read trace from stdin")?;
        return Ok(source);
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Install a stderr subscriber. `--log` wins over `RUST_LOG`; the default
/// is `warn`.
fn init_tracing(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter `{directives}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err).context("failed to initialize tracing subscriber"))
}
