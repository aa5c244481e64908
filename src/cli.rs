use crate::config::settings::{parse_size, HeapSizeSource, ShimConfig, HEAP_SIZE_ENV};
use crate::config::types::StartupStatus;
use crate::kernel::seccomp;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// File name of the preload library produced by `--features preload`.
pub const LIBRARY_NAME: &str = "librustbox_shim.so";

/// Overrides where the launcher looks for the preload library.
pub const LIBRARY_ENV: &str = "RUSTBOX_SHIM_LIBRARY";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program under the shim
    Run {
        /// Private heap size (bytes, or with K/M/G suffix)
        #[arg(long, value_parser = parse_heap_size)]
        heap_size: Option<usize>,
        /// Path to the preload library
        #[arg(long)]
        library: Option<PathBuf>,
        /// Print the report as JSON on stdout
        #[arg(long)]
        json: bool,
        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Report seccomp availability and the effective heap configuration
    Check {
        #[arg(long)]
        json: bool,
    },
}

fn parse_heap_size(value: &str) -> std::result::Result<usize, String> {
    match parse_size(value) {
        Some(0) | None => Err(format!("invalid heap size '{}'", value)),
        Some(size) => Ok(size),
    }
}

/// How the sandboxed program ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The program's own exit status
    Exited { code: i32 },
    /// The shim refused to start the program
    StartupFailure { code: i32, status: StartupStatus },
    /// Killed by a signal
    Killed { signal: i32, name: String },
}

impl Outcome {
    /// Classify a wait result. Exit codes 120 to 123 are reserved by the shim.
    pub fn classify(code: Option<i32>, signal: Option<i32>) -> Self {
        match (code, signal) {
            (Some(code), _) => match StartupStatus::from_code(code) {
                Some(status) => Outcome::StartupFailure { code, status },
                None => Outcome::Exited { code },
            },
            (None, Some(signal)) => Outcome::Killed {
                signal,
                name: nix::sys::signal::Signal::try_from(signal)
                    .map(|sig| sig.as_str().to_string())
                    .unwrap_or_else(|_| format!("signal {}", signal)),
            },
            (None, None) => Outcome::Exited { code: -1 },
        }
    }

    /// Status for the launcher itself: the child's code, or 128 + signal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Exited { code } | Outcome::StartupFailure { code, .. } => *code,
            Outcome::Killed { signal, .. } => 128 + signal,
        }
    }

    pub fn note(&self) -> Option<&'static str> {
        match self {
            Outcome::StartupFailure { status, .. } => Some(status.description()),
            Outcome::Killed { signal, .. } if *signal == libc::SIGKILL => {
                Some("SIGKILL under strict mode usually means a forbidden system call")
            }
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    program: &'a str,
    started_at: DateTime<Utc>,
    elapsed_ms: u128,
    heap_size: usize,
    library: &'a Path,
    outcome: &'a Outcome,
    note: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    seccomp: String,
    current_mode: Option<String>,
    heap: ShimConfig,
}

/// Locate the preload library: explicit flag, then the environment, then
/// next to the launcher binary.
fn resolve_library(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let candidate = match explicit.or_else(|| std::env::var_os(LIBRARY_ENV).map(PathBuf::from)) {
        Some(path) => path,
        None => std::env::current_exe()
            .context("Failed to locate launcher binary")?
            .with_file_name(LIBRARY_NAME),
    };
    if !candidate.is_file() {
        anyhow::bail!(
            "Preload library not found at {} (build with --no-default-features --features preload)",
            candidate.display()
        );
    }
    candidate
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", candidate.display()))
}

fn run_program(
    heap_size: Option<usize>,
    library: Option<PathBuf>,
    json: bool,
    command: Vec<String>,
) -> Result<i32> {
    let library = resolve_library(library)?;
    let heap_size = heap_size.unwrap_or_else(|| ShimConfig::from_env().heap_size);
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("missing program"))?;

    log::info!(
        "Launching {} with {} under a {} byte heap",
        program,
        library.display(),
        heap_size
    );

    let started_at = Utc::now();
    let clock = std::time::Instant::now();
    let status = Command::new(program)
        .args(args)
        .env("LD_PRELOAD", &library)
        .env(HEAP_SIZE_ENV, heap_size.to_string())
        .status()
        .with_context(|| format!("Failed to launch {}", program))?;

    let outcome = Outcome::classify(status.code(), status.signal());
    let report = RunReport {
        program,
        started_at,
        elapsed_ms: clock.elapsed().as_millis(),
        heap_size,
        library: &library,
        outcome: &outcome,
        note: outcome.note(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match &outcome {
            Outcome::Exited { code } => eprintln!("rustbox-shim: {} exited with {}", program, code),
            Outcome::StartupFailure { status, .. } => {
                eprintln!("rustbox-shim: {} did not start: {}", program, status)
            }
            Outcome::Killed { name, .. } => eprintln!("rustbox-shim: {} killed by {}", program, name),
        }
        if let Some(note) = report.note {
            eprintln!("  {}", note);
        }
    }
    Ok(outcome.exit_code())
}

fn check(json: bool) -> Result<()> {
    let report = CheckReport {
        seccomp: seccomp::seccomp_status(),
        current_mode: seccomp::current_mode().ok().map(|mode| mode.to_string()),
        heap: ShimConfig::from_env(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.seccomp == "available" {
        println!("✅ seccomp available - strict mode can be installed");
    } else {
        println!("⚠️  Warning: seccomp not available - the shim will exit with 121");
    }
    if let Some(mode) = &report.current_mode {
        println!("   current mode: {}", mode);
    }
    match report.heap.source {
        HeapSizeSource::Fallback => println!(
            "⚠️  Warning: {} is malformed, using default {} bytes",
            HEAP_SIZE_ENV, report.heap.heap_size
        ),
        _ => println!("✅ heap size {} bytes ({:?})", report.heap.heap_size, report.heap.source),
    }
    Ok(())
}

pub fn run() -> Result<()> {
    crate::observability::logging::init_cli_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            heap_size,
            library,
            json,
            command,
        } => {
            let code = run_program(heap_size, library, json, command)?;
            std::process::exit(code);
        }
        Commands::Check { json } => check(json),
    }
}
