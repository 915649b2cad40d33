use crate::backend::factory::create_backend;
use crate::config::loader::ControlConfig;
use crate::config::types::{BoundKind, CapabilityResult, ResourceKind, TerminationReason};
use crate::core::handle::ProcessHandle;
use crate::kernel::signal::SignalHandler;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an executable, streaming its output to stdout
    Run {
        /// Configuration file (defaults to ./procbox.json when present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Wall clock limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// CPU time limit in milliseconds
        #[arg(long)]
        time_limit_ms: Option<u64>,
        /// Memory limit in bytes
        #[arg(long)]
        memory_limit: Option<u64>,
        /// Output limit in bytes
        #[arg(long)]
        output_limit: Option<u64>,
        /// File to feed as input (repeatable, delivered in order)
        #[arg(long = "input")]
        inputs: Vec<PathBuf>,
        /// Literal text fed after the input files
        #[arg(long)]
        stdin: Option<String>,
        /// Print a JSON report to stderr instead of the exit reason
        #[arg(long)]
        json: bool,
        /// Executable to run (no arguments)
        executable: PathBuf,
    },
    /// Print the capability descriptor of the configured backend
    Capabilities {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct Bounds {
    lower: u64,
    upper: u64,
}

#[derive(Debug, Serialize)]
struct RunReport {
    handle_id: String,
    backend: String,
    executable: String,
    reason: TerminationReason,
    exit_reason: String,
    cpu_time_us: Bounds,
    peak_memory_bytes: Bounds,
    output_bytes: Bounds,
}

impl RunReport {
    fn collect(handle: &ProcessHandle) -> Self {
        let bounds = |kind| Bounds {
            lower: handle.measure(kind, BoundKind::Lower),
            upper: handle.measure(kind, BoundKind::Upper),
        };
        Self {
            handle_id: handle.id().to_string(),
            backend: handle.backend_name().to_string(),
            executable: handle.executable().display().to_string(),
            reason: handle.termination_reason(),
            exit_reason: handle.get_exit_reason().to_string(),
            cpu_time_us: bounds(ResourceKind::CpuTime),
            peak_memory_bytes: bounds(ResourceKind::PeakMemory),
            output_bytes: bounds(ResourceKind::OutputBytes),
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ControlConfig> {
    let config = match path {
        Some(path) => ControlConfig::load_from_file(path)?,
        None => ControlConfig::load_default()?,
    };
    Ok(config)
}

/// Limits and input requested on the command line
#[derive(Debug, Default)]
struct RunOptions {
    timeout_ms: Option<u64>,
    time_limit_ms: Option<u64>,
    memory_limit: Option<u64>,
    output_limit: Option<u64>,
    inputs: Vec<PathBuf>,
    stdin: Option<String>,
}

/// Capability failures are not fatal: warn and carry on without the request.
fn accepted(result: &CapabilityResult) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::warn!("ignoring request: {}", e);
            false
        }
    }
}

/// Apply limits and queue input. Returns how many requests the backend
/// could not honour.
fn prepare(handle: &ProcessHandle, options: RunOptions) -> usize {
    let mut results = Vec::new();
    if let Some(ms) = options.timeout_ms {
        results.push(handle.set_timeout(Duration::from_millis(ms)));
    }
    if let Some(ms) = options.time_limit_ms {
        results.push(handle.set_time_limit(Duration::from_millis(ms)));
    }
    if let Some(bytes) = options.memory_limit {
        results.push(handle.set_memory_limit(bytes));
    }
    if let Some(bytes) = options.output_limit {
        results.push(handle.set_output_limit(bytes));
    }
    for input in &options.inputs {
        results.push(handle.write_file_at(input));
    }
    if let Some(text) = options.stdin {
        results.push(handle.write_bytes(text));
    }
    results.iter().filter(|result| !accepted(result)).count()
}

/// Process exit status for a termination reason
pub fn exit_code(reason: &TerminationReason) -> i32 {
    if reason.is_normal_exit() {
        0
    } else {
        1
    }
}

/// Run the CLI; returns the exit status for the procbox process.
pub fn run() -> Result<i32> {
    // Must be installed before any thread exists
    let signals = SignalHandler::init().map_err(anyhow::Error::msg)?;

    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            timeout_ms,
            time_limit_ms,
            memory_limit,
            output_limit,
            inputs,
            stdin,
            json,
            executable,
        } => {
            let config = load_config(config.as_deref())?;
            let handle = crate::create_process_with_config(&config, executable);

            let options = RunOptions {
                timeout_ms,
                time_limit_ms,
                memory_limit,
                output_limit,
                inputs,
                stdin,
            };
            let ignored = prepare(&handle, options);
            if ignored > 0 {
                log::info!(
                    "{} request(s) not supported by the {} backend",
                    ignored,
                    handle.backend_name()
                );
            }

            let copied = stream_output(&handle, &signals);

            let report = RunReport::collect(&handle);
            let code = exit_code(&report.reason);
            if json {
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!("{}", report.exit_reason);
            }
            handle.close();

            copied.context("Failed to write program output")?;
            Ok(code)
        }
        Commands::Capabilities { config } => {
            let config = load_config(config.as_deref())?;
            let backend = create_backend(&config);
            let report = serde_json::json!({
                "backend": backend.name(),
                "capabilities": backend.capabilities(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
    }
}

/// Copy output to stdout. SIGINT/SIGTERM force the process down, and so
/// does a stdout that stops accepting data.
fn stream_output(handle: &ProcessHandle, signals: &SignalHandler) -> std::io::Result<u64> {
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                if signals.wait_for_signal(Duration::from_millis(50)) {
                    log::info!(
                        "signal {} received, forcing {} down",
                        signals.get_signal(),
                        handle.id()
                    );
                    handle.force_exit();
                    return;
                }
            }
        });

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut reader = handle;
        let copied = std::io::copy(&mut reader, &mut out).and_then(|n| out.flush().map(|_| n));
        if copied.is_err() {
            handle.force_exit();
        }
        done.store(true, Ordering::SeqCst);
        copied
    })
}
