//! procbox: a portable control surface for one untrusted executable
//! Start it lazily, feed it input, read its output, bound its resources and
//! learn why it stopped, whatever sandbox backend actually runs it.
//!
//! # Architecture
//!
//! ## Caller Surface ([`core`])
//! - [`core::handle`]: `ProcessHandle`, one per execution
//! - [`core::lifecycle`]: `Created -> Running -> Terminated` state machine
//! - [`core::input`]: FIFO input queue with abort-on-refusal
//! - [`core::output`]: blocking reads with carry-over and sticky EOF
//! - [`core::monitor`]: lower/upper usage bounds with sentinel policy
//! - [`core::limits`]: pending vs live limit updates
//! - [`core::latch`]: exactly-once termination latch
//!
//! ## Backends ([`backend`])
//! - [`backend::capabilities`]: what a backend can do, queried once per handle
//! - [`backend::native`]: real child process with watchdog and I/O pumps
//! - [`backend::factory`]: backend selection from configuration
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: process-group kills and CLI shutdown signals
//! - [`kernel::reap`]: `wait4` reaping with final rusage
//! - [`kernel::procfs`]: `/proc/<pid>` CPU and memory readings
//! - [`kernel::cgroup`]: optional cgroup v2 accounting
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: procbox.json loading and validation
//! - [`config::types`]: Shared type definitions and closed enums
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::scripted`]: deterministic in-memory backend
//!
//! # Design Principles
//!
//! 1. **Lazy start** - creating a handle never spawns
//! 2. **Capability-gated** - unsupported means a typed failure, never a fault
//! 3. **Never overclaim** - unknown bounds are reported as 0 / `u64::MAX`
//! 4. **One transition to Terminated** - the first reason wins

// Kernel Primitives
pub mod kernel;

// Backend boundary and implementations
pub mod backend;

// Backend-independent control core
pub mod core;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the procbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use backend::{Backend, BackendProcess, Capabilities};
pub use config::types::*;
pub use core::handle::{HandleOptions, ProcessHandle};
pub use core::lifecycle::LifecycleState;

use config::loader::ControlConfig;
use std::path::PathBuf;

/// Handle for `executable` on the backend named by ./procbox.json, or the
/// native backend with built-in defaults when there is no usable file.
pub fn create_process(executable: impl Into<PathBuf>) -> ProcessHandle {
    let config = ControlConfig::load_default().unwrap_or_else(|e| {
        log::warn!("ignoring configuration: {}", e);
        ControlConfig::default()
    });
    create_process_with_config(&config, executable)
}

pub fn create_process_with_config(
    config: &ControlConfig,
    executable: impl Into<PathBuf>,
) -> ProcessHandle {
    let backend = backend::factory::create_backend(config);
    ProcessHandle::with_options(
        backend,
        executable,
        HandleOptions {
            seal_input_on_read: config.seal_input_on_read,
        },
    )
}
