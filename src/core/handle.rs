//! Caller-facing process handle.
//!
//! One handle per sandboxed execution. Every method takes `&self`, so a
//! handle shared behind an `Arc` can be force-exited or measured from one
//! thread while another is blocked in [`ProcessHandle::read`]. Ordinary use
//! is still one logical caller at a time.
//!
//! Lock order: output -> lifecycle -> input -> limits.

use crate::backend::{Backend, BackendProcess, Capabilities};
use crate::config::types::{
    BoundKind, CapabilityResult, InputItem, InputLevel, Limit, Operation, ResourceKind,
    TerminationReason, Unsupported,
};
use crate::core::input::{FlushOutcome, InputBuffer};
use crate::core::lifecycle::{Lifecycle, LifecycleState};
use crate::core::limits::LimitEnforcer;
use crate::core::monitor::ResourceMonitor;
use crate::core::output::OutputChannel;
use crate::observability::audit::{self, LifecycleEvent};
use std::io::Read;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

/// Per-handle behaviour switches
#[derive(Clone, Debug)]
pub struct HandleOptions {
    /// Close the process's input on the first read or exit-reason wait
    pub seal_input_on_read: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            seal_input_on_read: true,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProcessHandle {
    id: String,
    executable: PathBuf,
    backend: Arc<dyn Backend>,
    caps: Capabilities,
    options: HandleOptions,
    lifecycle: Mutex<Lifecycle>,
    input: Mutex<InputBuffer>,
    output: Mutex<OutputChannel>,
    limits: Mutex<LimitEnforcer>,
    monitor: ResourceMonitor,
    exit_text: OnceLock<String>,
}

impl ProcessHandle {
    /// Create a handle. Never fails: nothing is spawned until the first
    /// call that needs the process, and a failed spawn shows up as a
    /// `LaunchFailed` termination reason.
    pub fn create(backend: Arc<dyn Backend>, executable: impl Into<PathBuf>) -> Self {
        Self::with_options(backend, executable, HandleOptions::default())
    }

    pub fn with_options(
        backend: Arc<dyn Backend>,
        executable: impl Into<PathBuf>,
        options: HandleOptions,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let executable = executable.into();
        let caps = backend.capabilities();
        let backend_name = backend.name().to_string();

        if !caps.input.is_monotone() {
            log::warn!(
                "{} backend supports a general input level without the more specific ones",
                backend_name
            );
        }

        audit::emit(
            &id,
            LifecycleEvent::ProcessCreated {
                executable: executable.display().to_string(),
                backend: backend_name.clone(),
            },
        );

        let limits = LimitEnforcer::new(caps.clone(), backend_name.clone(), backend.default_limits());
        Self {
            lifecycle: Mutex::new(Lifecycle::new(id.clone())),
            input: Mutex::new(InputBuffer::new()),
            output: Mutex::new(OutputChannel::new()),
            limits: Mutex::new(limits),
            monitor: ResourceMonitor::new(caps.clone(), backend_name),
            exit_text: OnceLock::new(),
            id,
            executable,
            backend,
            caps,
            options,
        }
    }

    /// Correlation id used in logs and audit events.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Descriptor probed when the handle was created.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.lifecycle).state().clone()
    }

    // ---- input ------------------------------------------------------

    /// Queue the whole file at `path` as input.
    pub fn write_file_at(&self, path: impl AsRef<Path>) -> CapabilityResult {
        self.enqueue(
            Operation::WriteFileAt,
            InputItem::Path(path.as_ref().to_path_buf()),
        )
    }

    /// Queue `length` bytes of `fd` starting at `offset`.
    ///
    /// The descriptor is duplicated, so the caller may close its copy as
    /// soon as this returns.
    pub fn write_file_range(&self, fd: impl AsFd, offset: u64, length: u64) -> CapabilityResult {
        if !self.caps.supports_input(InputLevel::FdRange) {
            return Err(self.unsupported(Operation::WriteFileRange));
        }
        match fd.as_fd().try_clone_to_owned() {
            Ok(fd) => self.enqueue(
                Operation::WriteFileRange,
                InputItem::FdRange { fd, offset, length },
            ),
            Err(err) => {
                // undeliverable; dropped like input to a dead process
                log::warn!("[{}] cannot duplicate input descriptor: {}", self.id, err);
                audit::emit(&self.id, LifecycleEvent::InputDiscarded { items: 1 });
                Ok(())
            }
        }
    }

    pub fn write_bytes(&self, bytes: impl Into<Vec<u8>>) -> CapabilityResult {
        self.enqueue(Operation::WriteBytes, InputItem::Bytes(bytes.into()))
    }

    /// Result depends only on the descriptor. Input for a process that is
    /// already gone is accepted and dropped.
    fn enqueue(&self, operation: Operation, item: InputItem) -> CapabilityResult {
        if !self.caps.supports_input(item.level()) {
            return Err(self.unsupported(operation));
        }

        let lifecycle = lock(&self.lifecycle);
        if lifecycle.state().is_terminated() {
            log::debug!("[{}] dropping {} for terminated process", self.id, operation);
            audit::emit(&self.id, LifecycleEvent::InputDiscarded { items: 1 });
            return Ok(());
        }
        lock(&self.input).push(item);
        Ok(())
    }

    fn flush_input(&self, process: &dyn BackendProcess) {
        let mut input = lock(&self.input);
        let outcome = if self.options.seal_input_on_read {
            input.seal(process)
        } else {
            input.flush(process)
        };
        if let FlushOutcome::Aborted { discarded, .. } = outcome {
            log::debug!("[{}] process stopped taking input, {} item(s) dropped", self.id, discarded);
            audit::emit(&self.id, LifecycleEvent::InputDiscarded { items: discarded });
        }
    }

    fn start(&self) -> Option<Arc<dyn BackendProcess>> {
        let mut lifecycle = lock(&self.lifecycle);
        let limits = lock(&self.limits);
        lifecycle.ensure_started(self.backend.as_ref(), &self.executable, limits.spawn_limits())
    }

    fn process(&self) -> Option<Arc<dyn BackendProcess>> {
        lock(&self.lifecycle).process()
    }

    // ---- output -----------------------------------------------------

    /// Read up to `buf.len()` bytes of output.
    ///
    /// Starts the process if needed, flushes pending input, then blocks
    /// until output arrives or the process is gone. `None` is end of
    /// output; every later call returns `None` without blocking.
    pub fn read(&self, buf: &mut [u8]) -> Option<usize> {
        let mut output = lock(&self.output);
        if output.is_exhausted() {
            return None;
        }

        let process = self.start();
        if let Some(process) = &process {
            self.flush_input(process.as_ref());
        }

        let result = output.read(process.as_deref(), buf);
        if result.is_none() {
            if let Some(process) = process {
                let reason = process.wait_terminated();
                lock(&self.lifecycle).terminate(reason);
            }
        }
        result
    }

    /// Convenience wrapper returning an owned chunk.
    pub fn read_chunk(&self, max_len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Some(buf)
    }

    // ---- limits -----------------------------------------------------

    pub fn set_timeout(&self, timeout: Duration) -> CapabilityResult {
        self.set_limit(Limit::Timeout(timeout))
    }

    pub fn set_time_limit(&self, time_limit: Duration) -> CapabilityResult {
        self.set_limit(Limit::TimeLimit(time_limit))
    }

    pub fn set_memory_limit(&self, bytes: u64) -> CapabilityResult {
        self.set_limit(Limit::MemoryLimit(bytes))
    }

    pub fn set_output_limit(&self, bytes: u64) -> CapabilityResult {
        self.set_limit(Limit::OutputLimit(bytes))
    }

    /// Apply `limit` to usage accrued from now on. On failure the prior
    /// limit stays in force.
    pub fn set_limit(&self, limit: Limit) -> CapabilityResult {
        let lifecycle = lock(&self.lifecycle);
        let process = lifecycle.process();
        let result = lock(&self.limits).apply(lifecycle.state(), process.as_deref(), limit);

        let kind = limit.kind();
        match &result {
            Ok(()) => audit::emit(
                &self.id,
                LifecycleEvent::LimitApplied {
                    kind,
                    value: limit.raw(),
                    live: process.is_some(),
                },
            ),
            Err(_) => audit::emit(&self.id, LifecycleEvent::LimitRejected { kind }),
        }
        result
    }

    // ---- measurements -------------------------------------------------

    pub fn measure(&self, kind: ResourceKind, bound: BoundKind) -> u64 {
        self.monitor.measure(self.process().as_deref(), kind, bound)
    }

    /// CPU time in microseconds.
    pub fn get_cumulative_time_usage(&self, bound: BoundKind) -> u64 {
        self.measure(ResourceKind::CpuTime, bound)
    }

    /// Bytes.
    pub fn get_current_memory_usage(&self, bound: BoundKind) -> u64 {
        self.measure(ResourceKind::CurrentMemory, bound)
    }

    /// Bytes, since the last [`reset_peak_memory_usage`](Self::reset_peak_memory_usage).
    pub fn get_peak_memory_usage(&self, bound: BoundKind) -> u64 {
        self.measure(ResourceKind::PeakMemory, bound)
    }

    pub fn get_output_usage(&self, bound: BoundKind) -> u64 {
        self.measure(ResourceKind::OutputBytes, bound)
    }

    pub fn reset_peak_memory_usage(&self) -> CapabilityResult {
        self.monitor.reset_peak(self.process().as_deref())
    }

    // ---- termination ----------------------------------------------------

    /// Terminate now. Never starts a process that has not started yet.
    /// Idempotent.
    pub fn force_exit(&self) {
        let process = lock(&self.lifecycle).begin_force_exit();
        if let Some(process) = process {
            let reason = process.wait_terminated();
            lock(&self.lifecycle).terminate(reason);
        }
    }

    /// Block until the process has terminated and return why.
    pub fn termination_reason(&self) -> TerminationReason {
        if let LifecycleState::Terminated(reason) = lock(&self.lifecycle).state() {
            return reason.clone();
        }

        match self.start() {
            Some(process) => {
                self.flush_input(process.as_ref());
                let reason = process.wait_terminated();
                lock(&self.lifecycle).terminate(reason.clone());
                reason
            }
            None => match self.state() {
                LifecycleState::Terminated(reason) => reason,
                _ => TerminationReason::LaunchFailed {
                    message: "no backend process".to_string(),
                },
            },
        }
    }

    /// Human-readable termination reason. Blocks until termination.
    ///
    /// The text lives as long as the handle; copy it to keep it past
    /// [`close`](Self::close).
    ///
    /// ```compile_fail
    /// let handle = procbox::create_process("/bin/true");
    /// let reason = handle.get_exit_reason();
    /// handle.close();
    /// println!("{}", reason);
    /// ```
    pub fn get_exit_reason(&self) -> &str {
        if let Some(text) = self.exit_text.get() {
            return text;
        }
        let reason = self.termination_reason();
        self.exit_text.get_or_init(|| reason.to_string())
    }

    /// Release the handle and everything it owns. A process that is still
    /// running is killed first.
    ///
    /// ```compile_fail
    /// let handle = procbox::create_process("/bin/true");
    /// handle.close();
    /// handle.force_exit();
    /// ```
    pub fn close(self) {
        drop(self);
    }

    fn unsupported(&self, operation: Operation) -> Unsupported {
        Unsupported {
            operation,
            backend: self.backend.name().to_string(),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *lifecycle.state() == LifecycleState::Running {
            if let Some(process) = lifecycle.begin_force_exit() {
                let reason = process.wait_terminated();
                lifecycle.terminate(reason);
            }
        }
        audit::emit(&self.id, LifecycleEvent::Closed);
    }
}

impl Read for &ProcessHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(ProcessHandle::read(&**self, buf).unwrap_or(0))
    }
}

impl Read for ProcessHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(ProcessHandle::read(&*self, buf).unwrap_or(0))
    }
}
