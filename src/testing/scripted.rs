//! Scripted in-memory backend.
//!
//! Runs a fixed [`ScriptedProgram`] instead of an executable, so the core
//! can be exercised deterministically without forking. The capability
//! descriptor is configurable, which lets tests pin down how every
//! operation answers for any backend shape.

use crate::backend::{Backend, BackendProcess, Capabilities, LimitOutcome, ReadChunk, WriteOutcome};
use crate::config::types::{
    BoundKind, ControlError, InputItem, Limit, LimitKind, LimitSettings, ResourceKind, Result,
    TerminationReason,
};
use crate::core::latch::TerminationLatch;
use std::collections::VecDeque;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Resident size every scripted program reports while alive
pub const SCRIPTED_RSS: u64 = 64 * 1024;

/// What a scripted process does once started
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptedProgram {
    /// Copy input to output; exit 0 once input is sealed
    Echo,
    /// Print these bytes and exit 0
    Emit(Vec<u8>),
    /// Burn CPU until killed
    Spin,
    /// Exit immediately with this code
    Exit(i32),
    /// Die immediately from this signal
    Crash(i32),
    /// The spawn itself fails
    FailLaunch,
}

pub struct ScriptedBackend {
    program: ScriptedProgram,
    caps: Capabilities,
    spawned: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(program: ScriptedProgram) -> Self {
        Self {
            program,
            caps: Capabilities::full(),
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn with_capabilities(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Number of processes this backend has started.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        self.caps.clone()
    }

    fn spawn(&self, executable: &Path, limits: &LimitSettings) -> Result<Box<dyn BackendProcess>> {
        if self.program == ScriptedProgram::FailLaunch {
            return Err(ControlError::Spawn(format!(
                "cannot execute {}",
                executable.display()
            )));
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);

        let process = ScriptedProcess::start(self.program.clone());
        for limit in limits.iter() {
            process.set_limit(limit);
        }
        Ok(Box::new(process))
    }
}

#[derive(Default)]
struct State {
    output: VecDeque<u8>,
    output_total: u64,
    output_window: Option<(u64, u64)>,
    timer_generation: [u64; 2],
    cpu_at_exit: Option<u64>,
    /// Peak reset after exit; nothing is resident from then on
    peak_cleared: bool,
}

struct Shared {
    program: ScriptedProgram,
    started: Instant,
    state: Mutex<State>,
    wake: Condvar,
    latch: TerminationLatch,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cpu_now(&self) -> u64 {
        match self.program {
            ScriptedProgram::Spin => self.started.elapsed().as_micros() as u64,
            _ => 0,
        }
    }

    /// First caller wins; readers are woken either way.
    fn finish(&self, state: &mut State, reason: TerminationReason) {
        if self.latch.resolve(reason) {
            state.cpu_at_exit = Some(self.cpu_now());
        }
        self.wake.notify_all();
    }

    fn emit(&self, state: &mut State, bytes: &[u8]) {
        state.output.extend(bytes.iter().copied());
        state.output_total += bytes.len() as u64;
        if let Some((baseline, limit)) = state.output_window {
            if state.output_total - baseline > limit {
                self.finish(state, TerminationReason::OutputLimitExceeded);
            }
        }
        self.wake.notify_all();
    }
}

pub struct ScriptedProcess {
    shared: Arc<Shared>,
}

impl ScriptedProcess {
    fn start(program: ScriptedProgram) -> Self {
        let shared = Arc::new(Shared {
            program: program.clone(),
            started: Instant::now(),
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            latch: TerminationLatch::new(),
        });

        {
            let mut state = shared.lock();
            match &program {
                ScriptedProgram::Emit(bytes) => {
                    shared.emit(&mut state, bytes);
                    shared.finish(&mut state, TerminationReason::Exited { code: 0 });
                }
                ScriptedProgram::Exit(code) => {
                    shared.finish(&mut state, TerminationReason::Exited { code: *code })
                }
                ScriptedProgram::Crash(signal) => {
                    shared.finish(&mut state, TerminationReason::Signaled { signal: *signal })
                }
                _ => {}
            }
        }

        Self { shared }
    }

    /// Fire `kind` after `after` unless the process ends or the limit is
    /// replaced first.
    fn arm_timer(&self, kind: LimitKind, after: Duration) {
        let slot = match kind {
            LimitKind::Timeout => 0,
            _ => 1,
        };
        let generation = {
            let mut state = self.shared.lock();
            state.timer_generation[slot] += 1;
            state.timer_generation[slot]
        };

        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            if shared.latch.wait_timeout(after).is_some() {
                return;
            }
            let mut state = shared.lock();
            if state.timer_generation[slot] == generation {
                shared.finish(&mut state, TerminationReason::for_limit(kind));
            }
        });
    }

    fn input_bytes(item: InputItem) -> std::io::Result<Vec<u8>> {
        match item {
            InputItem::Bytes(bytes) => Ok(bytes),
            InputItem::Path(path) => std::fs::read(path),
            InputItem::FdRange { fd, offset, length } => {
                let file = std::fs::File::from(fd);
                let mut buf = vec![0u8; length as usize];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
        }
    }
}

impl BackendProcess for ScriptedProcess {
    fn write(&self, item: InputItem) -> WriteOutcome {
        if self.shared.latch.is_resolved() {
            return WriteOutcome::Refused;
        }
        let bytes = match Self::input_bytes(item) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::debug!("scripted input unreadable: {}", err);
                return WriteOutcome::Partial { written: 0 };
            }
        };
        if self.shared.program == ScriptedProgram::Echo {
            let mut state = self.shared.lock();
            self.shared.emit(&mut state, &bytes);
        }
        WriteOutcome::Delivered
    }

    fn seal_input(&self) {
        if self.shared.program == ScriptedProgram::Echo {
            let mut state = self.shared.lock();
            self.shared
                .finish(&mut state, TerminationReason::Exited { code: 0 });
        }
    }

    fn read(&self, max_len: usize) -> ReadChunk {
        let mut state = self.shared.lock();
        loop {
            if !state.output.is_empty() {
                let n = max_len.min(state.output.len());
                return ReadChunk::Bytes(state.output.drain(..n).collect());
            }
            if self.shared.latch.is_resolved() {
                return ReadChunk::NoMoreOutput;
            }
            state = self
                .shared
                .wake
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn query(&self, kind: ResourceKind, bound: BoundKind) -> Option<u64> {
        let state = self.shared.lock();
        let exited = state.cpu_at_exit;
        match (kind, bound) {
            (ResourceKind::CpuTime, BoundKind::Lower) => {
                Some(exited.unwrap_or_else(|| self.shared.cpu_now()))
            }
            (ResourceKind::CpuTime, BoundKind::Upper) => exited,
            (ResourceKind::CurrentMemory, _) => {
                Some(if exited.is_some() { 0 } else { SCRIPTED_RSS })
            }
            (ResourceKind::PeakMemory, _) if state.peak_cleared => Some(0),
            (ResourceKind::PeakMemory, BoundKind::Lower) => Some(SCRIPTED_RSS),
            (ResourceKind::PeakMemory, BoundKind::Upper) => {
                exited.map(|_| SCRIPTED_RSS)
            }
            (ResourceKind::OutputBytes, BoundKind::Lower) => Some(state.output_total),
            (ResourceKind::OutputBytes, BoundKind::Upper) => {
                exited.map(|_| state.output_total)
            }
        }
    }

    fn set_limit(&self, limit: Limit) -> LimitOutcome {
        if self.shared.latch.is_resolved() {
            return LimitOutcome::Applied;
        }
        match limit {
            Limit::Timeout(after) => self.arm_timer(LimitKind::Timeout, after),
            Limit::TimeLimit(after) => {
                if self.shared.program == ScriptedProgram::Spin {
                    self.arm_timer(LimitKind::TimeLimit, after);
                }
            }
            Limit::MemoryLimit(bytes) => {
                if bytes < SCRIPTED_RSS {
                    let mut state = self.shared.lock();
                    self.shared
                        .finish(&mut state, TerminationReason::MemoryLimitExceeded);
                }
            }
            Limit::OutputLimit(bytes) => {
                let mut state = self.shared.lock();
                state.output_window = Some((state.output_total, bytes));
            }
        }
        LimitOutcome::Applied
    }

    /// Resident size never changes while alive, so only a reset after exit
    /// moves the baseline.
    fn reset_peak_memory(&self) -> bool {
        let mut state = self.shared.lock();
        if state.cpu_at_exit.is_some() {
            state.peak_cleared = true;
        }
        true
    }

    fn force_exit(&self) {
        let mut state = self.shared.lock();
        self.shared.finish(&mut state, TerminationReason::ForcedExit);
    }

    fn wait_terminated(&self) -> TerminationReason {
        self.shared.latch.wait()
    }
}
