//! Native backend.
//!
//! Runs the executable as a real child in its own process group. Three
//! threads serve each process:
//!
//! - an input writer that feeds stdin from an unbounded queue, so the
//!   caller never blocks on a child that is not reading
//! - an output pump that drains stdout into an unbounded queue and counts
//!   output bytes
//! - a watchdog that reaps with `wait4`, samples usage every poll
//!   interval and kills the group when a limit is breached
//!
//! Limit windows start when the limit is set: the timeout runs from that
//! instant, the CPU and output limits count usage accrued after it. The
//! memory limit is absolute.

use crate::backend::{
    Backend, BackendProcess, BoundSupport, Capabilities, InputSupport, LimitOutcome, LimitSupport,
    ReadChunk, WriteOutcome,
};
use crate::config::loader::ControlConfig;
use crate::config::types::{
    BoundKind, ControlError, InputItem, Limit, LimitSettings, ResourceKind, Result,
    TerminationReason,
};
use crate::core::latch::TerminationLatch;
use crate::kernel::cgroup::{CgroupInstance, CgroupV2};
use crate::kernel::procfs;
use crate::kernel::reap::{self, ExitKind, ExitRecord};
use crate::kernel::signal;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Backend that spawns real processes
pub struct NativeBackend {
    defaults: LimitSettings,
    poll_interval: Duration,
    io_chunk_size: usize,
    cgroups: Option<Arc<CgroupV2>>,
}

impl NativeBackend {
    pub fn new(config: &ControlConfig) -> Self {
        let cgroups = if config.cgroup.enabled {
            let cgroups = CgroupV2::new(config.cgroup.base_path.clone());
            if cgroups.is_available() {
                Some(Arc::new(cgroups))
            } else {
                log::warn!(
                    "cgroup v2 not usable at {}, falling back to /proc accounting",
                    config.cgroup.base_path.display()
                );
                None
            }
        } else {
            None
        };

        Self {
            defaults: config.limits.to_settings(),
            poll_interval: config.poll_interval(),
            io_chunk_size: config.io_chunk_size,
            cgroups,
        }
    }

    fn attach_cgroup(&self, pid: u32) -> Option<CgroupInstance> {
        let cgroups = self.cgroups.as_ref()?;
        let instance = match cgroups.create(&uuid::Uuid::new_v4().to_string()) {
            Ok(instance) => instance,
            Err(e) => {
                log::warn!("cgroup setup failed for pid {}: {}", pid, e);
                return None;
            }
        };
        if let Err(e) = instance.attach_process(pid) {
            log::warn!("cgroup attach failed for pid {}: {}", pid, e);
            let _ = instance.remove();
            return None;
        }
        Some(instance)
    }
}

impl Backend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            input: InputSupport {
                path: true,
                fd_range: true,
                bytes: true,
            },
            limits: LimitSupport {
                timeout: true,
                time_limit: true,
                memory_limit: true,
                output_limit: true,
            },
            live_limits: true,
            cpu_time: BoundSupport::BOTH,
            current_memory: BoundSupport::BOTH,
            peak_memory: BoundSupport::BOTH,
            output_bytes: BoundSupport::BOTH,
            peak_reset: true,
        }
    }

    fn default_limits(&self) -> LimitSettings {
        self.defaults.clone()
    }

    fn spawn(&self, executable: &Path, limits: &LimitSettings) -> Result<Box<dyn BackendProcess>> {
        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| ControlError::Spawn(format!("{}: {}", executable.display(), e)))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            signal::kill_group(pid);
            return Err(ControlError::Spawn("child pipes unavailable".to_string()));
        };
        // reaped by the watchdog through wait4
        drop(child);

        let cgroup = self.attach_cgroup(pid);
        if let (Some(instance), Some(bytes)) = (&cgroup, limits.memory_limit) {
            if let Err(e) = instance.set_memory_max(bytes) {
                log::warn!("memory.max not applied for pid {}: {}", pid, e);
            }
        }

        let now = Instant::now();
        let shared = Arc::new(Shared {
            pid,
            latch: TerminationLatch::new(),
            watch: Mutex::new(Watch {
                deadline: limits.timeout.map(|timeout| now + timeout),
                cpu_window: limits
                    .time_limit
                    .map(|limit| (0, limit.as_micros() as u64)),
                memory_limit: limits.memory_limit,
                output_window: limits.output_limit.map(|limit| (0, limit)),
                kill_reason: None,
                exit: None,
                cpu_us: 0,
                group_rss: 0,
                observed_peak: 0,
                peak_reset: false,
            }),
            output_total: AtomicU64::new(0),
            output_done: AtomicBool::new(false),
            cgroup,
        });

        let (input_tx, input_rx) = unbounded();
        let (output_tx, output_rx) = unbounded();

        spawn_input_writer(pid, stdin, input_rx, self.io_chunk_size);
        spawn_output_pump(Arc::clone(&shared), stdout, output_tx, self.io_chunk_size);
        spawn_watchdog(Arc::clone(&shared), self.poll_interval);

        log::debug!("native process {} started: {}", pid, executable.display());
        Ok(Box::new(NativeProcess {
            shared,
            input: Mutex::new(Some(input_tx)),
            output: output_rx,
        }))
    }
}

/// Limit windows, kill bookkeeping and samples. Guarded by one mutex that
/// is also held across reaping, so nothing signals a pid after it has
/// been reaped.
struct Watch {
    deadline: Option<Instant>,
    /// (cpu baseline, allowance) in microseconds
    cpu_window: Option<(u64, u64)>,
    memory_limit: Option<u64>,
    /// (output baseline, allowance) in bytes
    output_window: Option<(u64, u64)>,
    kill_reason: Option<TerminationReason>,
    exit: Option<ExitRecord>,
    cpu_us: u64,
    /// Resident size of the whole group at the last sample
    group_rss: u64,
    /// Highest resident size seen since start or the last reset
    observed_peak: u64,
    peak_reset: bool,
}

struct Shared {
    pid: u32,
    latch: TerminationLatch,
    watch: Mutex<Watch>,
    output_total: AtomicU64,
    output_done: AtomicBool,
    cgroup: Option<CgroupInstance>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Watch> {
        self.watch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refresh usage samples. Caller holds the watch lock.
    ///
    /// CPU and resident size cover the whole process group, so work moved
    /// into child processes still counts against the limits.
    fn sample(&self, watch: &mut Watch) {
        let group = procfs::group_usage(self.pid).ok();
        let cgroup_cpu = self
            .cgroup
            .as_ref()
            .and_then(|cgroup| cgroup.cpu_usage_usec().ok());
        if let Some(cpu) = cgroup_cpu.or(group.map(|group| group.cpu_us)) {
            watch.cpu_us = watch.cpu_us.max(cpu);
        }
        if let Some(group) = group {
            watch.group_rss = group.rss;
        }
        if let Ok(status) = procfs::memory_status(self.pid) {
            watch.observed_peak = watch.observed_peak.max(status.hwm).max(status.rss);
        }
    }

    /// Record why we are killing, then kill. The first reason sticks.
    fn kill(&self, watch: &mut Watch, reason: TerminationReason) {
        if watch.exit.is_some() {
            return;
        }
        if watch.kill_reason.is_none() {
            log::info!("killing process group {}: {}", self.pid, reason);
            watch.kill_reason = Some(reason);
        }
        self.kill_group();
    }

    fn kill_group(&self) {
        let report = signal::kill_group(self.pid);
        for note in &report.notes {
            log::debug!("pid {}: {}", self.pid, note);
        }
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.kill_all() {
                log::debug!("cgroup.kill for pid {}: {}", self.pid, e);
            }
        }
    }

    fn check_limits(&self, watch: &mut Watch) {
        if let Some(deadline) = watch.deadline {
            if Instant::now() >= deadline {
                self.kill(watch, TerminationReason::Timeout);
                return;
            }
        }
        if let Some((baseline, allowance)) = watch.cpu_window {
            if watch.cpu_us.saturating_sub(baseline) > allowance {
                self.kill(watch, TerminationReason::TimeLimitExceeded);
                return;
            }
        }
        if let Some(limit) = watch.memory_limit {
            if watch.group_rss > limit {
                self.kill(watch, TerminationReason::MemoryLimitExceeded);
            }
        }
    }

    /// Count a chunk of `n` bytes and return how many of them fall inside
    /// the output window. Anything past the window is withheld.
    fn account_output(&self, n: usize) -> usize {
        let mut watch = self.lock();
        let before = self.output_total.fetch_add(n as u64, Ordering::SeqCst);
        let Some((baseline, allowance)) = watch.output_window else {
            return n;
        };
        let budget = (baseline + allowance).saturating_sub(before);
        if (n as u64) <= budget {
            return n;
        }
        self.kill(&mut watch, TerminationReason::OutputLimitExceeded);
        budget as usize
    }

    fn reason_for(&self, watch: &mut Watch, record: &ExitRecord) -> TerminationReason {
        if let Some(reason) = watch.kill_reason.take() {
            return reason;
        }
        match record.kind {
            ExitKind::Exited(code) => TerminationReason::Exited { code },
            ExitKind::Signaled(sig) => {
                let oom = self
                    .cgroup
                    .as_ref()
                    .map(|cgroup| cgroup.oom_kill_count() > 0)
                    .unwrap_or(false);
                if oom && sig == libc::SIGKILL {
                    TerminationReason::MemoryLimitExceeded
                } else {
                    TerminationReason::Signaled { signal: sig }
                }
            }
        }
    }

    fn remove_cgroup(&self) {
        let Some(cgroup) = &self.cgroup else {
            return;
        };
        for _ in 0..50 {
            if cgroup.remove().is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        log::warn!("cgroup {} left behind", cgroup.path().display());
    }
}

fn spawn_input_writer(pid: u32, mut stdin: ChildStdin, items: Receiver<InputItem>, chunk: usize) {
    thread::spawn(move || {
        for item in items.iter() {
            if let Err(e) = write_item(&mut stdin, item, chunk) {
                // EPIPE and friends: the child stopped reading
                log::debug!("stdin of pid {} closed: {}", pid, e);
                return;
            }
        }
        // queue sealed: dropping stdin sends EOF
    });
}

fn write_item(stdin: &mut ChildStdin, item: InputItem, chunk: usize) -> std::io::Result<()> {
    match item {
        InputItem::Bytes(bytes) => stdin.write_all(&bytes),
        InputItem::Path(path) => match std::fs::File::open(&path) {
            Ok(mut file) => std::io::copy(&mut file, stdin).map(|_| ()),
            Err(e) => {
                log::warn!("input file {} unreadable, skipped: {}", path.display(), e);
                Ok(())
            }
        },
        InputItem::FdRange { fd, offset, length } => {
            let file = std::fs::File::from(fd);
            let mut buf = vec![0u8; chunk];
            let mut done = 0u64;
            while done < length {
                let want = (length - done).min(chunk as u64) as usize;
                let n = match file.read_at(&mut buf[..want], offset + done) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("input range read failed, rest skipped: {}", e);
                        break;
                    }
                };
                stdin.write_all(&buf[..n])?;
                done += n as u64;
            }
            Ok(())
        }
    }
}

fn spawn_output_pump(
    shared: Arc<Shared>,
    mut stdout: ChildStdout,
    chunks: Sender<Vec<u8>>,
    chunk: usize,
) {
    thread::spawn(move || {
        let mut buf = vec![0u8; chunk];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let allowed = shared.account_output(n);
                    if allowed > 0 {
                        let _ = chunks.send(buf[..allowed].to_vec());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("stdout of pid {} failed: {}", shared.pid, e);
                    break;
                }
            }
        }
        shared.output_done.store(true, Ordering::SeqCst);
    });
}

fn spawn_watchdog(shared: Arc<Shared>, poll_interval: Duration) {
    thread::spawn(move || loop {
        {
            let mut watch = shared.lock();
            match reap::try_reap(shared.pid) {
                Ok(Some(record)) => {
                    watch.cpu_us = watch.cpu_us.max(record.cpu_us);
                    let reason = shared.reason_for(&mut watch, &record);
                    watch.exit = Some(record);
                    drop(watch);

                    // stragglers keep stdout open; take the group down
                    signal::kill_stragglers(shared.pid);
                    if let Some(cgroup) = &shared.cgroup {
                        let _ = cgroup.kill_all();
                    }
                    shared.latch.resolve(reason);
                    shared.remove_cgroup();
                    return;
                }
                Ok(None) => {
                    shared.sample(&mut watch);
                    shared.check_limits(&mut watch);
                }
                Err(e) => {
                    log::error!("lost track of pid {}: {}", shared.pid, e);
                    drop(watch);
                    shared.latch.resolve(TerminationReason::Signaled {
                        signal: libc::SIGKILL,
                    });
                    return;
                }
            }
        }
        thread::sleep(poll_interval);
    });
}

/// One native child process
pub struct NativeProcess {
    shared: Arc<Shared>,
    input: Mutex<Option<Sender<InputItem>>>,
    output: Receiver<Vec<u8>>,
}

impl NativeProcess {
    fn input(&self) -> MutexGuard<'_, Option<Sender<InputItem>>> {
        self.input.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn query_exited(
        &self,
        watch: &Watch,
        exit: &ExitRecord,
        kind: ResourceKind,
        bound: BoundKind,
    ) -> Option<u64> {
        match (kind, bound) {
            (ResourceKind::CpuTime, _) => Some(watch.cpu_us),
            (ResourceKind::CurrentMemory, _) => Some(0),
            (ResourceKind::PeakMemory, BoundKind::Lower) => {
                if watch.peak_reset {
                    Some(watch.observed_peak)
                } else {
                    Some(watch.observed_peak.max(exit.max_rss_bytes))
                }
            }
            (ResourceKind::PeakMemory, BoundKind::Upper) => {
                Some(watch.observed_peak.max(exit.max_rss_bytes))
            }
            (ResourceKind::OutputBytes, BoundKind::Lower) => {
                Some(self.shared.output_total.load(Ordering::SeqCst))
            }
            // exact only once the pump has drained stdout
            (ResourceKind::OutputBytes, BoundKind::Upper) => {
                if self.shared.output_done.load(Ordering::SeqCst) {
                    Some(self.shared.output_total.load(Ordering::SeqCst))
                } else {
                    None
                }
            }
        }
    }

    fn query_running(&self, watch: &mut Watch, kind: ResourceKind, bound: BoundKind) -> Option<u64> {
        match (kind, bound) {
            (ResourceKind::CpuTime, BoundKind::Lower) => {
                self.shared.sample(watch);
                Some(watch.cpu_us)
            }
            (ResourceKind::CpuTime, BoundKind::Upper) => None,
            (ResourceKind::CurrentMemory, bound) => {
                let status = procfs::memory_status(self.shared.pid).ok()?;
                Some(match bound {
                    BoundKind::Lower => status.rss,
                    BoundKind::Upper => status.size.max(status.rss),
                })
            }
            (ResourceKind::PeakMemory, BoundKind::Lower) => {
                self.shared.sample(watch);
                Some(watch.observed_peak)
            }
            (ResourceKind::PeakMemory, BoundKind::Upper) => {
                let status = procfs::memory_status(self.shared.pid).ok()?;
                Some(status.peak.max(watch.observed_peak))
            }
            (ResourceKind::OutputBytes, BoundKind::Lower) => {
                Some(self.shared.output_total.load(Ordering::SeqCst))
            }
            (ResourceKind::OutputBytes, BoundKind::Upper) => None,
        }
    }
}

impl BackendProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.shared.pid)
    }

    fn write(&self, item: InputItem) -> WriteOutcome {
        if self.shared.latch.is_resolved() {
            return WriteOutcome::Refused;
        }
        match self.input().as_ref() {
            Some(sender) => match sender.send(item) {
                Ok(()) => WriteOutcome::Delivered,
                Err(_) => WriteOutcome::Refused,
            },
            None => WriteOutcome::Refused,
        }
    }

    fn seal_input(&self) {
        self.input().take();
    }

    fn read(&self, _max_len: usize) -> ReadChunk {
        match self.output.recv() {
            Ok(bytes) => ReadChunk::Bytes(bytes),
            Err(_) => {
                // stdout closed; output ends when the process does
                self.shared.latch.wait();
                ReadChunk::NoMoreOutput
            }
        }
    }

    fn query(&self, kind: ResourceKind, bound: BoundKind) -> Option<u64> {
        let mut watch = self.shared.lock();
        match watch.exit {
            Some(exit) => self.query_exited(&watch, &exit, kind, bound),
            None => self.query_running(&mut watch, kind, bound),
        }
    }

    fn set_limit(&self, limit: Limit) -> LimitOutcome {
        let mut watch = self.shared.lock();
        if watch.exit.is_some() {
            return LimitOutcome::Applied;
        }
        match limit {
            Limit::Timeout(timeout) => watch.deadline = Some(Instant::now() + timeout),
            Limit::TimeLimit(limit) => {
                self.shared.sample(&mut watch);
                watch.cpu_window = Some((watch.cpu_us, limit.as_micros() as u64));
            }
            Limit::MemoryLimit(bytes) => {
                watch.memory_limit = Some(bytes);
                if let Some(cgroup) = &self.shared.cgroup {
                    if let Err(e) = cgroup.set_memory_max(bytes) {
                        log::warn!("memory.max not updated for pid {}: {}", self.shared.pid, e);
                    }
                }
            }
            Limit::OutputLimit(bytes) => {
                let baseline = self.shared.output_total.load(Ordering::SeqCst);
                watch.output_window = Some((baseline, bytes));
            }
        }
        LimitOutcome::Applied
    }

    fn reset_peak_memory(&self) -> bool {
        let mut watch = self.shared.lock();
        if watch.exit.is_some() {
            // nothing is resident any more
            watch.observed_peak = 0;
            watch.peak_reset = true;
            return true;
        }
        match procfs::reset_peak_rss(self.shared.pid) {
            Ok(()) => {
                watch.observed_peak = procfs::memory_status(self.shared.pid)
                    .map(|status| status.rss)
                    .unwrap_or(0);
                watch.peak_reset = true;
                true
            }
            Err(e) => {
                log::debug!("peak reset refused for pid {}: {}", self.shared.pid, e);
                false
            }
        }
    }

    fn force_exit(&self) {
        let mut watch = self.shared.lock();
        self.shared.kill(&mut watch, TerminationReason::ForcedExit);
    }

    fn wait_terminated(&self) -> TerminationReason {
        self.shared.latch.wait()
    }
}

impl Drop for NativeProcess {
    fn drop(&mut self) {
        if !self.shared.latch.is_resolved() {
            self.force_exit();
        }
    }
}
