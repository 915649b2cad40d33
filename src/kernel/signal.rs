//! Process-group kills for sandboxed children, plus async-safe shutdown
//! handling for the CLI.

use log::{debug, info};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Report of one group kill
#[derive(Clone, Debug, Default)]
pub struct KillReport {
    pub kill_sent: bool,
    pub notes: Vec<String>,
}

/// Send `sig` to the process group led by `pid`, falling back to the
/// single process when the group is gone or not ours.
fn signal_group(pid: Pid, sig: Signal, report: &mut KillReport) -> bool {
    match signal::killpg(pid, sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => match signal::kill(pid, sig) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                report.notes.push(format!("{} to pid {} failed: {}", sig, pid, e));
                false
            }
        },
        Err(e) => {
            report
                .notes
                .push(format!("group {} fallback used: {}", sig, e));
            signal::kill(pid, sig).is_ok()
        }
    }
}

/// SIGKILL the whole group right away.
pub fn kill_group(pid: u32) -> KillReport {
    let mut report = KillReport::default();
    let pid = Pid::from_raw(pid as i32);
    report.kill_sent = signal_group(pid, Signal::SIGKILL, &mut report);
    debug!("SIGKILL sent to group {} (delivered: {})", pid, report.kill_sent);
    report
}

/// SIGKILL whatever is left of group `pgid` once its leader has been
/// reaped. No single-pid fallback: the leader's pid may be reused.
pub fn kill_stragglers(pgid: u32) -> bool {
    signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL).is_ok()
}

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Initialize signal handlers
    /// Must be called early in main() before any threads are spawned
    pub fn init() -> Result<Self, String> {
        Self::install_signal_handlers()?;
        Ok(Self)
    }

    /// Install signal handlers for SIGINT, SIGTERM, SIGHUP
    fn install_signal_handlers() -> Result<(), String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        // SAFETY: the handler only stores to atomics, which is async-signal-safe
        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;

            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;

            signal::sigaction(Signal::SIGHUP, &sig_action)
                .map_err(|e| format!("Failed to install SIGHUP handler: {}", e))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }

    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    /// Returns true if a signal arrived before `timeout`
    pub fn wait_for_signal(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        while start.elapsed() < timeout {
            if self.shutdown_requested() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        false
    }
}
