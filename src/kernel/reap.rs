//! Non-blocking reaping with resource usage
//!
//! wait4 instead of waitpid so the final CPU time and max RSS come back
//! with the exit status.

use crate::config::types::{ControlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

/// Final accounting for a reaped process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    pub kind: ExitKind,
    /// user + system time in microseconds
    pub cpu_us: u64,
    pub max_rss_bytes: u64,
}

fn timeval_us(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1_000_000 + tv.tv_usec.max(0) as u64
}

/// `Ok(None)` while the process is still running.
pub fn try_reap(pid: u32) -> Result<Option<ExitRecord>> {
    let mut status: libc::c_int = 0;
    // SAFETY: an all-zero rusage is a valid value for this plain C struct
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    // SAFETY: both out-pointers refer to live locals for the whole call
    let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, libc::WNOHANG, &mut usage) };
    if rc == 0 {
        return Ok(None);
    }
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(None);
        }
        return Err(ControlError::Process(format!("wait4({}): {}", pid, err)));
    }

    let kind = if libc::WIFEXITED(status) {
        ExitKind::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitKind::Signaled(libc::WTERMSIG(status))
    } else {
        // stopped/continued are not reported without WUNTRACED
        return Ok(None);
    };

    Ok(Some(ExitRecord {
        kind,
        cpu_us: timeval_us(usage.ru_utime) + timeval_us(usage.ru_stime),
        // ru_maxrss is in KiB on Linux
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    fn reap_blocking(pid: u32) -> ExitRecord {
        for _ in 0..500 {
            if let Some(record) = try_reap(pid).unwrap() {
                return record;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("process {} did not exit", pid);
    }

    #[test]
    fn test_reap_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let record = reap_blocking(child.id());
        assert_eq!(record.kind, ExitKind::Exited(3));
        assert!(record.max_rss_bytes > 0);
    }

    #[test]
    fn test_reap_signal() {
        let child = Command::new("sh").args(["-c", "kill -9 $$"]).spawn().unwrap();
        let record = reap_blocking(child.id());
        assert_eq!(record.kind, ExitKind::Signaled(libc::SIGKILL));
    }

    #[test]
    fn test_running_is_none() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        assert!(try_reap(child.id()).unwrap().is_none());
        child.kill().unwrap();
        reap_blocking(child.id());
    }
}
