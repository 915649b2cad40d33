//! Process lifecycle controller.
//!
//! Sole owner of the `Created -> Running -> Terminated` state machine. The
//! handle keeps it behind a mutex so every transition is atomic; nothing
//! else decides that the process has started or ended.

use crate::backend::{Backend, BackendProcess};
use crate::config::types::{LimitSettings, TerminationReason};
use crate::observability::audit::{self, LifecycleEvent};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Terminated(TerminationReason),
}

impl LifecycleState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, LifecycleState::Terminated(_))
    }
}

pub struct Lifecycle {
    handle_id: String,
    state: LifecycleState,
    process: Option<Arc<dyn BackendProcess>>,
}

impl Lifecycle {
    pub fn new(handle_id: impl Into<String>) -> Self {
        Self {
            handle_id: handle_id.into(),
            state: LifecycleState::Created,
            process: None,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Backend process, once one has been spawned. Kept after termination
    /// so remaining output and final measurements stay reachable.
    pub fn process(&self) -> Option<Arc<dyn BackendProcess>> {
        self.process.clone()
    }

    /// Spawn on first use. Idempotent once running or terminated.
    ///
    /// A spawn failure is not an error: the handle goes straight to
    /// `Terminated(LaunchFailed)` and `None` is returned.
    pub fn ensure_started(
        &mut self,
        backend: &dyn Backend,
        executable: &Path,
        limits: &LimitSettings,
    ) -> Option<Arc<dyn BackendProcess>> {
        if self.state != LifecycleState::Created {
            return self.process.clone();
        }

        match backend.spawn(executable, limits) {
            Ok(process) => {
                let process: Arc<dyn BackendProcess> = Arc::from(process);
                log::info!(
                    "[{}] started {} on {} backend (pid {:?})",
                    self.handle_id,
                    executable.display(),
                    backend.name(),
                    process.pid()
                );
                audit::emit(
                    &self.handle_id,
                    LifecycleEvent::ProcessStarted {
                        backend: backend.name().to_string(),
                        pid: process.pid(),
                    },
                );
                self.process = Some(Arc::clone(&process));
                self.state = LifecycleState::Running;
                Some(process)
            }
            Err(err) => {
                log::warn!(
                    "[{}] failed to launch {}: {}",
                    self.handle_id,
                    executable.display(),
                    err
                );
                audit::emit(
                    &self.handle_id,
                    LifecycleEvent::LaunchFailed {
                        message: err.to_string(),
                    },
                );
                self.terminate(TerminationReason::LaunchFailed {
                    message: err.to_string(),
                });
                None
            }
        }
    }

    /// Record termination. Monotonic: returns false when already terminated.
    pub fn terminate(&mut self, reason: TerminationReason) -> bool {
        if self.state.is_terminated() {
            return false;
        }
        log::info!("[{}] terminated: {}", self.handle_id, reason);
        audit::emit(
            &self.handle_id,
            LifecycleEvent::Terminated {
                reason: reason.clone(),
            },
        );
        self.state = LifecycleState::Terminated(reason);
        true
    }

    /// Begin a forced exit.
    ///
    /// A never-started handle terminates on the spot without spawning.
    /// For a running process the kill is requested and the process is
    /// returned so the caller can wait for it outside the lock.
    pub fn begin_force_exit(&mut self) -> Option<Arc<dyn BackendProcess>> {
        match self.state {
            LifecycleState::Created => {
                audit::emit(&self.handle_id, LifecycleEvent::ForcedExit { started: false });
                self.terminate(TerminationReason::ForcedExit);
                None
            }
            LifecycleState::Running => {
                let process = self.process.clone()?;
                audit::emit(&self.handle_id, LifecycleEvent::ForcedExit { started: true });
                process.force_exit();
                Some(process)
            }
            LifecycleState::Terminated(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::scripted::{ScriptedBackend, ScriptedProgram};

    #[test]
    fn test_starts_once() {
        let backend = ScriptedBackend::new(ScriptedProgram::Echo);
        let mut lifecycle = Lifecycle::new("lc-test");
        let limits = LimitSettings::default();

        let first = lifecycle.ensure_started(&backend, Path::new("/bin/echo"), &limits);
        assert!(first.is_some());
        assert_eq!(lifecycle.state(), &LifecycleState::Running);

        let second = lifecycle.ensure_started(&backend, Path::new("/bin/echo"), &limits);
        assert!(second.is_some());
        assert_eq!(backend.spawn_count(), 1);
    }

    #[test]
    fn test_launch_failure_terminates_immediately() {
        let backend = ScriptedBackend::new(ScriptedProgram::FailLaunch);
        let mut lifecycle = Lifecycle::new("lc-test");

        let process =
            lifecycle.ensure_started(&backend, Path::new("/missing"), &LimitSettings::default());
        assert!(process.is_none());
        assert!(matches!(
            lifecycle.state(),
            LifecycleState::Terminated(TerminationReason::LaunchFailed { .. })
        ));
    }

    #[test]
    fn test_terminate_is_monotonic() {
        let mut lifecycle = Lifecycle::new("lc-test");
        assert!(lifecycle.terminate(TerminationReason::Timeout));
        assert!(!lifecycle.terminate(TerminationReason::Exited { code: 0 }));
        assert_eq!(
            lifecycle.state(),
            &LifecycleState::Terminated(TerminationReason::Timeout)
        );
    }

    #[test]
    fn test_force_exit_before_start_does_not_spawn() {
        let backend = ScriptedBackend::new(ScriptedProgram::Echo);
        let mut lifecycle = Lifecycle::new("lc-test");

        assert!(lifecycle.begin_force_exit().is_none());
        assert_eq!(
            lifecycle.state(),
            &LifecycleState::Terminated(TerminationReason::ForcedExit)
        );

        let process =
            lifecycle.ensure_started(&backend, Path::new("/bin/echo"), &LimitSettings::default());
        assert!(process.is_none());
        assert_eq!(backend.spawn_count(), 0);
    }
}
