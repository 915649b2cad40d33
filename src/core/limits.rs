//! Safety limit enforcer.
//!
//! Before the process exists limits are recorded and handed to the backend
//! at spawn. Afterwards each update is re-probed against the live process,
//! since live adjustment is the one capability that can change at runtime.

use crate::backend::{BackendProcess, Capabilities, LimitOutcome};
use crate::config::types::{CapabilityResult, Limit, LimitSettings, Operation, Unsupported};
use crate::core::lifecycle::LifecycleState;

pub struct LimitEnforcer {
    caps: Capabilities,
    backend: String,
    pending: LimitSettings,
}

impl LimitEnforcer {
    /// `defaults` are the backend's limits; kinds the backend cannot
    /// enforce are dropped here.
    pub fn new(caps: Capabilities, backend: impl Into<String>, defaults: LimitSettings) -> Self {
        let mut pending = LimitSettings::default();
        for limit in defaults.iter() {
            if caps.supports_limit(limit.kind()) {
                pending.set(limit);
            }
        }
        Self {
            caps,
            backend: backend.into(),
            pending,
        }
    }

    /// Limits the process will be spawned with.
    pub fn spawn_limits(&self) -> &LimitSettings {
        &self.pending
    }

    pub fn apply(
        &mut self,
        state: &LifecycleState,
        process: Option<&dyn BackendProcess>,
        limit: Limit,
    ) -> CapabilityResult {
        let kind = limit.kind();
        if !self.caps.supports_limit(kind) {
            return Err(self.unsupported(limit));
        }

        match state {
            LifecycleState::Created => {
                self.pending.set(limit);
                Ok(())
            }
            LifecycleState::Running | LifecycleState::Terminated(_) => {
                if !self.caps.live_limits {
                    return Err(self.unsupported(limit));
                }
                match process.map(|process| process.set_limit(limit)) {
                    Some(LimitOutcome::Unsupported) => Err(self.unsupported(limit)),
                    Some(LimitOutcome::Applied) | None => {
                        self.pending.set(limit);
                        Ok(())
                    }
                }
            }
        }
    }

    fn unsupported(&self, limit: Limit) -> Unsupported {
        log::debug!(
            "{} backend cannot apply {} now, prior limit stays in force",
            self.backend,
            limit.kind().name()
        );
        Unsupported {
            operation: Operation::SetLimit(limit.kind()),
            backend: self.backend.clone(),
        }
    }
}
