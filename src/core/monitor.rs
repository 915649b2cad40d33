//! Resource monitor.
//!
//! Never claims more certainty than the backend can back up: a bound the
//! descriptor does not cover, or a reading the backend cannot produce right
//! now, comes back as the conservative sentinel (0 / `u64::MAX`).

use crate::backend::{BackendProcess, Capabilities};
use crate::config::types::{BoundKind, CapabilityResult, Operation, ResourceKind, Unsupported};

pub struct ResourceMonitor {
    caps: Capabilities,
    backend: String,
}

impl ResourceMonitor {
    pub fn new(caps: Capabilities, backend: impl Into<String>) -> Self {
        Self {
            caps,
            backend: backend.into(),
        }
    }

    pub fn measure(
        &self,
        process: Option<&dyn BackendProcess>,
        kind: ResourceKind,
        bound: BoundKind,
    ) -> u64 {
        if !self.caps.supports_bound(kind, bound) {
            return bound.sentinel();
        }
        process
            .and_then(|process| process.query(kind, bound))
            .unwrap_or_else(|| bound.sentinel())
    }

    /// Peak baseline := current reading. Before start there is nothing to
    /// reset, so a capable backend trivially succeeds.
    pub fn reset_peak(&self, process: Option<&dyn BackendProcess>) -> CapabilityResult {
        if !self.caps.peak_reset {
            return Err(self.unsupported());
        }
        match process {
            Some(process) if !process.reset_peak_memory() => {
                log::debug!("{} backend could not reset peak memory now", self.backend);
                Err(self.unsupported())
            }
            _ => Ok(()),
        }
    }

    fn unsupported(&self) -> Unsupported {
        Unsupported {
            operation: Operation::ResetPeakMemory,
            backend: self.backend.clone(),
        }
    }
}
