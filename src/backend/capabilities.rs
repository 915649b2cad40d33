//! Backend capability descriptor.
//!
//! Every caller-facing operation consults this before touching the backend;
//! an operation the descriptor does not cover is a capability failure, never
//! a fault.

use crate::config::types::{BoundKind, InputLevel, LimitKind, ResourceKind};
use serde::{Deserialize, Serialize};

/// Which bounds a backend can produce for one resource
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundSupport {
    pub lower: bool,
    pub upper: bool,
}

impl BoundSupport {
    pub const BOTH: BoundSupport = BoundSupport {
        lower: true,
        upper: true,
    };
    pub const NONE: BoundSupport = BoundSupport {
        lower: false,
        upper: false,
    };
    pub const LOWER_ONLY: BoundSupport = BoundSupport {
        lower: true,
        upper: false,
    };

    pub fn supports(&self, bound: BoundKind) -> bool {
        match bound {
            BoundKind::Lower => self.lower,
            BoundKind::Upper => self.upper,
        }
    }
}

/// Input generality levels a backend accepts
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputSupport {
    pub path: bool,
    pub fd_range: bool,
    pub bytes: bool,
}

impl InputSupport {
    pub fn supports(&self, level: InputLevel) -> bool {
        match level {
            InputLevel::Path => self.path,
            InputLevel::FdRange => self.fd_range,
            InputLevel::Bytes => self.bytes,
        }
    }

    /// A more general level supported without every more specific one
    /// goes against the "support lower generality too" guideline.
    pub fn is_monotone(&self) -> bool {
        (!self.bytes || self.fd_range) && (!self.fd_range || self.path)
    }
}

/// Limit families a backend can enforce
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitSupport {
    pub timeout: bool,
    pub time_limit: bool,
    pub memory_limit: bool,
    pub output_limit: bool,
}

impl LimitSupport {
    pub fn supports(&self, kind: LimitKind) -> bool {
        match kind {
            LimitKind::Timeout => self.timeout,
            LimitKind::TimeLimit => self.time_limit,
            LimitKind::MemoryLimit => self.memory_limit,
            LimitKind::OutputLimit => self.output_limit,
        }
    }
}

/// Static description of what a concrete backend supports
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub input: InputSupport,
    pub limits: LimitSupport,
    /// Limits may be changed once the process is running
    pub live_limits: bool,
    pub cpu_time: BoundSupport,
    pub current_memory: BoundSupport,
    pub peak_memory: BoundSupport,
    pub output_bytes: BoundSupport,
    pub peak_reset: bool,
}

impl Capabilities {
    /// The least a conforming backend offers: path input, nothing else.
    pub fn minimal() -> Self {
        Self {
            input: InputSupport {
                path: true,
                fd_range: false,
                bytes: false,
            },
            limits: LimitSupport {
                timeout: false,
                time_limit: false,
                memory_limit: false,
                output_limit: false,
            },
            live_limits: false,
            cpu_time: BoundSupport::NONE,
            current_memory: BoundSupport::NONE,
            peak_memory: BoundSupport::NONE,
            output_bytes: BoundSupport::NONE,
            peak_reset: false,
        }
    }

    /// Everything the descriptor can express.
    pub fn full() -> Self {
        Self {
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

    pub fn bounds(&self, kind: ResourceKind) -> BoundSupport {
        match kind {
            ResourceKind::CpuTime => self.cpu_time,
            ResourceKind::CurrentMemory => self.current_memory,
            ResourceKind::PeakMemory => self.peak_memory,
            ResourceKind::OutputBytes => self.output_bytes,
        }
    }

    pub fn supports_input(&self, level: InputLevel) -> bool {
        self.input.supports(level)
    }

    pub fn supports_limit(&self, kind: LimitKind) -> bool {
        self.limits.supports(kind)
    }

    pub fn supports_bound(&self, kind: ResourceKind, bound: BoundKind) -> bool {
        self.bounds(kind).supports(bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_only_accepts_paths() {
        let caps = Capabilities::minimal();
        assert!(caps.supports_input(InputLevel::Path));
        assert!(!caps.supports_input(InputLevel::FdRange));
        assert!(!caps.supports_input(InputLevel::Bytes));
        for kind in LimitKind::ALL {
            assert!(!caps.supports_limit(kind));
        }
    }

    #[test]
    fn test_monotone_input_support() {
        assert!(Capabilities::full().input.is_monotone());
        assert!(Capabilities::minimal().input.is_monotone());

        let skewed = InputSupport {
            path: true,
            fd_range: false,
            bytes: true,
        };
        assert!(!skewed.is_monotone());
    }

    #[test]
    fn test_bound_lookup() {
        let mut caps = Capabilities::full();
        caps.cpu_time = BoundSupport::LOWER_ONLY;
        assert!(caps.supports_bound(ResourceKind::CpuTime, BoundKind::Lower));
        assert!(!caps.supports_bound(ResourceKind::CpuTime, BoundKind::Upper));
        assert!(caps.supports_bound(ResourceKind::PeakMemory, BoundKind::Upper));
    }
}
