//! Core types and structures for the procbox system

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which side of the true value a measurement is allowed to err on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BoundKind {
    /// Never overstates true usage
    #[serde(rename = "lower")]
    Lower,
    /// Never understates true usage
    #[serde(rename = "upper")]
    Upper,
}

impl BoundKind {
    /// Value reported when no reliable reading exists.
    pub fn sentinel(self) -> u64 {
        match self {
            BoundKind::Lower => 0,
            BoundKind::Upper => u64::MAX,
        }
    }
}

/// Resource quantities tracked per process
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Cumulative CPU time (microseconds)
    #[serde(rename = "cpu_time")]
    CpuTime,
    /// Current memory (bytes)
    #[serde(rename = "current_memory")]
    CurrentMemory,
    /// Peak memory since the last reset (bytes)
    #[serde(rename = "peak_memory")]
    PeakMemory,
    /// Bytes produced on the output stream
    #[serde(rename = "output_bytes")]
    OutputBytes,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::CpuTime,
        ResourceKind::CurrentMemory,
        ResourceKind::PeakMemory,
        ResourceKind::OutputBytes,
    ];
}

/// Safety limit families
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// Wall clock
    #[serde(rename = "timeout")]
    Timeout,
    /// CPU time
    #[serde(rename = "time_limit")]
    TimeLimit,
    #[serde(rename = "memory_limit")]
    MemoryLimit,
    #[serde(rename = "output_limit")]
    OutputLimit,
}

impl LimitKind {
    pub const ALL: [LimitKind; 4] = [
        LimitKind::Timeout,
        LimitKind::TimeLimit,
        LimitKind::MemoryLimit,
        LimitKind::OutputLimit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LimitKind::Timeout => "timeout",
            LimitKind::TimeLimit => "time_limit",
            LimitKind::MemoryLimit => "memory_limit",
            LimitKind::OutputLimit => "output_limit",
        }
    }
}

/// A limit value tagged with its family.
///
/// Every limit is windowed: it bounds usage accrued after the moment it is
/// applied, except memory which bounds the current footprint.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Limit {
    Timeout(Duration),
    TimeLimit(Duration),
    MemoryLimit(u64),
    OutputLimit(u64),
}

impl Limit {
    pub fn kind(&self) -> LimitKind {
        match self {
            Limit::Timeout(_) => LimitKind::Timeout,
            Limit::TimeLimit(_) => LimitKind::TimeLimit,
            Limit::MemoryLimit(_) => LimitKind::MemoryLimit,
            Limit::OutputLimit(_) => LimitKind::OutputLimit,
        }
    }

    /// Limit value in the unit the matching resource is measured in
    /// (microseconds for time, bytes otherwise).
    pub fn raw(&self) -> u64 {
        match self {
            Limit::Timeout(d) | Limit::TimeLimit(d) => {
                u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
            }
            Limit::MemoryLimit(bytes) | Limit::OutputLimit(bytes) => *bytes,
        }
    }
}

/// Limits handed to a backend at spawn time. `None` means unlimited.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitSettings {
    pub timeout: Option<Duration>,
    pub time_limit: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub output_limit: Option<u64>,
}

impl LimitSettings {
    pub fn set(&mut self, limit: Limit) {
        match limit {
            Limit::Timeout(d) => self.timeout = Some(d),
            Limit::TimeLimit(d) => self.time_limit = Some(d),
            Limit::MemoryLimit(b) => self.memory_limit = Some(b),
            Limit::OutputLimit(b) => self.output_limit = Some(b),
        }
    }

    pub fn get(&self, kind: LimitKind) -> Option<Limit> {
        match kind {
            LimitKind::Timeout => self.timeout.map(Limit::Timeout),
            LimitKind::TimeLimit => self.time_limit.map(Limit::TimeLimit),
            LimitKind::MemoryLimit => self.memory_limit.map(Limit::MemoryLimit),
            LimitKind::OutputLimit => self.output_limit.map(Limit::OutputLimit),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Limit> + '_ {
        LimitKind::ALL.into_iter().filter_map(|kind| self.get(kind))
    }
}

/// Input generality levels, most specific first
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InputLevel {
    #[serde(rename = "path")]
    Path,
    #[serde(rename = "fd_range")]
    FdRange,
    #[serde(rename = "bytes")]
    Bytes,
}

/// One pending piece of input
#[derive(Debug)]
pub enum InputItem {
    /// Whole file by path
    Path(PathBuf),
    /// `length` bytes of an open file starting at `offset`
    FdRange {
        fd: OwnedFd,
        offset: u64,
        length: u64,
    },
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl InputItem {
    pub fn level(&self) -> InputLevel {
        match self {
            InputItem::Path(_) => InputLevel::Path,
            InputItem::FdRange { .. } => InputLevel::FdRange,
            InputItem::Bytes(_) => InputLevel::Bytes,
        }
    }
}

/// Why a sandboxed process stopped running - CLOSED VOCABULARY
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationReason {
    /// Process returned from main / called exit
    #[serde(rename = "exited")]
    Exited { code: i32 },
    /// Killed by a signal it did not receive from us
    #[serde(rename = "signaled")]
    Signaled { signal: i32 },
    /// `force_exit` was requested
    #[serde(rename = "forced_exit")]
    ForcedExit,
    /// Wall clock limit
    #[serde(rename = "timeout")]
    Timeout,
    /// CPU time limit
    #[serde(rename = "time_limit")]
    TimeLimitExceeded,
    #[serde(rename = "memory_limit")]
    MemoryLimitExceeded,
    #[serde(rename = "output_limit")]
    OutputLimitExceeded,
    /// Backend could not start the executable
    #[serde(rename = "launch_failed")]
    LaunchFailed { message: String },
}

impl TerminationReason {
    /// Reason a limit breach maps to.
    pub fn for_limit(kind: LimitKind) -> Self {
        match kind {
            LimitKind::Timeout => TerminationReason::Timeout,
            LimitKind::TimeLimit => TerminationReason::TimeLimitExceeded,
            LimitKind::MemoryLimit => TerminationReason::MemoryLimitExceeded,
            LimitKind::OutputLimit => TerminationReason::OutputLimitExceeded,
        }
    }

    pub fn is_normal_exit(&self) -> bool {
        matches!(self, TerminationReason::Exited { code: 0 })
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Exited { code } => {
                write!(f, "Exited normally (return code {})", code)
            }
            TerminationReason::Signaled { signal } => {
                write!(f, "Killed by signal {} ({})", signal, signal_name(*signal))
            }
            TerminationReason::ForcedExit => write!(f, "Terminated (forced exit)"),
            TerminationReason::Timeout => write!(f, "Terminated (timeout)"),
            TerminationReason::TimeLimitExceeded => {
                write!(f, "Terminated (time limit exceeded)")
            }
            TerminationReason::MemoryLimitExceeded => {
                write!(f, "Terminated (memory limit exceeded)")
            }
            TerminationReason::OutputLimitExceeded => {
                write!(f, "Terminated (output limit exceeded)")
            }
            TerminationReason::LaunchFailed { message } => {
                write!(f, "Failed to launch ({})", message)
            }
        }
    }
}

fn signal_name(signal: i32) -> &'static str {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(sig) => sig.as_str(),
        Err(_) => "unknown",
    }
}

/// Operations that can be refused for lack of backend support
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    WriteFileAt,
    WriteFileRange,
    WriteBytes,
    SetLimit(LimitKind),
    ResetPeakMemory,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::WriteFileAt => write!(f, "write_file_at"),
            Operation::WriteFileRange => write!(f, "write_file_range"),
            Operation::WriteBytes => write!(f, "write_bytes"),
            Operation::SetLimit(kind) => write!(f, "set_{}", kind.name()),
            Operation::ResetPeakMemory => write!(f, "reset_peak_memory_usage"),
        }
    }
}

/// Capability failure: the backend cannot do this right now.
///
/// Never describes process misbehaviour; callers may ignore it or retry
/// with a less demanding variant.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{operation} is not supported by the {backend} backend")]
pub struct Unsupported {
    pub operation: Operation,
    pub backend: String,
}

/// Success / capability-failure outcome of caller-facing operations
pub type CapabilityResult = std::result::Result<(), Unsupported>;

/// Custom error types for procbox infrastructure
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl From<nix::errno::Errno> for ControlError {
    fn from(err: nix::errno::Errno) -> Self {
        ControlError::Process(err.to_string())
    }
}

/// Result type alias for procbox infrastructure operations
pub type Result<T> = std::result::Result<T, ControlError>;
