//! Backend boundary
//!
//! A backend is the isolation mechanism that actually spawns and confines
//! the process. The core talks to it only through these two traits and the
//! [`Capabilities`] descriptor it publishes.

pub mod capabilities;
pub mod factory;
pub mod native;

pub use capabilities::{BoundSupport, Capabilities, InputSupport, LimitSupport};

use crate::config::types::{
    BoundKind, InputItem, Limit, LimitSettings, ResourceKind, Result, TerminationReason,
};
use std::path::Path;

/// Result of handing one input item to a running process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Item accepted in full (delivery may still be asynchronous)
    Delivered,
    /// Process went away after `written` bytes of the item
    Partial { written: u64 },
    /// Process no longer accepts input
    Refused,
}

/// Result of one blocking output read
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadChunk {
    Bytes(Vec<u8>),
    /// Woken without data; the caller retries
    WouldBlock,
    /// Output is exhausted and the process has terminated
    NoMoreOutput,
}

/// Result of a live limit update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitOutcome {
    Applied,
    Unsupported,
}

/// Factory side of a backend
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Queried once per handle and cached there.
    fn capabilities(&self) -> Capabilities;

    /// Limits in force when the caller sets none. Unlimited unless the
    /// backend says otherwise.
    fn default_limits(&self) -> LimitSettings {
        LimitSettings::default()
    }

    /// Start `executable` with `limits` already in force.
    fn spawn(&self, executable: &Path, limits: &LimitSettings) -> Result<Box<dyn BackendProcess>>;
}

/// One running (or finished) sandboxed process.
///
/// Methods take `&self` so that monitoring and `force_exit` can run while
/// another thread is blocked in [`BackendProcess::read`].
pub trait BackendProcess: Send + Sync {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn write(&self, item: InputItem) -> WriteOutcome;

    /// No more input will follow the items already written.
    fn seal_input(&self);

    /// Block until output is available or the process is gone.
    fn read(&self, max_len: usize) -> ReadChunk;

    /// `None` when no reliable reading exists for that bound.
    fn query(&self, kind: ResourceKind, bound: BoundKind) -> Option<u64>;

    /// Apply `limit` to usage accrued from now on.
    fn set_limit(&self, limit: Limit) -> LimitOutcome;

    /// Move the peak-memory baseline to the current reading.
    fn reset_peak_memory(&self) -> bool;

    /// Request termination; must not block on the process.
    fn force_exit(&self);

    /// Block until the process has terminated. Same answer on every call.
    fn wait_terminated(&self) -> TerminationReason;
}
