//! Resource governance through cgroup v2.

pub mod v2;

pub use v2::{CgroupInstance, CgroupV2};
