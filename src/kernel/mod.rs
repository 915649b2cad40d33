//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> reap -> procfs -> cgroup

pub mod cgroup;
pub mod procfs;
pub mod reap;
pub mod signal;
