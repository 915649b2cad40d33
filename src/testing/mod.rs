//! Testing infrastructure
//!
//! Deterministic stand-ins for real backends.

pub mod scripted;
