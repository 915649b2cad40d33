//! Backend-independent process control core.
//!
//! The handle composes the pieces below. Each piece owns one concern and
//! talks to the backend only through the traits in [`crate::backend`].

pub mod handle;
pub mod input;
pub mod latch;
pub mod lifecycle;
pub mod limits;
pub mod monitor;
pub mod output;
