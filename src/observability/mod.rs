//! Observability
//!
//! Structured audit events for lifecycle visibility.

pub mod audit;
