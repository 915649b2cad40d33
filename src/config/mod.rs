//! Configuration
//!
//! Closed vocabularies, error types, and the procbox.json loader.

pub mod loader;
pub mod types;
