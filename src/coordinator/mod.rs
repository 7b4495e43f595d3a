//! Engine coordinator
//!
//! Builds the engine from configuration, runs startup reconciliation, and
//! owns the process lifecycle through graceful drain and exit status.

pub mod engine;

pub use engine::{Engine, EngineOptions, ExitStatus};
