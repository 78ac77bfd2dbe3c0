//! `run-system-tests` library crate.
//!
//! Re-exports the orchestration modules for integration testing. The
//! binary entrypoint lives in `main.rs`.

pub mod orchestrator;
pub mod report;

pub use orchestrator::Orchestrator;
