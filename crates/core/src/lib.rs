//! Building blocks of the system-test runner.
//!
//! - [`config`]: environment and CLI resolution, validated up front.
//! - [`checksum`]: disk image checksum lookup.
//! - [`artifacts`]: artifact acquisition and `.gz` extraction.
//! - [`dependencies`]: the `system_env/dependencies` tree read by the driver.
//! - [`supervisor`]: process-group supervision with timeout and cancellation.
//! - [`cleanup`]: temp directory registry drained at exit.
//! - [`command`]: the [`CommandRunner`] seam for every external tool.

pub mod artifacts;
pub mod checksum;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod dependencies;
pub mod driver;
pub mod error;
pub mod git;
pub mod names;
pub mod net;
pub mod ssh;
pub mod supervisor;

pub use command::{CommandRunner, CommandSpec, SystemCommandRunner};
pub use config::{RunConfig, RunnerArgs};
pub use error::CoreError;
