//! External delivery channels for run results.
//!
//! Both channels are Python tools shipped in the project checkout and run
//! through a [`systest_core::CommandRunner`]. Delivery failures are
//! reported to the caller and never retried.

pub mod honeycomb;
pub mod slack;
