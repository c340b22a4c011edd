//! meshbed-core: log-synchronized test topology for a multi-agent mesh stack
//!
//! The crate models a mesh topology under test (controller and agent
//! entities, their radios, virtual APs and simulated stations) and the
//! synchronization primitive the whole harness rests on: wait until a log
//! line matching a pattern appears after a known line offset, within a
//! timeout. Two log backends implement that contract, one over a shared
//! filesystem and one over an interactive device console.
//!
//! Process orchestration, packet capture and test-runner scaffolding are
//! external to this crate; they plug in through the `CommandRunner`,
//! `ConsoleSession` and `ControlChannel` traits.

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod console;
pub mod control;
pub mod error;
pub mod logging;
pub mod logwatch;
pub mod topology;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
