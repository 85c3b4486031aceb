//! Quota, access-control and usage-metrics core for the voice transcription bot.
//!
//! The chat layer talks to [`policy::UsagePolicy`] only. Persistence and the
//! clock sit behind ports so the stores can be driven from tests.

pub mod access;
pub mod config;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod ports;
pub mod quota;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use errors::{Error, Result};
