//! Shared building blocks for the contact-center E2E harness
//!
//! The poll-until-observed retrier, named poll profiles, harness
//! configuration and scenario fixtures.

pub mod config;
pub mod error;
pub mod retry;

pub use config::{Fixtures, HarnessConfig, PollProfile};
pub use error::{Error, Result};
pub use retry::{Expected, FailureReason, Observation, PollAttempt, PollBounds, PollReport, Retrier};

/// Harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
