//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `topicd` broker.
//!
//! This module centralizes reusable components such as the crate error type,
//! logging setup and the wall clock used by the engine.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};

/// Milliseconds since the UNIX epoch.
///
/// The engine takes `now` as an explicit argument everywhere; only the
/// transport and scheduler tasks read the clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
