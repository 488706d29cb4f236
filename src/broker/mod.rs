//! The `broker` module holds the message engine.
//!
//! - `message`: the stored message record and its validation rules
//! - `pattern`: topic and subscription mask matching
//! - `topic`: per-topic ordered storage with deferred sorting
//! - `routing`: copy/move expansion of publish topics
//! - `registry`: connected sessions and their change events
//! - `engine`: the `Broker` tying them together
//! - `scheduler`: background delivery, expiry and heartbeat tasks

pub mod engine;
pub mod message;
pub mod pattern;
pub mod registry;
pub mod routing;
pub mod scheduler;
pub mod topic;

pub use engine::{Broker, GarbageReport, PROTOCOL_VERSION, TopicSummary};

#[cfg(test)]
mod tests;
