//! The `client` module defines the broker-side state of a connected client.
//!
//! It provides the `Session` struct, which encapsulates everything the
//! broker tracks for a connection that completed its handshake: identity,
//! subscriptions, in-flight deliveries and heartbeat timestamps.

pub mod session;
pub use session::{HeartbeatStatus, PendingDelivery, Session};
