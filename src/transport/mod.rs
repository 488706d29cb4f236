//! The `transport` module is responsible for network communication with
//! clients over WebSockets.
//!
//! It defines the wire frames exchanged with clients, the per-connection
//! protocol state machine, and the WebSocket server that feeds client
//! frames to the broker.

pub mod connection;
pub mod message;
pub mod websocket;
