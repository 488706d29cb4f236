//! # topicd
//!
//! `topicd` is a topic-based message broker built with Rust. Clients connect
//! over WebSockets, publish JSON messages to named topics and receive
//! deliveries matched against their subscriptions. Every delivery stays in
//! flight until the receiving client acknowledges it; acknowledgments
//! complete, retry or report back to the publisher.
//!
//! ## Core Modules
//!
//! - `broker`: topic index, routing, client registry and the delivery engine.
//! - `client`: broker-side state of a connected client session.
//! - `auth`: token-based handshake authentication.
//! - `config`: loading and merging of server configuration.
//! - `persistence`: durable message and resource storage (`sled` or memory),
//!   plus YAML resource documents.
//! - `transport`: wire frames, the per-connection state machine and the
//!   WebSocket server.
//! - `utils`: shared error type, logging setup and clock.

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
