//! Per-socket protocol state machine.
//!
//! A connection starts `Unauthenticated` and only accepts `hello`. A
//! successful handshake makes it `Active` with a broker session; a refused
//! one leaves it `Rejected`: the socket stays open but every further frame
//! is ignored, so the client can read the error-bearing `welcome` and
//! disconnect on its own.

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::transport::message::{CLIENT_FRAME_KINDS, ClientFrame, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Rejected,
    Active(u64),
    Closed,
}

#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    sender: UnboundedSender<Outbound>,
}

/// Decode one inbound frame. Unknown kinds and malformed frames both yield
/// `None`.
pub fn decode_frame(raw: &[u8]) -> Option<ClientFrame> {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Dropping unparsable frame: {e}");
            return None;
        }
    };
    let kind = match value.as_object() {
        Some(envelope) if envelope.len() == 1 => envelope.keys().next().cloned(),
        _ => None,
    };
    let Some(kind) = kind else {
        warn!("Dropping frame without a single-key envelope");
        return None;
    };
    if !CLIENT_FRAME_KINDS.contains(&kind.as_str()) {
        debug!("Ignoring unknown frame kind '{kind}'");
        return None;
    }
    match serde_json::from_value::<ClientFrame>(value) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Dropping malformed '{kind}' frame: {e}");
            None
        }
    }
}

impl Connection {
    pub fn new(sender: UnboundedSender<Outbound>) -> Self {
        Self {
            state: ConnectionState::Unauthenticated,
            sender,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn unique_id(&self) -> Option<u64> {
        match self.state {
            ConnectionState::Active(unique_id) => Some(unique_id),
            _ => None,
        }
    }

    pub fn handle_raw(&mut self, broker: &mut Broker, raw: &[u8], now: i64) {
        if let Some(frame) = decode_frame(raw) {
            self.handle_frame(broker, frame, now);
        }
    }

    pub fn handle_frame(&mut self, broker: &mut Broker, frame: ClientFrame, now: i64) {
        match self.state {
            ConnectionState::Unauthenticated => self.handshake(broker, frame, now),
            ConnectionState::Active(unique_id) => {
                if broker.session(unique_id).is_none() {
                    // dropped by the heartbeat check
                    self.state = ConnectionState::Closed;
                    return;
                }
                broker.touch(unique_id, now);
                Self::dispatch(broker, unique_id, frame, now);
            }
            ConnectionState::Rejected | ConnectionState::Closed => {}
        }
    }

    fn handshake(&mut self, broker: &mut Broker, frame: ClientFrame, now: i64) {
        let ClientFrame::Hello(hello) = frame else {
            debug!("Ignoring frame received before hello");
            return;
        };
        self.state = match broker.open_session(hello, self.sender.clone(), now) {
            Ok(unique_id) => ConnectionState::Active(unique_id),
            Err(_) => ConnectionState::Rejected,
        };
    }

    fn dispatch(broker: &mut Broker, unique_id: u64, frame: ClientFrame, now: i64) {
        match frame {
            ClientFrame::Hello(_) => {
                debug!("Session {unique_id} sent a second hello, ignoring");
            }
            ClientFrame::Heartbeat {} => {}
            ClientFrame::Subscribe { topics } => {
                broker.subscribe(unique_id, &topics);
            }
            ClientFrame::Publish {
                topic,
                message,
                options,
            } => {
                // outcome already reported through publishAck
                let _ = broker.publish(unique_id, &topic, message, options, now);
            }
            ClientFrame::DeliveryAck(ack) => {
                broker.handle_delivery_ack(unique_id, &ack, now);
            }
        }
    }

    /// Tear down the broker session, if any. Idempotent.
    pub fn close(&mut self, broker: &mut Broker) {
        if let ConnectionState::Active(unique_id) = self.state {
            broker.disconnect(unique_id);
        }
        self.state = ConnectionState::Closed;
    }
}
