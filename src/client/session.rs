//! Session state of an authenticated connection
//!
//! `Session` models a connection that completed its `hello` handshake. It
//! holds the sending side of the per-connection channel drained by the
//! transport writer task, the compiled subscription set and the waitlist of
//! deliveries awaiting acknowledgment. The waitlist doubles as admission
//! control: a session with `max_workers` outstanding deliveries is not
//! offered more work.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::auth::AuthRecord;
use crate::broker::message::{Message, Qos};
use crate::broker::pattern::Subscription;
use crate::transport::message::{Outbound, ServerFrame};

/// Share of the heartbeat interval after which an idle sender pings.
const HEARTBEAT_SEND_RATIO: f64 = 0.45;

/// A delivery handed to this session and not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub topic: String,
    pub qos: Qos,
    pub source_unique_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Alive,
    /// Nothing was received for a full interval.
    Expired,
}

#[derive(Debug)]
pub struct Session {
    pub unique_id: u64,
    pub client_id: String,
    pub version: String,
    pub auth: Option<AuthRecord>,
    pub max_workers: usize,
    subscriptions: Vec<Subscription>,
    waitlist: HashMap<String, PendingDelivery>,
    last_send: i64,
    last_receive: i64,
    sender: UnboundedSender<Outbound>,
}

impl Session {
    pub fn new(
        unique_id: u64,
        client_id: &str,
        version: &str,
        max_workers: usize,
        auth: Option<AuthRecord>,
        sender: UnboundedSender<Outbound>,
        now: i64,
    ) -> Self {
        Self {
            unique_id,
            client_id: client_id.to_string(),
            version: version.to_string(),
            auth,
            max_workers,
            subscriptions: Vec::new(),
            waitlist: HashMap::new(),
            last_send: now,
            last_receive: now,
            sender,
        }
    }

    /// Replace the subscription set. Strings failing the mask are dropped.
    /// Returns the number of subscriptions kept.
    pub fn subscribe<S: AsRef<str>>(&mut self, topics: &[S]) -> usize {
        self.subscriptions = topics
            .iter()
            .filter_map(|t| Subscription::compile(t.as_ref()))
            .collect();
        self.subscriptions.len()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|s| s.as_str())
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|s| s.matches(topic))
    }

    #[inline]
    pub fn has_enough_worker(&self) -> bool {
        self.waitlist.len() < self.max_workers
    }

    pub fn in_flight(&self) -> usize {
        self.waitlist.len()
    }

    /// Queue a frame for the writer task. Returns `false` once the
    /// connection is gone.
    pub fn send(&mut self, frame: ServerFrame, now: i64) -> bool {
        self.last_send = now;
        self.sender.send(Outbound::Frame(frame)).is_ok()
    }

    /// Register the delivery in the waitlist, then send it.
    pub fn deliver(&mut self, message: &Message, now: i64) -> bool {
        self.waitlist.insert(
            message.id().to_string(),
            PendingDelivery {
                topic: message.topic.clone(),
                qos: message.options.qos,
                source_unique_id: message.source_unique_id,
            },
        );
        debug!(
            "delivering {} on {} to session {}",
            message.id(),
            message.topic,
            self.unique_id
        );
        self.send(
            ServerFrame::Delivery {
                topic: message.topic.clone(),
                message: message.payload.clone(),
                options: message.options.clone(),
                source: message.source_client_id.clone(),
            },
            now,
        )
    }

    pub fn pending(&self, message_id: &str) -> Option<&PendingDelivery> {
        self.waitlist.get(message_id)
    }

    pub fn release(&mut self, message_id: &str) -> Option<PendingDelivery> {
        self.waitlist.remove(message_id)
    }

    pub fn touch(&mut self, now: i64) {
        self.last_receive = now;
    }

    /// Ping when idle for 45% of the interval; report expiry when nothing
    /// arrived for the whole interval.
    pub fn heartbeat_tick(&mut self, now: i64, interval_ms: i64) -> HeartbeatStatus {
        if now - self.last_receive > interval_ms {
            return HeartbeatStatus::Expired;
        }
        if (now - self.last_send) as f64 > interval_ms as f64 * HEARTBEAT_SEND_RATIO {
            self.send(ServerFrame::Heartbeat {}, now);
        }
        HeartbeatStatus::Alive
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}
