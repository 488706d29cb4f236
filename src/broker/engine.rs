//! Broker engine
//!
//! This module contains the delivery engine responsible for:
//! - publish intake: validation, routing expansion, indexing, persistence
//! - the delivery pass that matches stored messages to sessions with spare
//!   capacity
//! - acknowledgment resolution: completion, retry with delay, feedback
//!   reports to the publisher
//! - expiry garbage collection and restore from storage
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   single lock (`Arc<Mutex<Broker>>`) shared by the transport and the
//!   scheduler tasks. All engine state is only ever touched by the lock
//!   holder, which keeps the engine single-writer.
//! - The engine is the only owner of `Message` records. The topic index
//!   holds `Arc` clones; the in-flight map and session waitlists hold ids.
//! - Every method takes `now` in epoch milliseconds.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthGate, AuthOutcome, AuthRecord};
use crate::broker::message::{Message, MessageOptions, Qos, copy_message_id, generate_message_id};
use crate::broker::registry::{ClientRegistry, RegistryEvent};
use crate::broker::routing::{RouterRule, RoutingEngine};
use crate::broker::topic::{TopicIndex, TopicRates};
use crate::client::{PendingDelivery, Session};
use crate::config::BrokerSettings;
use crate::persistence::documents::{self, ResourceDocument, ResourceKind};
use crate::persistence::{Backend, LoadProgress, MemoryStore};
use crate::transport::message::{DeliveryAck, Hello, Outbound, ServerFrame};
use crate::utils::{BrokerError, Result};

/// Version announced in `welcome` frames.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of one garbage collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageReport {
    pub deleted: usize,
    /// The sweep found at least `gc_batch` expired messages.
    pub capped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSummary {
    pub topic: String,
    pub stored: usize,
    pub rates: TopicRates,
}

pub struct Broker {
    settings: BrokerSettings,
    messages: HashMap<String, Arc<Message>>,
    index: TopicIndex,
    in_flight: HashMap<String, u64>,
    registry: ClientRegistry,
    routing: RoutingEngine,
    auth: AuthGate,
    backend: Box<dyn Backend>,
}

impl Broker {
    pub fn new(settings: BrokerSettings, backend: Box<dyn Backend>) -> Self {
        let routing = RoutingEngine::new(settings.max_route_passes, settings.max_route_topics);
        let auth = AuthGate::new(settings.allow_anonymous);
        Self {
            settings,
            messages: HashMap::new(),
            index: TopicIndex::new(),
            in_flight: HashMap::new(),
            registry: ClientRegistry::new(),
            routing,
            auth,
            backend,
        }
    }

    /// A broker whose storage lives in memory only.
    pub fn in_memory(settings: BrokerSettings) -> Self {
        Self::new(settings, Box::new(MemoryStore::new()))
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    // ----- resources -------------------------------------------------------

    pub fn install_rules(&mut self, rules: Vec<RouterRule>) -> Result<()> {
        let count = rules.len();
        self.routing.set_rules(rules)?;
        info!("Installed {count} router rules");
        Ok(())
    }

    pub fn install_auth(&mut self, records: Vec<AuthRecord>) -> Result<()> {
        self.auth.set_records(records)?;
        info!("Installed {} auth records", self.auth.len());
        Ok(())
    }

    /// Store resource documents, then reload rules and auth records from
    /// the store.
    pub fn import_resources(&mut self, docs: &[ResourceDocument]) -> Result<usize> {
        let imported = documents::import_documents(self.backend.as_mut(), docs)?;
        self.load_resources()?;
        Ok(imported)
    }

    pub fn load_resources(&mut self) -> Result<()> {
        let rules: Vec<RouterRule> = documents::load_specs(self.backend.as_ref(), ResourceKind::Router)?;
        let records: Vec<AuthRecord> = documents::load_specs(self.backend.as_ref(), ResourceKind::Auth)?;
        self.install_rules(rules)?;
        self.install_auth(records)
    }

    pub fn routing(&self) -> &RoutingEngine {
        &self.routing
    }

    // ----- storage ---------------------------------------------------------

    /// Load every stored message into the index. Expired or invalid records
    /// are dropped from storage instead.
    pub fn restore(&mut self, now: i64) -> Result<usize> {
        let mut progress = |p: LoadProgress| match p {
            LoadProgress::Total(total) => info!("Restoring {total} stored messages"),
            LoadProgress::Percent {
                count,
                percent,
                bytes,
            } => debug!("Restored {count} messages ({percent}%, {bytes} bytes)"),
        };
        let loaded = self.backend.load_all(&mut progress)?;

        let mut dropped = Vec::new();
        let mut restored = 0;
        for mut message in loaded {
            message.source_unique_id = None;
            if message.is_expired(now) {
                dropped.push(message.id().to_string());
                continue;
            }
            if let Err(e) = message.validate() {
                warn!("Dropping stored message '{}': {e}", message.id());
                dropped.push(message.id().to_string());
                continue;
            }
            let message = Arc::new(message);
            if let Some(previous) = self.messages.insert(message.id().to_string(), message.clone()) {
                self.index.remove(&previous.topic, previous.id(), now);
            }
            self.index.add_bulk(message);
            restored += 1;
        }
        self.index.sort_all(now);

        for id in dropped {
            if let Err(e) = self.backend.delete(&id) {
                error!("Failed to delete stored message {id}: {e}");
            }
        }
        info!("Restored {restored} messages");
        Ok(restored)
    }

    pub fn close(&mut self) -> Result<()> {
        self.backend.close()
    }

    // ----- publish intake --------------------------------------------------

    /// Store a message, expanding its topic through the router when
    /// `allow_routing` is set. Returns the message id.
    pub fn add_message(&mut self, mut item: Message, allow_routing: bool, now: i64) -> Result<String> {
        if item.options.message_id.is_empty() {
            item.options.message_id = generate_message_id();
        }
        item.validate()?;
        let id = item.id().to_string();

        if !allow_routing {
            self.store(item, now)?;
            return Ok(id);
        }

        let expansion = self.routing.expand(&item.topic)?;
        if expansion.noop {
            self.store(item, now)?;
            return Ok(id);
        }

        let origin = item.topic.clone();
        let mut copies = 0;
        for destination in &expansion.destinations {
            if *destination == origin {
                continue;
            }
            copies += 1;
            let mut copy = item.clone();
            copy.topic = destination.clone();
            copy.options.message_id = copy_message_id(&id, copies);
            copy.validate()?;
            self.store(copy, now)?;
        }

        if expansion.keep_original {
            self.store(item, now)?;
        } else if self.remove_stored(&id, now).is_some() {
            // a moved re-publish must not leave the old record behind
            self.backend.delete(&id)?;
        }
        debug!("Routed {id} from {origin} to {:?}", expansion.destinations);
        Ok(id)
    }

    /// Handle a `publish` frame from session `unique_id` and answer it with a
    /// `publishAck`.
    pub fn publish(
        &mut self,
        unique_id: u64,
        topic: &str,
        payload: Value,
        mut options: MessageOptions,
        now: i64,
    ) -> Result<String> {
        let Some(client_id) = self.registry.get(unique_id).map(|s| s.client_id.clone()) else {
            return Err(BrokerError::validation("session is not connected"));
        };
        if options.message_id.is_empty() {
            options.message_id = generate_message_id();
        }
        let message_id = options.message_id.clone();
        let message = Message::new(topic, payload, options, now).with_source(&client_id, unique_id);

        let result = self.add_message(message, true, now);
        let error_message = match &result {
            Ok(id) => {
                debug!("{client_id} published {id} to {topic}");
                None
            }
            Err(e) => {
                warn!("{client_id} publish to '{topic}' failed: {e}");
                Some(e.to_string())
            }
        };
        if let Some(session) = self.registry.get_mut(unique_id) {
            session.send(
                ServerFrame::PublishAck {
                    message_id,
                    error_message,
                },
                now,
            );
        }
        result
    }

    fn store(&mut self, item: Message, now: i64) -> Result<()> {
        let id = item.id().to_string();
        if let Err(e) = self.backend.upsert(&id, &item) {
            error!("Failed to persist message {id}: {e}");
            return Err(e);
        }
        if self.messages.contains_key(&id) {
            self.remove_stored(&id, now);
        }
        let item = Arc::new(item);
        self.index.add(item.clone(), now);
        self.messages.insert(id, item);
        Ok(())
    }

    /// Drop a message from memory: canonical map, index and in-flight claim.
    fn remove_stored(&mut self, id: &str, now: i64) -> Option<Arc<Message>> {
        let message = self.messages.remove(id)?;
        self.index.remove(&message.topic, id, now);
        self.in_flight.remove(id);
        Some(message)
    }

    /// Permanently delete a message from memory and storage.
    pub fn delete_message(&mut self, id: &str, now: i64) -> Result<bool> {
        if self.remove_stored(id, now).is_none() {
            return Ok(false);
        }
        if let Err(e) = self.backend.delete(id) {
            error!("Failed to delete stored message {id}: {e}");
            return Err(e);
        }
        Ok(true)
    }

    /// Delete every message stored under `topic`.
    pub fn clear_topic(&mut self, topic: &str, now: i64) -> Result<usize> {
        let ids = self.index.clear(topic, now);
        for id in &ids {
            self.messages.remove(id);
            self.in_flight.remove(id);
            self.backend.delete(id)?;
        }
        info!("Cleared {} messages from {topic}", ids.len());
        Ok(ids.len())
    }

    // ----- sessions --------------------------------------------------------

    /// Complete a `hello` handshake. On failure the error-bearing `welcome`
    /// has already been sent and the reason is returned.
    pub fn open_session(
        &mut self,
        hello: Hello,
        sender: UnboundedSender<Outbound>,
        now: i64,
    ) -> std::result::Result<u64, String> {
        let auth = match self.auth.resolve(hello.auth_token.as_deref()) {
            AuthOutcome::Authorized(record) => Some(record),
            AuthOutcome::Anonymous => None,
            AuthOutcome::Denied(reason) => {
                warn!("Handshake from {} refused: {reason}", hello.client_id);
                let _ = sender.send(Outbound::Frame(ServerFrame::Welcome {
                    version: PROTOCOL_VERSION.to_string(),
                    heartbeat_sec: 0,
                    error_message: Some(reason.to_string()),
                }));
                return Err(reason.to_string());
            }
        };

        let unique_id = self.registry.next_unique_id();
        let max_workers = self.settings.clamp_workers(hello.max_workers);
        let mut session = Session::new(
            unique_id,
            &hello.client_id,
            &hello.version,
            max_workers,
            auth,
            sender,
            now,
        );
        session.send(
            ServerFrame::Welcome {
                version: PROTOCOL_VERSION.to_string(),
                heartbeat_sec: self.settings.heartbeat_sec,
                error_message: None,
            },
            now,
        );
        self.registry.add(session);
        self.process_registry_events();
        Ok(unique_id)
    }

    pub fn subscribe<S: AsRef<str>>(&mut self, unique_id: u64, topics: &[S]) -> Option<usize> {
        let kept = self.registry.subscribe(unique_id, topics);
        self.process_registry_events();
        kept
    }

    pub fn touch(&mut self, unique_id: u64, now: i64) {
        if let Some(session) = self.registry.get_mut(unique_id) {
            session.touch(now);
        }
    }

    /// Remove a session and close its socket. Its in-flight messages become
    /// deliverable again on a later pass.
    pub fn disconnect(&mut self, unique_id: u64) -> bool {
        let Some(session) = self.registry.remove(unique_id) else {
            return false;
        };
        session.close();
        self.process_registry_events();
        true
    }

    /// Heartbeat bookkeeping for every session. Sessions that stayed silent
    /// for a full interval are disconnected; their ids are returned.
    pub fn heartbeat_tick(&mut self, now: i64) -> Vec<u64> {
        if self.settings.heartbeat_sec == 0 {
            return Vec::new();
        }
        let interval_ms = (self.settings.heartbeat_sec * 1000) as i64;
        let expired = self.registry.tick(now, interval_ms);
        for unique_id in &expired {
            warn!("No heartbeat from session {unique_id}, closing");
            self.disconnect(*unique_id);
        }
        expired
    }

    fn process_registry_events(&mut self) {
        for event in self.registry.drain_events() {
            match event {
                RegistryEvent::Added {
                    unique_id,
                    client_id,
                } => {
                    let group = self.registry.group(&client_id).len();
                    info!("{client_id} connected as session {unique_id} ({group} in group)");
                }
                RegistryEvent::Removed {
                    unique_id,
                    client_id,
                } => {
                    let before = self.in_flight.len();
                    self.in_flight.retain(|_, owner| *owner != unique_id);
                    info!(
                        "{client_id} session {unique_id} removed, released {} in-flight messages",
                        before - self.in_flight.len()
                    );
                }
                RegistryEvent::SubscriptionsChanged { unique_id, count } => {
                    debug!("Session {unique_id} now has {count} subscriptions");
                }
            }
        }
    }

    // ----- delivery --------------------------------------------------------

    /// One delivery pass: for every active topic, in random order, hand the
    /// first schedulable message to the first matching session with spare
    /// capacity. Returns the number of deliveries made.
    pub fn run_pass(&mut self, now: i64) -> usize {
        self.index.flush_due_sorts(now);

        let sessions = self.registry.shuffled_ids();
        if sessions.is_empty() {
            return 0;
        }
        let mut topics = self.index.active_topics();
        topics.shuffle(&mut rand::rng());

        let mut delivered = 0;
        for topic in &topics {
            let Some(unique_id) = sessions.iter().copied().find(|id| {
                self.registry
                    .get(*id)
                    .is_some_and(|s| s.has_enough_worker() && s.matches(topic))
            }) else {
                continue;
            };
            let Some(message) = self
                .index
                .deliverable(topic, now)
                .find(|m| !self.in_flight.contains_key(m.id()))
                .cloned()
            else {
                continue;
            };

            self.in_flight.insert(message.id().to_string(), unique_id);
            if let Some(session) = self.registry.get_mut(unique_id) {
                if !session.deliver(&message, now) {
                    debug!("Session {unique_id} is gone, {} stays claimed until cleanup", message.id());
                }
            }
            delivered += 1;
        }
        delivered
    }

    /// The acknowledgment callback bound to every delivery. Returns `true`
    /// when the ack completed the delivery and freed the worker slot.
    pub fn handle_delivery_ack(&mut self, unique_id: u64, ack: &DeliveryAck, now: i64) -> bool {
        let Some(pending) = self
            .registry
            .get(unique_id)
            .and_then(|s| s.pending(&ack.message_id))
            .cloned()
        else {
            debug!("Ignoring ack for {} from session {unique_id}", ack.message_id);
            return false;
        };

        let completed = self.resolve_ack(unique_id, &pending, ack, now);
        if completed {
            if let Some(session) = self.registry.get_mut(unique_id) {
                session.release(&ack.message_id);
            }
        }
        completed
    }

    fn resolve_ack(&mut self, unique_id: u64, pending: &PendingDelivery, ack: &DeliveryAck, now: i64) -> bool {
        if pending.qos == Qos::Feedback {
            if let Some(origin) = pending
                .source_unique_id
                .and_then(|origin| self.registry.get_mut(origin))
            {
                origin.send(ServerFrame::report(&pending.topic, ack), now);
            }
        }

        if !ack.is_complete() {
            return false;
        }

        let id = ack.message_id.as_str();
        if self.in_flight.get(id) != Some(&unique_id) {
            // superseded or deleted while in flight
            debug!("Session {unique_id} no longer holds {id}");
            return true;
        }
        self.in_flight.remove(id);

        let retry_delay = ack
            .reject_reason
            .as_ref()
            .and(ack.reject_retry_delay_ms)
            .filter(|delay| *delay >= 0);
        let outcome = match retry_delay {
            Some(delay) => self.resend(id, delay, now),
            None => self.delete_message(id, now).map(|_| ()),
        };
        if let Err(e) = outcome {
            error!("Failed to settle {id} after ack: {e}");
        }
        true
    }

    /// Put a message back in its topic with a fresh publish time and the
    /// given delay. Routing is not applied again.
    fn resend(&mut self, id: &str, delay_ms: i64, now: i64) -> Result<()> {
        let Some(stored) = self.messages.get(id).cloned() else {
            return Ok(());
        };
        let mut next = (*stored).clone();
        next.publish_time = now;
        next.options.delay_ms = delay_ms;
        debug!("Resending {id} on {} in {delay_ms}ms", next.topic);
        self.add_message(next, false, now).map(|_| ())
    }

    // ----- expiry ----------------------------------------------------------

    /// Delete up to `gc_batch` expired messages from one random topic.
    pub fn collect_garbage(&mut self, now: i64) -> GarbageReport {
        let expired = self.index.expired(now);
        let batch = self.settings.gc_batch;
        let capped = expired.len() >= batch;

        let mut deleted = 0;
        for id in expired.into_iter().take(batch) {
            match self.delete_message(&id, now) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to delete expired message {id}: {e}"),
            }
        }
        if deleted > 0 {
            debug!("Garbage collected {deleted} expired messages");
        }
        let pruned = self.index.prune_idle(now);
        if pruned > 0 {
            debug!("Dropped {pruned} idle topics");
        }
        GarbageReport { deleted, capped }
    }

    // ----- observability ---------------------------------------------------

    pub fn topic_summaries(&self, now: i64) -> Vec<TopicSummary> {
        let mut summaries: Vec<TopicSummary> = self
            .index
            .topic_names()
            .filter_map(|topic| {
                self.index.rates(topic, now).map(|rates| TopicSummary {
                    topic: topic.clone(),
                    stored: self.index.len(topic),
                    rates,
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.topic.cmp(&b.topic));
        summaries
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        self.index.len(topic)
    }

    pub fn topic_messages(&self, topic: &str) -> &[Arc<Message>] {
        self.index.messages(topic)
    }

    pub fn message(&self, id: &str) -> Option<&Arc<Message>> {
        self.messages.get(id)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn in_flight_owner(&self, id: &str) -> Option<u64> {
        self.in_flight.get(id).copied()
    }

    pub fn session(&self, unique_id: u64) -> Option<&Session> {
        self.registry.get(unique_id)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("messages", &self.messages.len())
            .field("in_flight", &self.in_flight.len())
            .field("sessions", &self.registry.len())
            .field("rules", &self.routing.rules().len())
            .finish()
    }
}
