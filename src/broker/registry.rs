//! Client registry
//!
//! Tracks the live sessions by their process-unique id. Every mutation that
//! other parts of the engine care about is queued as a `RegistryEvent`; the
//! engine drains the queue after each operation, so there are no observer
//! callbacks and no reentrancy.

use std::collections::{HashMap, VecDeque};

use rand::seq::SliceRandom;

use crate::client::{HeartbeatStatus, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added { unique_id: u64, client_id: String },
    Removed { unique_id: u64, client_id: String },
    SubscriptionsChanged { unique_id: u64, count: usize },
}

#[derive(Debug)]
pub struct ClientRegistry {
    sessions: HashMap<u64, Session>,
    next_id: u64,
    events: VecDeque<RegistryEvent>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            events: VecDeque::new(),
        }
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next session id. Ids are never reused.
    pub fn next_unique_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add(&mut self, session: Session) {
        self.events.push_back(RegistryEvent::Added {
            unique_id: session.unique_id,
            client_id: session.client_id.clone(),
        });
        self.sessions.insert(session.unique_id, session);
    }

    pub fn remove(&mut self, unique_id: u64) -> Option<Session> {
        let session = self.sessions.remove(&unique_id)?;
        self.events.push_back(RegistryEvent::Removed {
            unique_id,
            client_id: session.client_id.clone(),
        });
        Some(session)
    }

    pub fn subscribe<S: AsRef<str>>(&mut self, unique_id: u64, topics: &[S]) -> Option<usize> {
        let session = self.sessions.get_mut(&unique_id)?;
        let count = session.subscribe(topics);
        self.events
            .push_back(RegistryEvent::SubscriptionsChanged { unique_id, count });
        Some(count)
    }

    pub fn get(&self, unique_id: u64) -> Option<&Session> {
        self.sessions.get(&unique_id)
    }

    pub fn get_mut(&mut self, unique_id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&unique_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session ids in random order, for fair target selection.
    pub fn shuffled_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sessions.keys().copied().collect();
        ids.shuffle(&mut rand::rng());
        ids
    }

    /// Sessions sharing a client id.
    pub fn group(&self, client_id: &str) -> Vec<u64> {
        self.sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.unique_id)
            .collect()
    }

    /// Run the heartbeat check on every session and return the ids whose
    /// peer went silent.
    pub fn tick(&mut self, now: i64, interval_ms: i64) -> Vec<u64> {
        self.sessions
            .values_mut()
            .filter_map(|s| match s.heartbeat_tick(now, interval_ms) {
                HeartbeatStatus::Expired => Some(s.unique_id),
                HeartbeatStatus::Alive => None,
            })
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        self.events.drain(..).collect()
    }
}
