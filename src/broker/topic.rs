//! Topic index
//!
//! A `TopicIndex` keeps, per topic, the list of stored messages ordered by
//! `(priority asc, publish_time asc)`. The order is maintained lazily:
//! inserts append, and the list is re-sorted when enough inserts have piled
//! up, when the last sort is old enough, or when the debounce deadline armed
//! by the last insert has passed (`flush_due_sorts`, driven by the delivery
//! loop). Readers must tolerate a slightly stale order.
//!
//! The index never owns messages on its own: it holds `Arc` clones of the
//! records owned by the engine.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::IndexedRandom;

use crate::broker::message::Message;

/// Inserts since the last sort that force an immediate sort.
pub const SORT_COUNT_THRESHOLD: usize = 2049;
/// Time since the last sort (ms) that forces an immediate sort.
pub const SORT_ELAPSED_MS: i64 = 1049;
/// Debounce delay (ms) for a deferred sort.
pub const SORT_DEBOUNCE_MS: i64 = 249;

const MINUTE_MS: i64 = 60_000;
const WINDOW_MINUTES: usize = 15;

/// Event counter over rolling 1, 5 and 15 minute windows, bucketed per minute.
#[derive(Debug, Clone, Default)]
pub struct RollingCounter {
    buckets: [u64; WINDOW_MINUTES],
    minute: i64,
}

impl RollingCounter {
    pub fn record(&mut self, now: i64) {
        self.advance(now);
        self.buckets[Self::slot(self.minute)] += 1;
    }

    /// Counts over the last 1, 5 and 15 minutes.
    pub fn rates(&self, now: i64) -> [u64; 3] {
        let current = now.div_euclid(MINUTE_MS);
        let window = |minutes: i64| -> u64 {
            (0..minutes)
                .map(|back| current - back)
                .filter(|m| *m <= self.minute && self.minute - *m < WINDOW_MINUTES as i64)
                .map(|m| self.buckets[Self::slot(m)])
                .sum()
        };
        [window(1), window(5), window(15)]
    }

    /// Nothing was recorded over the last 15 minutes.
    pub fn is_idle(&self, now: i64) -> bool {
        self.rates(now)[2] == 0
    }

    fn advance(&mut self, now: i64) {
        let current = now.div_euclid(MINUTE_MS);
        if current <= self.minute {
            return;
        }
        let gap = (current - self.minute).min(WINDOW_MINUTES as i64);
        for step in 1..=gap {
            self.buckets[Self::slot(self.minute + step)] = 0;
        }
        self.minute = current;
    }

    #[inline]
    fn slot(minute: i64) -> usize {
        minute.rem_euclid(WINDOW_MINUTES as i64) as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub added: RollingCounter,
    pub removed: RollingCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicRates {
    pub added: [u64; 3],
    pub removed: [u64; 3],
}

#[derive(Debug, Default)]
struct TopicEntry {
    items: Vec<Arc<Message>>,
    new_items: usize,
    last_sort: i64,
    sort_due: Option<i64>,
    stats: TopicStats,
}

impl TopicEntry {
    fn sort(&mut self, now: i64) {
        self.items.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then(a.publish_time.cmp(&b.publish_time))
        });
        self.new_items = 0;
        self.last_sort = now;
        self.sort_due = None;
    }
}

#[derive(Debug, Default)]
pub struct TopicIndex {
    topics: HashMap<String, TopicEntry>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to its topic and sort now or arm the debounce.
    pub fn add(&mut self, message: Arc<Message>, now: i64) {
        let entry = self.topics.entry(message.topic.clone()).or_default();
        entry.items.push(message);
        entry.stats.added.record(now);
        entry.new_items += 1;

        if entry.new_items >= SORT_COUNT_THRESHOLD || now - entry.last_sort >= SORT_ELAPSED_MS {
            entry.sort(now);
        } else {
            entry.sort_due = Some(now + SORT_DEBOUNCE_MS);
        }
    }

    /// Append without touching counters or timers. Callers must `sort_all`
    /// once the bulk load is done.
    pub fn add_bulk(&mut self, message: Arc<Message>) {
        let entry = self.topics.entry(message.topic.clone()).or_default();
        entry.items.push(message);
    }

    pub fn sort_all(&mut self, now: i64) {
        for entry in self.topics.values_mut() {
            entry.sort(now);
        }
    }

    /// Run every deferred sort whose debounce deadline has passed.
    pub fn flush_due_sorts(&mut self, now: i64) -> usize {
        let mut sorted = 0;
        for entry in self.topics.values_mut() {
            if entry.sort_due.is_some_and(|due| due <= now) {
                entry.sort(now);
                sorted += 1;
            }
        }
        sorted
    }

    pub fn remove(&mut self, topic: &str, message_id: &str, now: i64) -> Option<Arc<Message>> {
        let entry = self.topics.get_mut(topic)?;
        let pos = entry.items.iter().position(|m| m.id() == message_id)?;
        let removed = entry.items.remove(pos);
        entry.stats.removed.record(now);
        Some(removed)
    }

    /// Drop every message of a topic, returning their ids.
    pub fn clear(&mut self, topic: &str, now: i64) -> Vec<String> {
        let Some(entry) = self.topics.get_mut(topic) else {
            return Vec::new();
        };
        let ids: Vec<String> = entry.items.drain(..).map(|m| m.id().to_string()).collect();
        for _ in &ids {
            entry.stats.removed.record(now);
        }
        entry.new_items = 0;
        entry.sort_due = None;
        ids
    }

    /// Sample one random non-empty topic and return the ids of its expired
    /// messages.
    pub fn expired(&self, now: i64) -> Vec<String> {
        let candidates: Vec<&TopicEntry> =
            self.topics.values().filter(|e| !e.items.is_empty()).collect();
        let Some(entry) = candidates.choose(&mut rand::rng()) else {
            return Vec::new();
        };
        entry
            .items
            .iter()
            .filter(|m| m.is_expired(now))
            .map(|m| m.id().to_string())
            .collect()
    }

    /// Messages of `topic` that may be delivered at `now`, in current order.
    /// Every call starts from the head of the list.
    pub fn deliverable<'a>(
        &'a self,
        topic: &str,
        now: i64,
    ) -> impl Iterator<Item = &'a Arc<Message>> + 'a {
        self.topics
            .get(topic)
            .into_iter()
            .flat_map(|entry| entry.items.iter())
            .filter(move |m| !m.is_delayed(now) && !m.is_expired(now))
    }

    /// Forget empty topics whose rate windows have gone quiet. Returns how
    /// many were dropped.
    pub fn prune_idle(&mut self, now: i64) -> usize {
        let before = self.topics.len();
        self.topics.retain(|_, e| {
            !e.items.is_empty() || !e.stats.added.is_idle(now) || !e.stats.removed.is_idle(now)
        });
        before - self.topics.len()
    }

    /// Names of topics that currently hold at least one message.
    pub fn active_topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|(_, e)| !e.items.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn messages(&self, topic: &str) -> &[Arc<Message>] {
        self.topics
            .get(topic)
            .map(|e| e.items.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |e| e.items.len())
    }

    pub fn total(&self) -> usize {
        self.topics.values().map(|e| e.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn is_sort_pending(&self, topic: &str) -> bool {
        self.topics.get(topic).is_some_and(|e| e.sort_due.is_some())
    }

    pub fn rates(&self, topic: &str, now: i64) -> Option<TopicRates> {
        self.topics.get(topic).map(|e| TopicRates {
            added: e.stats.added.rates(now),
            removed: e.stats.removed.rates(now),
        })
    }

    pub fn topic_names(&self) -> impl Iterator<Item = &String> {
        self.topics.keys()
    }
}
