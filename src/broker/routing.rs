//! Topic routing
//!
//! Router rules copy or move messages published to one topic onto other
//! topics. `RoutingEngine::expand` applies the rules repeatedly until no new
//! destination appears. Rule topics match case-insensitively.
//!
//! The original topic survives expansion unless the only rules that fired
//! were move rules: a single matching copy rule anywhere in the expansion
//! suppresses every removal.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::broker::pattern::is_valid_topic;
use crate::utils::{BrokerError, Result};

pub const DEFAULT_MAX_PASSES: usize = 32;
pub const DEFAULT_MAX_TOPICS: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterRule {
    pub description: String,
    pub topic: String,
    #[serde(default)]
    pub copy_to: Vec<String>,
    #[serde(default)]
    pub move_to: Vec<String>,
}

impl RouterRule {
    pub fn validate(&self) -> Result<()> {
        if self.description.trim().is_empty() {
            return Err(BrokerError::validation("rule description is required"));
        }
        if self.topic.is_empty() {
            return Err(BrokerError::validation("rule topic is required"));
        }
        if !is_valid_topic(&self.topic) {
            return Err(BrokerError::validation(format!(
                "invalid rule topic '{}'",
                self.topic
            )));
        }
        if self.copy_to.is_empty() && self.move_to.is_empty() {
            return Err(BrokerError::validation(format!(
                "rule '{}' needs at least one copyTo or moveTo target",
                self.description
            )));
        }
        if let Some(bad) = self
            .copy_to
            .iter()
            .chain(self.move_to.iter())
            .find(|t| !is_valid_topic(t))
        {
            return Err(BrokerError::validation(format!(
                "invalid target topic '{bad}' in rule '{}'",
                self.description
            )));
        }
        Ok(())
    }
}

/// Result of expanding one publish topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// Final destinations, in discovery order.
    pub destinations: Vec<String>,
    pub keep_original: bool,
    /// No rule matched anything.
    pub noop: bool,
}

#[derive(Debug)]
pub struct RoutingEngine {
    rules: Vec<RouterRule>,
    by_topic: HashMap<String, Vec<usize>>,
    max_passes: usize,
    max_topics: usize,
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PASSES, DEFAULT_MAX_TOPICS)
    }
}

impl RoutingEngine {
    pub fn new(max_passes: usize, max_topics: usize) -> Self {
        Self {
            rules: Vec::new(),
            by_topic: HashMap::new(),
            max_passes,
            max_topics,
        }
    }

    /// Replace the rule set. Nothing changes if any rule is invalid or two
    /// rules share a description.
    pub fn set_rules(&mut self, rules: Vec<RouterRule>) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.description.to_lowercase()) {
                return Err(BrokerError::validation(format!(
                    "duplicate rule description '{}'",
                    rule.description
                )));
            }
        }

        let mut by_topic: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            by_topic.entry(rule.topic.to_lowercase()).or_default().push(idx);
        }
        self.rules = rules;
        self.by_topic = by_topic;
        Ok(())
    }

    /// Insert or replace (by description) a single rule.
    pub fn upsert_rule(&mut self, rule: RouterRule) -> Result<()> {
        let mut rules = self.rules.clone();
        match rules
            .iter_mut()
            .find(|r| r.description.eq_ignore_ascii_case(&rule.description))
        {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        self.set_rules(rules)
    }

    pub fn remove_rule(&mut self, description: &str) -> bool {
        let before = self.rules.len();
        let rules: Vec<RouterRule> = self
            .rules
            .iter()
            .filter(|r| !r.description.eq_ignore_ascii_case(description))
            .cloned()
            .collect();
        if rules.len() == before {
            return false;
        }
        // the remaining rules were already valid
        let _ = self.set_rules(rules);
        true
    }

    pub fn rules(&self) -> &[RouterRule] {
        &self.rules
    }

    pub fn expand(&self, topic: &str) -> Result<Expansion> {
        let mut destinations = vec![topic.to_string()];
        let mut known: HashSet<String> = HashSet::from([topic.to_string()]);
        let mut applied: HashSet<usize> = HashSet::new();
        let mut moved_from: Vec<String> = Vec::new();
        let mut any_copy = false;
        let mut any_move = false;

        let mut passes = 0;
        loop {
            passes += 1;
            if passes > self.max_passes {
                return Err(BrokerError::Routing(format!(
                    "expansion of '{topic}' did not settle after {} passes",
                    self.max_passes
                )));
            }

            let mut added = Vec::new();
            for current in &destinations {
                let Some(indices) = self.by_topic.get(&current.to_lowercase()) else {
                    continue;
                };
                for idx in indices {
                    let rule = &self.rules[*idx];
                    if applied.insert(*idx) {
                        if !rule.copy_to.is_empty() {
                            any_copy = true;
                        }
                        if !rule.move_to.is_empty() {
                            any_move = true;
                            moved_from.push(current.clone());
                        }
                    }
                    for target in rule.copy_to.iter().chain(rule.move_to.iter()) {
                        if known.insert(target.clone()) {
                            added.push(target.clone());
                        }
                    }
                }
            }

            if added.is_empty() {
                break;
            }
            destinations.extend(added);
            if destinations.len() > self.max_topics {
                return Err(BrokerError::Routing(format!(
                    "expansion of '{topic}' exceeded {} topics",
                    self.max_topics
                )));
            }
        }

        if applied.is_empty() {
            return Ok(Expansion {
                destinations,
                keep_original: true,
                noop: true,
            });
        }

        let remove_sources = any_move && !any_copy;
        if remove_sources {
            destinations.retain(|d| !moved_from.contains(d));
            if destinations.is_empty() {
                return Err(BrokerError::Routing(format!(
                    "move rules for '{topic}' form a cycle with no destination"
                )));
            }
        }
        let keep_original = destinations.iter().any(|d| d == topic);

        Ok(Expansion {
            destinations,
            keep_original,
            noop: false,
        })
    }
}
