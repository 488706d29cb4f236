//! Subscription patterns
//!
//! A subscription string is compiled once, at subscribe time, into either an
//! exact (case-insensitive) topic or a wildcard pattern:
//! - `#` matches exactly one non-empty segment (no dots)
//! - `*` matches any span, possibly empty, inside a single segment
//!
//! Segments are separated by `.`.

use std::sync::LazyLock;

use regex::Regex;

pub const MAX_TOPIC_LEN: usize = 255;

static TOPIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid topic regex"));

static MASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.#*\-]+$").expect("valid mask regex"));

/// Topic names accepted for rules and routing targets.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && topic.len() <= MAX_TOPIC_LEN && TOPIC_RE.is_match(topic)
}

/// Subscription strings accepted by `subscribe`; anything else is dropped.
pub fn is_valid_mask(mask: &str) -> bool {
    !mask.is_empty() && mask.len() <= MAX_TOPIC_LEN && MASK_RE.is_match(mask)
}

#[derive(Debug, Clone)]
pub enum Subscription {
    /// Lower-cased topic name.
    Exact(String),
    Pattern { source: String, re: Regex },
}

impl Subscription {
    /// Compile a subscription. Returns `None` when the string fails the mask.
    pub fn compile(mask: &str) -> Option<Self> {
        if !is_valid_mask(mask) {
            return None;
        }
        if !mask.contains(['#', '*']) {
            return Some(Subscription::Exact(mask.to_lowercase()));
        }

        let mut expr = String::with_capacity(mask.len() * 2 + 8);
        expr.push_str("(?i)^");
        for c in mask.chars() {
            match c {
                '#' => expr.push_str("[^.]+"),
                '*' => expr.push_str("[^.]*"),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');

        Regex::new(&expr).ok().map(|re| Subscription::Pattern {
            source: mask.to_string(),
            re,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Subscription::Exact(name) => name.eq_ignore_ascii_case(topic),
            Subscription::Pattern { re, .. } => re.is_match(topic),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Subscription::Exact(name) => name,
            Subscription::Pattern { source, .. } => source,
        }
    }
}
