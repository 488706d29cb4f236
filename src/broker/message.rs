//! Message definitions for the broker
//!
//! `Message` is the canonical stored representation of a published item.
//! The engine owns every `Message` behind an `Arc`; the topic index and the
//! in-flight bookkeeping only hold shared references or ids.
//!
//! Notes on fields:
//! - `topic`: destination topic; router copies carry their own topic
//! - `payload`: opaque JSON value, never inspected by the broker
//! - `options.message_id`: unique among stored messages; the broker generates
//!   one if the client does not provide it
//! - `publish_time`: milliseconds since UNIX epoch, refreshed on resend
//! - `source_unique_id`: session that published the message; only meaningful
//!   for the lifetime of this process, so it is never persisted

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::pattern::is_valid_topic;
use crate::utils::{BrokerError, Result};

pub const MAX_MESSAGE_ID_LEN: usize = 128;

static MESSAGE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid message id regex"));

/// Delivery mode of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qos {
    #[default]
    Normal,
    /// Acknowledgment progress is relayed back to the publisher.
    Feedback,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageOptions {
    pub message_id: String,
    pub priority: i32,
    pub qos: Qos,
    pub delay_ms: i64,
    pub expiration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub topic: String,
    pub payload: Value,
    pub options: MessageOptions,
    pub publish_time: i64,
    #[serde(default)]
    pub source_client_id: String,
    #[serde(skip)]
    pub source_unique_id: Option<u64>,
}

impl Message {
    pub fn new(topic: &str, payload: Value, options: MessageOptions, publish_time: i64) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            options,
            publish_time,
            source_client_id: String::new(),
            source_unique_id: None,
        }
    }

    pub fn with_source(mut self, client_id: &str, unique_id: u64) -> Self {
        self.source_client_id = client_id.to_string();
        self.source_unique_id = Some(unique_id);
        self
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.options.message_id
    }

    #[inline]
    pub fn priority(&self) -> i32 {
        self.options.priority
    }

    #[inline]
    pub fn is_delayed(&self, now: i64) -> bool {
        now < self.publish_time.saturating_add(self.options.delay_ms)
    }

    /// `expiration_ms == 0` never expires.
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.options.expiration_ms > 0
            && now >= self.publish_time.saturating_add(self.options.expiration_ms)
    }

    /// Checks the business rules a message must satisfy before it is stored.
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(BrokerError::validation("topic is required"));
        }
        if !is_valid_topic(&self.topic) {
            return Err(BrokerError::validation(format!("invalid topic '{}'", self.topic)));
        }
        if !is_valid_message_id(&self.options.message_id) {
            return Err(BrokerError::validation(format!(
                "invalid message id '{}'",
                self.options.message_id
            )));
        }
        if self.options.delay_ms < 0 {
            return Err(BrokerError::validation("delayMs must not be negative"));
        }
        if self.options.expiration_ms < 0 {
            return Err(BrokerError::validation("expirationMs must not be negative"));
        }
        Ok(())
    }
}

/// Generate a message id: 32 lowercase hex characters.
pub fn generate_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Id of the `n`th router copy of `id`. The base is shortened so the
/// suffixed id still fits `MAX_MESSAGE_ID_LEN`.
pub fn copy_message_id(id: &str, n: usize) -> String {
    let suffix = format!("-{n}");
    let keep = id.len().min(MAX_MESSAGE_ID_LEN - suffix.len());
    format!("{}{suffix}", &id[..keep])
}

pub fn is_valid_message_id(id: &str) -> bool {
    MESSAGE_ID_RE.is_match(id)
}
