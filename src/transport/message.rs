//! Wire frames
//!
//! Every frame is a JSON object with exactly one key naming its kind, for
//! example `{"publish": {"topic": "a.b", "message": {...}, "options": {...}}}`.
//! serde's default (external) enum tagging produces exactly this envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::message::MessageOptions;

/// Frame kinds a client may send. Anything else is ignored.
pub const CLIENT_FRAME_KINDS: [&str; 5] =
    ["hello", "heartbeat", "subscribe", "publish", "deliveryAck"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub client_id: String,
    pub version: String,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_retry_delay_ms: Option<i64>,
}

impl DeliveryAck {
    /// Final acknowledgment: fully processed, resolved or rejected.
    pub fn is_complete(&self) -> bool {
        self.percent == Some(100) || self.resolve_reason.is_some() || self.reject_reason.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Hello(Hello),
    Heartbeat {},
    Subscribe {
        topics: Vec<String>,
    },
    Publish {
        topic: String,
        #[serde(default)]
        message: Value,
        #[serde(default)]
        options: MessageOptions,
    },
    DeliveryAck(DeliveryAck),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome {
        version: String,
        heartbeat_sec: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Heartbeat {},
    Delivery {
        topic: String,
        message: Value,
        options: MessageOptions,
        source: String,
    },
    #[serde(rename = "deliveryreport")]
    DeliveryReport {
        message_id: String,
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolve_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reject_reason: Option<String>,
    },
    PublishAck {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

impl ServerFrame {
    pub fn report(topic: &str, ack: &DeliveryAck) -> Self {
        ServerFrame::DeliveryReport {
            message_id: ack.message_id.clone(),
            topic: topic.to_string(),
            percent: ack.percent,
            resolve_reason: ack.resolve_reason.clone(),
            reject_reason: ack.reject_reason.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Welcome { .. } => "welcome",
            ServerFrame::Heartbeat {} => "heartbeat",
            ServerFrame::Delivery { .. } => "delivery",
            ServerFrame::DeliveryReport { .. } => "deliveryreport",
            ServerFrame::PublishAck { .. } => "publishAck",
        }
    }
}

/// What a connection's writer task is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close,
}
