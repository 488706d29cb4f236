//! The `auth` module resolves the `authToken` carried by a `hello` frame to
//! an access-control record.
//!
//! Records are loaded from `auth` resources. A session keeps the record it
//! authenticated with; the publish/subscribe allow-lists travel with the
//! session but are not enforced by the broker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRecord {
    pub description: String,
    pub token: String,
    #[serde(default)]
    pub web_access: bool,
    #[serde(default)]
    pub publish_to: Vec<String>,
    #[serde(default)]
    pub subscribe_to: Vec<String>,
}

impl AuthRecord {
    pub fn validate(&self) -> Result<()> {
        if self.description.trim().is_empty() {
            return Err(BrokerError::validation("auth description is required"));
        }
        if self.token.is_empty() {
            return Err(BrokerError::validation(format!(
                "auth record '{}' has an empty token",
                self.description
            )));
        }
        Ok(())
    }
}

/// Outcome of a handshake authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized(AuthRecord),
    Anonymous,
    Denied(&'static str),
}

#[derive(Debug, Default)]
pub struct AuthGate {
    records: HashMap<String, AuthRecord>,
    allow_anonymous: bool,
}

impl AuthGate {
    pub fn new(allow_anonymous: bool) -> Self {
        Self {
            records: HashMap::new(),
            allow_anonymous,
        }
    }

    /// Replace the configured records. Tokens must be unique.
    pub fn set_records(&mut self, records: Vec<AuthRecord>) -> Result<()> {
        let mut by_token = HashMap::with_capacity(records.len());
        for record in records {
            record.validate()?;
            if by_token.contains_key(&record.token) {
                return Err(BrokerError::validation(format!(
                    "duplicate auth token in record '{}'",
                    record.description
                )));
            }
            by_token.insert(record.token.clone(), record);
        }
        self.records = by_token;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn resolve(&self, token: Option<&str>) -> AuthOutcome {
        match token.filter(|t| !t.is_empty()) {
            Some(token) => match self.records.get(token) {
                Some(record) => AuthOutcome::Authorized(record.clone()),
                None => AuthOutcome::Denied("invalid auth token"),
            },
            None if self.allow_anonymous => AuthOutcome::Anonymous,
            None => AuthOutcome::Denied("authentication required"),
        }
    }
}
