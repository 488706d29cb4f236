//! The `error` module defines the error type shared by the broker.
//!
//! `Validation` errors are business-rule failures: they are reported back to
//! the client (for example as `publishAck.errorMessage`) and never tear down
//! a connection. Storage errors are fatal to the single operation that
//! raised them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0}")]
    Validation(String),
    #[error("routing error, {0}")]
    Routing(String),
    #[error("storage error, {0}")]
    Storage(#[from] sled::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("resource document error, {0}")]
    Document(String),
}

impl BrokerError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        BrokerError::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, BrokerError::Validation(_))
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
