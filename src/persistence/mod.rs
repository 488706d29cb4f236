//! The `persistence` module defines the storage contract used by the broker
//! and its implementations.
//!
//! The engine only ever calls storage from its single serialized context,
//! so implementations need sequential safety, not concurrency safety.
//!
//! - `Storage`: durable message records (load-all, upsert, delete, close)
//! - `ResourceStore`: JSON resources such as router rules and auth records
//! - `sled_store`: `sled`-backed implementation of both
//! - `memory`: in-process implementation for tests and ephemeral brokers
//! - `documents`: `{kind, api, meta, spec}` resource documents in YAML

pub mod documents;
pub mod memory;
pub mod sled_store;

use crate::broker::message::Message;
use crate::config::StorageSettings;
use crate::utils::{BrokerError, Result};

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// Progress notifications emitted while loading stored messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProgress {
    Total(usize),
    Percent {
        count: usize,
        percent: u8,
        bytes: u64,
    },
}

pub trait Storage: Send {
    fn load_all(&mut self, progress: &mut dyn FnMut(LoadProgress)) -> Result<Vec<Message>>;
    fn upsert(&mut self, id: &str, message: &Message) -> Result<()>;
    fn delete(&mut self, id: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

pub trait ResourceStore: Send {
    /// `(id, json)` pairs of every resource of `kind`.
    fn list_resources(&self, kind: &str) -> Result<Vec<(String, String)>>;
    fn upsert_resource(&mut self, kind: &str, id: &str, json: &str) -> Result<()>;
    fn delete_resource(&mut self, kind: &str, id: &str) -> Result<()>;
}

/// Both halves of the persistence backend, as owned by the broker.
pub trait Backend: Storage + ResourceStore {}

impl<T: Storage + ResourceStore> Backend for T {}

/// Open the backend selected by `storage.backend`.
pub fn open_backend(settings: &StorageSettings) -> Result<Box<dyn Backend>> {
    match settings.backend.as_str() {
        "sled" => Ok(Box::new(SledStore::open(&settings.path)?)),
        "memory" => Ok(Box::new(MemoryStore::new())),
        other => Err(BrokerError::validation(format!(
            "unknown storage backend '{other}'"
        ))),
    }
}

/// Emit `Percent` at every whole percent step while walking `total` records.
pub(crate) fn report_percent(
    progress: &mut dyn FnMut(LoadProgress),
    count: usize,
    total: usize,
    bytes: u64,
    last: &mut u8,
) {
    if total == 0 {
        return;
    }
    let percent = ((count * 100) / total) as u8;
    if percent > *last || count == total {
        *last = percent;
        progress(LoadProgress::Percent {
            count,
            percent,
            bytes,
        });
    }
}
