//! Persistence layer backed by `sled`
//!
//! Messages live in a single `messages` tree keyed by message id, so an
//! upsert for a re-published id overwrites the previous record. Resources
//! live in one tree per kind (`resource:<kind>`), keyed by resource id.
//! Values are JSON.

use sled::{Db, Tree};
use tracing::warn;

use crate::broker::message::Message;
use crate::persistence::{LoadProgress, ResourceStore, Storage, report_percent};
use crate::utils::Result;

const MESSAGES_TREE: &str = "messages";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
    messages: Tree,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let messages = db.open_tree(MESSAGES_TREE)?;
        Ok(Self { db, messages })
    }

    fn resource_tree(&self, kind: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("resource:{kind}"))?)
    }
}

impl Storage for SledStore {
    fn load_all(&mut self, progress: &mut dyn FnMut(LoadProgress)) -> Result<Vec<Message>> {
        let total = self.messages.len();
        progress(LoadProgress::Total(total));

        let mut loaded = Vec::with_capacity(total);
        let mut bytes = 0u64;
        let mut last = 0u8;
        for (count, entry) in self.messages.iter().enumerate() {
            let (key, value) = entry?;
            bytes += value.len() as u64;
            match serde_json::from_slice::<Message>(&value) {
                Ok(message) => loaded.push(message),
                Err(e) => warn!(
                    "Skipping unreadable message record '{}': {e}",
                    String::from_utf8_lossy(&key)
                ),
            }
            report_percent(progress, count + 1, total, bytes, &mut last);
        }
        Ok(loaded)
    }

    fn upsert(&mut self, id: &str, message: &Message) -> Result<()> {
        let serialized = serde_json::to_vec(message)?;
        self.messages.insert(id.as_bytes(), serialized)?;
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.messages.remove(id.as_bytes())?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl ResourceStore for SledStore {
    fn list_resources(&self, kind: &str) -> Result<Vec<(String, String)>> {
        let tree = self.resource_tree(kind)?;
        let mut resources = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            resources.push((
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        Ok(resources)
    }

    fn upsert_resource(&mut self, kind: &str, id: &str, json: &str) -> Result<()> {
        self.resource_tree(kind)?
            .insert(id.as_bytes(), json.as_bytes())?;
        Ok(())
    }

    fn delete_resource(&mut self, kind: &str, id: &str) -> Result<()> {
        self.resource_tree(kind)?.remove(id.as_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .field("messages", &self.messages.len())
            .finish()
    }
}
