use std::collections::{BTreeMap, HashMap};

use crate::broker::message::Message;
use crate::persistence::{LoadProgress, ResourceStore, Storage, report_percent};
use crate::utils::Result;

/// Storage kept in process memory. Nothing survives a restart.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    messages: BTreeMap<String, Message>,
    resources: HashMap<String, BTreeMap<String, String>>,
    closed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Storage for MemoryStore {
    fn load_all(&mut self, progress: &mut dyn FnMut(LoadProgress)) -> Result<Vec<Message>> {
        let total = self.messages.len();
        progress(LoadProgress::Total(total));
        let mut bytes = 0u64;
        let mut last = 0u8;
        let mut loaded = Vec::with_capacity(total);
        for (count, message) in self.messages.values().enumerate() {
            bytes += serde_json::to_vec(message)?.len() as u64;
            loaded.push(message.clone());
            report_percent(progress, count + 1, total, bytes, &mut last);
        }
        Ok(loaded)
    }

    fn upsert(&mut self, id: &str, message: &Message) -> Result<()> {
        self.messages.insert(id.to_string(), message.clone());
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.messages.remove(id);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl ResourceStore for MemoryStore {
    fn list_resources(&self, kind: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .resources
            .get(kind)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn upsert_resource(&mut self, kind: &str, id: &str, json: &str) -> Result<()> {
        self.resources
            .entry(kind.to_string())
            .or_default()
            .insert(id.to_string(), json.to_string());
        Ok(())
    }

    fn delete_resource(&mut self, kind: &str, id: &str) -> Result<()> {
        if let Some(m) = self.resources.get_mut(kind) {
            m.remove(id);
        }
        Ok(())
    }
}
