use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::interfaces::storage::DeliveryStore;

#[derive(Default)]
pub struct MemoryDeliveryStore {
    store: RwLock<HashMap<String, Vec<(String, String)>>>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self, owner: &str) -> usize {
        let guard = self.store.read().await;
        guard.get(owner).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn save(&self, owner: &str, id: &str, encoded: &str) -> Result<()> {
        let mut guard = self.store.write().await;
        let entries = guard.entry(owner.to_string()).or_default();
        match entries.iter_mut().find(|(existing, _)| existing == id) {
            Some(entry) => entry.1 = encoded.to_string(),
            None => entries.push((id.to_string(), encoded.to_string())),
        }
        Ok(())
    }

    async fn remove(&self, owner: &str, id: &str) -> Result<()> {
        let mut guard = self.store.write().await;
        if let Some(entries) = guard.get_mut(owner) {
            entries.retain(|(existing, _)| existing != id);
        }
        Ok(())
    }

    async fn list(&self, owner: &str) -> Result<Vec<(String, String)>> {
        let guard = self.store.read().await;
        Ok(guard.get(owner).cloned().unwrap_or_default())
    }
}
