use async_trait::async_trait;
use dashmap::DashMap;

use super::store::{KeyValueStore, StoreResult};

/// In-process store used when no Redis URL is configured, and in tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
