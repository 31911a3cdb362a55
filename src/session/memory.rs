use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::error::Result;

use super::{InjectionRecord, SessionStore, StorageRecord};

/// In-memory store for tests and dry runs. Same upsert semantics as the
/// SQLite store, nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    injections: DashMap<(String, String), InjectionRecord>,
    storage: DashMap<String, StorageRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn injections_for_endpoint(&self, endpoint: &str) -> Result<Vec<InjectionRecord>> {
        Ok(self
            .injections
            .iter()
            .filter(|entry| entry.key().0 == endpoint)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn upsert_injection(&self, record: &InjectionRecord) -> Result<()> {
        self.injections
            .insert((record.endpoint.clone(), record.parameter.clone()), record.clone());
        Ok(())
    }

    async fn storage_get(&self, key: &str) -> Result<Option<StorageRecord>> {
        Ok(self.storage.get(key).map(|entry| entry.value().clone()))
    }

    async fn storage_upsert(&self, record: &StorageRecord) -> Result<()> {
        self.storage.insert(record.key.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_upsert_replaces() {
        let store = MemoryStore::new();
        store
            .storage_upsert(&StorageRecord { key: "current_db".into(), value: "tes".into(), length: 6 })
            .await
            .unwrap();
        store
            .storage_upsert(&StorageRecord { key: "current_db".into(), value: "test".into(), length: 6 })
            .await
            .unwrap();
        let rec = store.storage_get("current_db").await.unwrap().unwrap();
        assert_eq!(rec.value, "test");
        assert_eq!(store.storage_len(), 1);
    }
}
