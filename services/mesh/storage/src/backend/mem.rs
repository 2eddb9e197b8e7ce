//! In-memory storage backend for development and testing

use crate::{validate_key, KeyValueStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-memory key-value store
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Bytes>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        validate_key(key)?;
        debug!("mem put key={} len={}", key, value.len());
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.put("a/1", Bytes::from_static(b"one")).await.unwrap();
        store.put("a/2", Bytes::from_static(b"two")).await.unwrap();
        store.put("b/1", Bytes::from_static(b"three")).await.unwrap();
        assert_eq!(store.len(), 3);

        assert_eq!(store.get("a/2").await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(store.keys("a/").await.unwrap(), vec!["a/1", "a/2"]);

        store.put("a/1", Bytes::from_static(b"uno")).await.unwrap();
        assert_eq!(store.get("a/1").await.unwrap(), Some(Bytes::from_static(b"uno")));

        store.delete("a/1").await.unwrap();
        store.delete("missing").await.unwrap();
        assert!(store.get("a/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(clone.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }
}
