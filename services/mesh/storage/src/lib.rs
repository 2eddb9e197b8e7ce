//! Key-value persistence for mesh network snapshots.
//!
//! The mesh engine never owns a storage format. It hands serializable
//! snapshots (network keys, nodes, IV index, sequence number) to a
//! [`KeyValueStore`], which may live in memory or on disk.
//!
//! ## Layout
//!
//! ```text
//! network/<name>   serde_json network snapshot
//! <anything else>  opaque caller-defined values
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Entry not found
    #[error("Entry not found: {0}")]
    NotFound(String),
    /// Invalid key or operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Byte-oriented key-value store used for persistence
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key is absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Write a value, replacing any previous one
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError>;

    /// Remove a value; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// One checksummed file per key
    File {
        /// Data directory path
        data_dir: PathBuf,
        /// Fsync after every write
        sync_writes: bool,
    },
}

// Re-export backend implementations
pub use backend::file::{FileStore, FileStoreConfig};
pub use backend::mem::MemoryStore;

/// Open a store for the configured backend
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StorageMode::File {
            data_dir,
            sync_writes,
        } => {
            let config = FileStoreConfig {
                data_dir,
                sync_writes,
            };
            Ok(Arc::new(FileStore::new(config).await?))
        }
    }
}

const NETWORK_PREFIX: &str = "network/";

/// Typed JSON helpers over a [`KeyValueStore`]
#[derive(Clone)]
pub struct MeshStore {
    inner: Arc<dyn KeyValueStore>,
}

impl MeshStore {
    /// Wrap a store
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    /// An in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Access the underlying store
    pub fn inner(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner
    }

    /// Deserialize the value under `key`
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.inner.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize `value` under `key`
    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        debug!("store save key={} len={}", key, bytes.len());
        self.inner.put(key, Bytes::from(bytes)).await
    }

    /// Load a named network snapshot
    pub async fn load_network<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        self.load(&network_key(name)).await
    }

    /// Save a named network snapshot
    pub async fn save_network<T: Serialize>(&self, name: &str, network: &T) -> Result<(), StorageError> {
        self.save(&network_key(name), network).await
    }

    /// Remove a named network snapshot
    pub async fn delete_network(&self, name: &str) -> Result<(), StorageError> {
        self.inner.delete(&network_key(name)).await
    }

    /// Names of all saved networks
    pub async fn list_networks(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .inner
            .keys(NETWORK_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(NETWORK_PREFIX).map(str::to_string))
            .collect())
    }
}

impl std::fmt::Debug for MeshStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshStore").finish_non_exhaustive()
    }
}

fn network_key(name: &str) -> String {
    format!("{}{}", NETWORK_PREFIX, name)
}

/// Reject keys that are empty or contain control characters
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.chars().any(char::is_control) {
        return Err(StorageError::Invalid(format!("bad key {:?}", key)));
    }
    Ok(())
}
