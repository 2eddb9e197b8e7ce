//! File-based storage backend: one checksummed record file per key

use crate::{validate_key, KeyValueStore, StorageError};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

const RECORD_SUFFIX: &str = "rec";
const TMP_SUFFIX: &str = "tmp";

/// Configuration for the file store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Fsync every record before it replaces the previous one
    pub sync_writes: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./meshdata"),
            sync_writes: true,
        }
    }
}

/// Record header
#[derive(Debug)]
struct RecordHeader {
    len: u32,    // Payload length (not including header)
    crc32c: u32, // CRC32 over the payload
}

impl RecordHeader {
    const SIZE: usize = 4 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.crc32c);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, StorageError> {
        if buf.remaining() < Self::SIZE {
            return Err(StorageError::Corruption(
                "Incomplete record header".to_string(),
            ));
        }

        Ok(Self {
            len: buf.get_u32_le(),
            crc32c: buf.get_u32_le(),
        })
    }

    fn compute_crc(payload: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }
}

/// File-based key-value store
///
/// Keys are hex-encoded into file names so any UTF-8 key maps to a single
/// flat file. Writes go to a temporary file that is renamed over the record.
pub struct FileStore {
    config: FileStoreConfig,
    tmp_counter: AtomicU64,
}

impl FileStore {
    /// Open (and create if needed) a store directory
    pub async fn new(config: FileStoreConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let store = Self {
            config,
            tmp_counter: AtomicU64::new(0),
        };
        store.recover().await?;
        Ok(store)
    }

    /// Remove temporary files left behind by an interrupted write
    async fn recover(&self) -> Result<(), StorageError> {
        let mut records = 0usize;
        let mut dir = tokio::fs::read_dir(&self.config.data_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(RECORD_SUFFIX) => records += 1,
                Some(TMP_SUFFIX) => {
                    warn!("Removing interrupted write {:?}", path);
                    tokio::fs::remove_file(&path).await?;
                }
                _ => {}
            }
        }
        info!(
            "Opened file store at {:?} with {} records",
            self.config.data_dir, records
        );
        Ok(())
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.{}", hex::encode(key), RECORD_SUFFIX))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.config
            .data_dir
            .join(format!("{}.{}.{}", hex::encode(key), n, TMP_SUFFIX))
    }

    fn decode_record(path: &Path, raw: Vec<u8>) -> Result<Bytes, StorageError> {
        let mut bytes = Bytes::from(raw);
        let header = RecordHeader::decode(&mut bytes)?;

        if bytes.remaining() != header.len as usize {
            error!(
                "Length mismatch in {:?}: header {} actual {}",
                path,
                header.len,
                bytes.remaining()
            );
            return Err(StorageError::Corruption(format!(
                "length mismatch in {:?}",
                path
            )));
        }

        let expected_crc = RecordHeader::compute_crc(&bytes);
        if header.crc32c != expected_crc {
            error!("CRC mismatch in {:?}", path);
            return Err(StorageError::Corruption(format!("CRC mismatch in {:?}", path)));
        }

        Ok(bytes)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let path = self.record_path(key);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(Self::decode_record(&path, raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StorageError> {
        validate_key(key)?;
        debug!("file put key={} len={}", key, value.len());

        let header = RecordHeader {
            len: value.len() as u32,
            crc32c: RecordHeader::compute_crc(&value),
        };
        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + value.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&value);

        let tmp = self.tmp_path(key);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        if self.config.sync_writes {
            file.sync_all().await?;
        }
        drop(file);

        tokio::fs::rename(&tmp, self.record_path(key)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.config.data_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_SUFFIX) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => warn!("Ignoring foreign file {:?}", path),
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> FileStore {
        FileStore::new(FileStoreConfig {
            data_dir: dir.path().to_path_buf(),
            sync_writes: true,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            store
                .put("network/home", Bytes::from_static(b"{\"iv\":1}"))
                .await
                .unwrap();
            store.put("other", Bytes::from_static(b"x")).await.unwrap();
        }

        let store = open(&dir).await;
        assert_eq!(
            store.get("network/home").await.unwrap(),
            Some(Bytes::from_static(b"{\"iv\":1}"))
        );
        assert_eq!(store.keys("network/").await.unwrap(), vec!["network/home"]);
        assert_eq!(store.keys("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        store.put("k", Bytes::from_static(b"one")).await.unwrap();
        store.put("k", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"two")));

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.put("k", Bytes::from_static(b"payload")).await.unwrap();

        let path = store.record_path("k");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(
            store.get("k").await,
            Err(StorageError::Corruption(_))
        ));

        std::fs::write(&path, [1u8, 2]).unwrap();
        assert!(matches!(
            store.get("k").await,
            Err(StorageError::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_removes_tmp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("6b.0.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("README"), b"not a record").unwrap();

        let store = open(&dir).await;
        assert!(!dir.path().join("6b.0.tmp").exists());
        assert!(store.keys("").await.unwrap().is_empty());
    }
}
