use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::LedgerError;

/// Persisted opaque blobs keyed by unique strings
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Removing an absent key is not an error
    async fn remove(&self, key: &str) -> Result<(), LedgerError>;

    /// All stored keys, sorted
    async fn keys(&self) -> Result<Vec<String>, LedgerError>;
}

/// One file per blob under `root`, named by the hex encoding of its key
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key))
    }
}

fn storage_error(action: &str, key: &str, err: std::io::Error) -> LedgerError {
    LedgerError::Storage(format!("failed to {action} '{key}': {err}"))
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| storage_error("create store for", key, e))?;

        // Write then rename so readers never see a partial blob
        let target = self.blob_path(key);
        let staging = target.with_extension("tmp");
        tokio::fs::write(&staging, value)
            .await
            .map_err(|e| storage_error("write", key, e))?;
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| storage_error("commit", key, e))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        match tokio::fs::read(self.blob_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error("read", key, e)),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), LedgerError> {
        match tokio::fs::remove_file(self.blob_path(key)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(storage_error("remove", key, e)),
            _ => Ok(()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, LedgerError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error("list", "*", e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_error("list", "*", e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Skips staging files and anything not written by this store
            if let Some(key) = hex::decode(name).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        self.blobs.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<(), LedgerError> {
        self.blobs.lock().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self.blobs.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs"));

        assert_eq!(store.keys().await.unwrap(), Vec::<String>::new());
        store.put("bookmark:/srv/repo", b"token").await.unwrap();
        store.put("credential:main", b"sealed").await.unwrap();

        assert_eq!(
            store.get("bookmark:/srv/repo").await.unwrap().as_deref(),
            Some(&b"token"[..])
        );
        assert_eq!(
            store.keys().await.unwrap(),
            vec!["bookmark:/srv/repo".to_string(), "credential:main".to_string()]
        );

        store.remove("credential:main").await.unwrap();
        store.remove("credential:main").await.unwrap();
        assert_eq!(store.get("credential:main").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        store.put("k", b"one").await.unwrap();
        store.put("k", b"two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"two");
        assert_eq!(store.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::new();
        store.put("b", b"2").await.unwrap();
        store.put("a", b"1").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.get("missing").await.unwrap(), None);
    }
}
