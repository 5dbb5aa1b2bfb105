//! Filesystem blob store. Keys are slash-separated validated segments;
//! writes are temp-file + rename so readers never observe a torn blob.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::{ApiaryError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key to a path under the root, refusing traversal segments.
    /// A key that reaches here with an unsafe segment means a caller bypassed
    /// identifier validation; that is a security error, not a bad request.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(ApiaryError::Security("empty blob key".into()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains('\\')
                || segment.contains('\0')
            {
                return Err(ApiaryError::Security(format!(
                    "unsafe blob key segment in {:?}",
                    key
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key = key, bytes = bytes.len(), "Blob written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix)?;
        let mut keys = Vec::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        store
            .put("acme/jobs/j-1/result.json", b"{\"ok\":true}")
            .await
            .unwrap();
        let bytes = store.get("acme/jobs/j-1/result.json").await.unwrap();
        assert_eq!(bytes.as_deref(), Some(b"{\"ok\":true}".as_slice()));
        assert!(store.get("acme/jobs/j-2/result.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("t/jobs/a/out.json", b"1").await.unwrap();
        store.put("t/jobs/b/out.json", b"2").await.unwrap();
        let keys = store.list("t/jobs").await.unwrap();
        assert_eq!(keys, vec!["t/jobs/a/out.json", "t/jobs/b/out.json"]);
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());
        for key in ["../escape", "a/../../b", "a//b", ""] {
            assert!(store.get(key).await.is_err(), "{:?}", key);
        }
    }
}
