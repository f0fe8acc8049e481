//! Content-addressed blob backends.
//!
//! `store`/`get`/`exists`/`delete` by content hash, atomic
//! temp-file-then-rename writes, and an optional remote-backed mode with a
//! bounded local LRU cache.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::content_hash::ContentHash;
use crate::error::{PulseError, Result};

/// A content-addressed blob store.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Store bytes, returning their content hash. Idempotent: storing the
    /// same bytes twice is a no-op on the second call.
    async fn put(&self, data: &[u8]) -> Result<ContentHash>;

    /// Store bytes under a caller-computed hash rather than one derived
    /// from `data` itself. Used when the addressing hash is derived from
    /// only part of the stored representation (e.g. an item's `item_id`
    /// hashes canonical metadata + payload, while the stored blob also
    /// carries `source`/`extra` metadata for exact round-trip on read).
    async fn put_at(&self, hash: &ContentHash, data: &[u8]) -> Result<()>;

    /// Retrieve bytes by hash.
    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>>;

    /// Check existence without reading the full blob.
    async fn exists(&self, hash: &ContentHash) -> Result<bool>;

    /// Soft-delete is handled above this layer (tombstones in the index);
    /// this is a hard delete used only by the retention sweeper.
    async fn delete(&self, hash: &ContentHash) -> Result<()>;
}

/// Local filesystem backend, laid out as
/// `<root>/items/<aa>/<bb>/<item_id>` (spec §6 persisted state layout).
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, hash: &ContentHash) -> PathBuf {
        let (aa, bb) = hash.fanout_prefix();
        self.root.join("items").join(aa).join(bb).join(hash.to_hex())
    }
}

#[async_trait]
impl BlobBackend for FilesystemBackend {
    async fn put(&self, data: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::from_bytes(data);
        self.put_at(&hash, data).await?;
        Ok(hash)
    }

    async fn put_at(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let path = self.path_for(hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Stage to a temp file, fsync, then rename: a crash leaves either
        // the prior state or the new state, never a half-written blob
        // (spec §4.1 Layout and guarantees).
        let temp_path = path.with_extension("tmp");
        {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            use tokio::io::AsyncWriteExt;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let path = self.path_for(hash);
        tokio::fs::read(&path)
            .await
            .map_err(|_| PulseError::NotFound(hash.to_string()))
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(hash)).await.unwrap_or(false))
    }

    async fn delete(&self, hash: &ContentHash) -> Result<()> {
        let path = self.path_for(hash);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// Remote object-store backend (S3-compatible), used when the Store is
/// configured with remote backing. Reads fall back here on local cache miss;
/// writes publish a copy here in addition to the local disk.
#[cfg(feature = "s3")]
pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

#[cfg(feature = "s3")]
impl S3Backend {
    pub async fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn key_for(&self, hash: &ContentHash) -> String {
        format!("{}/{}", self.prefix, hash.to_hex())
    }
}

#[cfg(feature = "s3")]
#[async_trait]
impl BlobBackend for S3Backend {
    async fn put(&self, data: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::from_bytes(data);
        self.put_at(&hash, data).await?;
        Ok(hash)
    }

    async fn put_at(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key_for(hash))
            .body(data.to_vec().into())
            .send()
            .await
            .map_err(|e| PulseError::NetworkError(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(hash))
            .send()
            .await
            .map_err(|_| PulseError::NotFound(hash.to_string()))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| PulseError::NetworkError(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key_for(hash))
            .send()
            .await
            .is_ok())
    }

    async fn delete(&self, hash: &ContentHash) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key_for(hash))
            .send()
            .await
            .map_err(|e| PulseError::NetworkError(e.to_string()))?;
        Ok(())
    }
}

/// Bounded on-disk LRU cache fronting a remote backend, generalized from the
/// teacher's `PackageCache`.
pub struct CachedBackend {
    local: FilesystemBackend,
    remote: Arc<dyn BlobBackend>,
    order: Mutex<LruCache<String, u64>>,
    max_entries: NonZeroUsize,
}

impl CachedBackend {
    pub fn new(local_root: impl Into<PathBuf>, remote: Arc<dyn BlobBackend>, max_entries: usize) -> Self {
        Self {
            local: FilesystemBackend::new(local_root),
            remote,
            order: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_entries.max(1)).expect("max(1) is never zero"),
            )),
            max_entries: NonZeroUsize::new(max_entries.max(1)).expect("max(1) is never zero"),
        }
    }

    fn touch(&self, hash: &ContentHash) {
        let mut order = self.order.lock();
        order.put(hash.to_hex(), 0);
    }

    async fn evict_if_needed(&self) -> Result<()> {
        let evicted = {
            let mut order = self.order.lock();
            if order.len() > self.max_entries.get() {
                order.pop_lru().map(|(k, _)| k)
            } else {
                None
            }
        };
        if let Some(hex) = evicted {
            if let Ok(hash) = ContentHash::from_hex(&hex) {
                debug!(hash = %hash, "evicting local cache entry");
                self.local.delete(&hash).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for CachedBackend {
    async fn put(&self, data: &[u8]) -> Result<ContentHash> {
        let hash = self.remote.put(data).await?;
        self.local.put(data).await?;
        self.touch(&hash);
        self.evict_if_needed().await?;
        Ok(hash)
    }

    async fn put_at(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        self.remote.put_at(hash, data).await?;
        self.local.put_at(hash, data).await?;
        self.touch(hash);
        self.evict_if_needed().await?;
        Ok(())
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        if self.local.exists(hash).await? {
            self.touch(hash);
            return self.local.get(hash).await;
        }
        let data = self.remote.get(hash).await?;
        self.local.put(&data).await?;
        self.touch(hash);
        self.evict_if_needed().await?;
        Ok(data)
    }

    async fn exists(&self, hash: &ContentHash) -> Result<bool> {
        if self.local.exists(hash).await? {
            return Ok(true);
        }
        self.remote.exists(hash).await
    }

    async fn delete(&self, hash: &ContentHash) -> Result<()> {
        self.local.delete(hash).await?;
        self.remote.delete(hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_backend_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let hash = backend.put(b"hello").await.unwrap();
        assert!(backend.exists(&hash).await.unwrap());
        assert_eq!(backend.get(&hash).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn filesystem_backend_dedupes_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let h1 = backend.put(b"same").await.unwrap();
        let h2 = backend.put(b"same").await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let bogus = ContentHash::from_bytes(b"never stored");
        assert!(matches!(backend.get(&bogus).await, Err(PulseError::NotFound(_))));
    }

    fn helper_path_exists(root: &Path, hash: &ContentHash) -> bool {
        let (aa, bb) = hash.fanout_prefix();
        root.join("items").join(aa).join(bb).join(hash.to_hex()).exists()
    }

    #[tokio::test]
    async fn blobs_are_fanned_out_by_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        let hash = backend.put(b"fan-out me").await.unwrap();
        assert!(helper_path_exists(dir.path(), &hash));
    }
}
