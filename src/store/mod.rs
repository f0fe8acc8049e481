//! The Store (spec §4.1): durable, versioned, indexed storage with
//! columnar reads and streaming access.
//!
//! A single facade composing a [`backend::BlobBackend`], a
//! [`index::StoreIndex`], the [`columnar`] reader/writer, and
//! [`checkpoint::CheckpointStore`] behind a small public API.

pub mod backend;
pub mod checkpoint;
pub mod columnar;
pub mod index;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::content_hash::ContentHash;
use crate::error::{PulseError, Result};
use crate::types::{Compression, Dataset, IndexEntry, Item, ItemMetadata};

use backend::{BlobBackend, FilesystemBackend};
use checkpoint::{CheckpointPointers, CheckpointStore};
use columnar::DatasetStream;
use index::StoreIndex;

/// Store configuration (size caps, prefetch depth, cache bound).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub max_item_size_bytes: Option<u64>,
    pub prefetch_depth: usize,
    pub local_cache_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("store"),
            max_item_size_bytes: None,
            prefetch_depth: 4,
            local_cache_entries: 10_000,
        }
    }
}

/// The versioned, content-addressed dataset and item repository.
pub struct Store {
    config: StoreConfig,
    backend: Arc<dyn BlobBackend>,
    index: StoreIndex,
    checkpoints: CheckpointStore,
    closed: parking_lot::Mutex<bool>,
    // Serializes `put_dataset`'s read-candidate-version -> write-files ->
    // publish sequence per dataset name, so two concurrent publishers for
    // the same name can't race to the same candidate version (spec §8
    // "version is strictly monotonic per name").
    dataset_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Store {
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let backend: Arc<dyn BlobBackend> = Arc::new(FilesystemBackend::new(&config.root));
        let index = StoreIndex::open(config.root.join("index.db")).await?;
        let pointers = CheckpointPointers::open(config.root.join("checkpoints.ptr")).await?;
        let checkpoints = CheckpointStore::new(backend.clone(), pointers);
        Ok(Self {
            config,
            backend,
            index,
            checkpoints,
            closed: parking_lot::Mutex::new(false),
            dataset_locks: DashMap::new(),
        })
    }

    /// Build a Store over a caller-supplied backend (used to wire in a
    /// remote-backed [`backend::CachedBackend`] instead of the plain local
    /// filesystem one).
    pub async fn with_backend(config: StoreConfig, backend: Arc<dyn BlobBackend>) -> Result<Self> {
        let index = StoreIndex::open(config.root.join("index.db")).await?;
        let pointers = CheckpointPointers::open(config.root.join("checkpoints.ptr")).await?;
        let checkpoints = CheckpointStore::new(backend.clone(), pointers);
        Ok(Self {
            config,
            backend,
            index,
            checkpoints,
            closed: parking_lot::Mutex::new(false),
            dataset_locks: DashMap::new(),
        })
    }

    /// The configuration this store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(PulseError::InvalidInput("store is closed".into()));
        }
        Ok(())
    }

    /// Store one item's payload, returning its content-derived `item_id`.
    pub async fn put_item(&self, dataset_id: &str, source: &str, payload: Vec<u8>, metadata: ItemMetadata) -> Result<String> {
        self.ensure_open()?;
        if let Some(max) = self.config.max_item_size_bytes {
            if payload.len() as u64 > max {
                return Err(PulseError::BudgetExceeded {
                    category: "storage_ops".to_string(),
                    over_by: (payload.len() as u64 - max) as f64,
                });
            }
        }
        let item = Item::new(dataset_id.to_string(), source.to_string(), payload, metadata);
        // Dedup by content: if already indexed, keep the first write's
        // source metadata (spec §4.1 algorithms).
        if self.index.get_item(&item.item_id).await.is_some() {
            return Ok(item.item_id);
        }
        let hash = ContentHash::from_hex(&item.item_id)?;
        // The blob carries the full item (including source/extra metadata)
        // so reads round-trip exactly, but it's addressed by `item_id`,
        // which only hashes canonical metadata + payload (spec §4.1).
        let blob = bincode::serialize(&item).map_err(|e| PulseError::SerializationError(e.to_string()))?;
        self.backend.put_at(&hash, &blob).await?;
        self.index
            .insert_item(
                item.item_id.clone(),
                IndexEntry {
                    dataset_id: item.dataset_id.clone(),
                    version: 0,
                    path: format!("items/{}/{}/{}", hash.fanout_prefix().0, hash.fanout_prefix().1, hash.to_hex()),
                    size: item.payload.len() as u64,
                    checksum: hash.to_string(),
                },
            )
            .await?;
        Ok(item.item_id)
    }

    /// Fetch one item by id, verifying its checksum on read.
    pub async fn get_item(&self, item_id: &str) -> Result<Item> {
        self.ensure_open()?;
        let entry = self
            .index
            .get_item(item_id)
            .await
            .ok_or_else(|| PulseError::NotFound(item_id.to_string()))?;
        let hash = ContentHash::from_hex(item_id)?;
        let blob = self.backend.get(&hash).await?;
        let item: Item =
            bincode::deserialize(&blob).map_err(|e| PulseError::SerializationError(e.to_string()))?;
        let recomputed = ContentHash::for_item(&item.metadata, &item.payload);
        if recomputed != hash {
            return Err(PulseError::IntegrityError {
                item_id: item_id.to_string(),
                expected: hash.to_string(),
                actual: recomputed.to_string(),
            });
        }
        debug_assert_eq!(item.dataset_id, entry.dataset_id);
        Ok(item)
    }

    /// Publish a new, immutable dataset version from a set of already-put
    /// items. Atomic: the `name -> latest_version` pointer only advances
    /// once every member item is confirmed present in the index.
    pub async fn put_dataset(
        &self,
        name: &str,
        items: Vec<Item>,
        schema_ref: &str,
        compression: Compression,
    ) -> Result<(String, u64)> {
        self.ensure_open()?;
        for item in &items {
            if self.index.get_item(&item.item_id).await.is_none() {
                return Err(PulseError::InvalidInput(format!(
                    "item {} must be put before it can join a dataset",
                    item.item_id
                )));
            }
        }

        // Hold this dataset name's lock across read-candidate-version ->
        // write-files -> publish so two concurrent `put_dataset` calls for
        // the same name can't compute the same candidate version and
        // overwrite each other's files (spec §4.1 "atomic: partial failure
        // leaves no half-published version").
        let lock = self
            .dataset_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let current = self.index.latest_dataset_version(name).await.unwrap_or(0);
        let version = current + 1;
        let item_ids: Vec<String> = items.iter().map(|i| i.item_id.clone()).collect();

        let manifest_path = self.config.root.join("datasets").join(name).join(format!("{version}.parquet"));
        tokio::fs::create_dir_all(manifest_path.parent().expect("joined path always has a parent")).await?;
        columnar::write_items(&manifest_path, &items, compression)?;

        let dataset = Dataset {
            dataset_id: format!("{name}@{version}"),
            name: name.to_string(),
            version,
            created_at: chrono::Utc::now(),
            item_ids,
            schema_ref: schema_ref.to_string(),
            compression,
        };
        let manifest_bytes = serde_json::to_vec(&dataset)?;
        let manifest_json = manifest_path.with_extension("manifest");
        let temp = manifest_json.with_extension("manifest.tmp");
        tokio::fs::write(&temp, &manifest_bytes).await?;
        tokio::fs::rename(&temp, &manifest_json).await?;

        // Publish only after the manifest and columnar page both exist.
        self.index.publish_dataset_version(name, version).await?;
        info!(dataset = name, version, items = dataset.item_ids.len(), "published dataset version");
        Ok((dataset.dataset_id, version))
    }

    /// Fetch dataset metadata; `version = None` returns the latest.
    pub async fn get_dataset(&self, name: &str, version: Option<u64>) -> Result<Dataset> {
        self.ensure_open()?;
        let version = match version {
            Some(v) => v,
            None => self
                .index
                .latest_dataset_version(name)
                .await
                .ok_or_else(|| PulseError::NotFound(format!("dataset {name}")))?,
        };
        let manifest_json = self
            .config
            .root
            .join("datasets")
            .join(name)
            .join(format!("{version}.manifest"));
        let bytes = tokio::fs::read(&manifest_json)
            .await
            .map_err(|_| PulseError::NotFound(format!("{name}@{version}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Open a finite, forward-only stream of decoded record batches for a
    /// dataset version, with optional column projection and row filtering,
    /// prefetched `prefetch_depth` batches ahead.
    pub async fn stream_dataset(
        &self,
        name: &str,
        version: Option<u64>,
        columns: Option<Vec<String>>,
        row_filter: Option<Arc<dyn Fn(&ItemMetadata) -> bool + Send + Sync>>,
        batch_rows: usize,
    ) -> Result<DatasetStream> {
        self.ensure_open()?;
        let version = match version {
            Some(v) => v,
            None => self
                .index
                .latest_dataset_version(name)
                .await
                .ok_or_else(|| PulseError::NotFound(format!("dataset {name}")))?,
        };
        let path = self.config.root.join("datasets").join(name).join(format!("{version}.parquet"));
        DatasetStream::open(path, name.to_string(), batch_rows, columns, row_filter, self.config.prefetch_depth)
    }

    /// Index-backed query over stored items by equality/range filters on
    /// canonical metadata fields.
    pub async fn query(&self, predicate: impl Fn(&IndexEntry) -> bool) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.index.query(predicate).await)
    }

    /// Store a checkpoint for `run_id` (Coordinator-only; see
    /// `checkpoint::CheckpointStore`).
    pub async fn put_checkpoint(&self, checkpoint: &crate::types::Checkpoint) -> Result<String> {
        self.ensure_open()?;
        Ok(self.checkpoints.put(checkpoint).await?.to_string())
    }

    pub async fn latest_checkpoint(&self, run_id: &str) -> Result<Option<crate::types::Checkpoint>> {
        self.ensure_open()?;
        self.checkpoints.latest(run_id).await
    }

    /// Soft-delete (tombstone) an item. Actual reclamation is a sweeper's
    /// job under a retention policy, not this call's.
    pub async fn tombstone_item(&self, item_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.index.tombstone_item(item_id).await
    }

    /// Flush indices and mark the store closed. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemMetadata;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig {
            root: dir.path().to_path_buf(),
            ..StoreConfig::default()
        })
        .await
        .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_is_bit_identical() {
        let (_dir, store) = open_store().await;
        let id = store
            .put_item("ds", "adapter", b"payload-bytes".to_vec(), ItemMetadata::default())
            .await
            .unwrap();
        let item = store.get_item(&id).await.unwrap();
        assert_eq!(item.payload, b"payload-bytes");
    }

    #[tokio::test]
    async fn get_missing_item_is_not_found() {
        let (_dir, store) = open_store().await;
        assert!(matches!(store.get_item("sha256:deadbeef").await, Err(PulseError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_payload_dedupes_to_one_item() {
        let (_dir, store) = open_store().await;
        let a = store.put_item("ds", "src-a", b"same".to_vec(), ItemMetadata::default()).await.unwrap();
        let b = store.put_item("ds", "src-b", b"same".to_vec(), ItemMetadata::default()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn dataset_versions_are_monotonic_and_items_are_retrievable() {
        let (_dir, store) = open_store().await;
        let id1 = store.put_item("ds", "a", b"one".to_vec(), ItemMetadata::default()).await.unwrap();
        let id2 = store.put_item("ds", "a", b"two".to_vec(), ItemMetadata::default()).await.unwrap();
        let item1 = store.get_item(&id1).await.unwrap();
        let item2 = store.get_item(&id2).await.unwrap();

        let (_id, v1) = store
            .put_dataset("prices", vec![item1], "schema-v1", Compression::None)
            .await
            .unwrap();
        let (_id, v2) = store
            .put_dataset("prices", vec![item2], "schema-v1", Compression::None)
            .await
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let latest = store.get_dataset("prices", None).await.unwrap();
        assert_eq!(latest.version, 2);
        let old = store.get_dataset("prices", Some(1)).await.unwrap();
        assert_eq!(old.version, 1);
    }

    #[tokio::test]
    async fn empty_dataset_is_legal_and_streams_nothing() {
        let (_dir, store) = open_store().await;
        store
            .put_dataset("empty-ds", vec![], "schema-v1", Compression::None)
            .await
            .unwrap();
        let mut stream = store.stream_dataset("empty-ds", None, None, None, 100).await.unwrap();
        assert!(stream.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn dataset_cannot_reference_unput_items() {
        let (_dir, store) = open_store().await;
        let bogus = Item::new("ds".into(), "src".into(), b"never put".to_vec(), ItemMetadata::default());
        let result = store.put_dataset("prices", vec![bogus], "schema", Compression::None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_dir, store) = open_store().await;
        store.close().await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_payload_is_budget_exceeded_not_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig {
            root: dir.path().to_path_buf(),
            max_item_size_bytes: Some(4),
            ..StoreConfig::default()
        })
        .await
        .unwrap();
        let err = store
            .put_item("ds", "adapter", b"too-long".to_vec(), ItemMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PulseError::BudgetExceeded { .. }));
        assert_eq!(crate::classify::classify(&err), crate::classify::ErrorClass::SystemBudgetExceeded);
    }

    #[tokio::test]
    async fn concurrent_put_dataset_for_same_name_yields_distinct_monotonic_versions() {
        let (_dir, store) = open_store().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = store
                    .put_item("ds", "src", format!("item-{i}").into_bytes(), ItemMetadata::default())
                    .await
                    .unwrap();
                let item = store.get_item(&id).await.unwrap();
                store.put_dataset("prices", vec![item], "schema-v1", Compression::None).await.unwrap()
            }));
        }
        let mut versions: Vec<u64> = Vec::new();
        for h in handles {
            let (_id, version) = h.await.unwrap();
            versions.push(version);
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<u64>>(), "every concurrent publish must get a distinct, monotonic version");
    }
}
