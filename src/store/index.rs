//! Persistent, atomically-written [`StoreIndex`] (spec §3, §4.1).
//!
//! Maps `item_id -> IndexEntry` and `dataset_name -> latest_version`. Every
//! mutation is written via the same temp-file-then-rename idiom the blob
//! backend uses, so a crash during a write leaves either the old index file
//! or the new one, never a half-written one (spec §9 "cross-platform file
//! I/O" redesign guidance: do not rely on platform-specific atomic-rename
//! semantics beyond plain temp+rename).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::{DatasetId, IndexEntry, ItemId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexData {
    items: HashMap<ItemId, IndexEntry>,
    latest_version: HashMap<String, u64>,
    tombstoned: std::collections::HashSet<ItemId>,
}

/// Persistent, atomic-write index over items and dataset versions.
pub struct StoreIndex {
    path: PathBuf,
    data: RwLock<IndexData>,
}

impl StoreIndex {
    /// Load an index from `path`, or start empty if it doesn't exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes)?
        } else {
            IndexData::default()
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    async fn persist(&self, data: &IndexData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn insert_item(&self, item_id: ItemId, entry: IndexEntry) -> Result<()> {
        let mut data = self.data.write().await;
        data.items.insert(item_id, entry);
        self.persist(&data).await
    }

    pub async fn get_item(&self, item_id: &str) -> Option<IndexEntry> {
        let data = self.data.read().await;
        if data.tombstoned.contains(item_id) {
            return None;
        }
        data.items.get(item_id).cloned()
    }

    pub async fn tombstone_item(&self, item_id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.tombstoned.insert(item_id.to_string());
        self.persist(&data).await
    }

    /// Publish a new dataset version. Only called once every member item
    /// already exists in the index (spec §4.1 dataset versioning). Rejects
    /// any `version` that would not strictly advance `name`'s current
    /// latest version, so a version collision is a reported error in every
    /// build, not just a debug-only assertion.
    pub async fn publish_dataset_version(&self, name: &str, version: u64) -> Result<()> {
        let mut data = self.data.write().await;
        let current = data.latest_version.get(name).copied().unwrap_or(0);
        if version <= current {
            return Err(crate::error::PulseError::InvalidInput(format!(
                "dataset {name} version {version} does not strictly advance current latest {current}"
            )));
        }
        data.latest_version.insert(name.to_string(), version);
        self.persist(&data).await
    }

    pub async fn latest_dataset_version(&self, name: &str) -> Option<u64> {
        self.data.read().await.latest_version.get(name).copied()
    }

    pub async fn query(&self, predicate: impl Fn(&IndexEntry) -> bool) -> Vec<ItemId> {
        let data = self.data.read().await;
        data.items
            .iter()
            .filter(|(id, entry)| !data.tombstoned.contains(*id) && predicate(entry))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let idx = StoreIndex::open(dir.path().join("index.db")).await.unwrap();
        idx.insert_item(
            "item-1".into(),
            IndexEntry {
                dataset_id: "ds".into(),
                version: 1,
                path: "store/items/aa/bb/item-1".into(),
                size: 10,
                checksum: "sha256:abc".into(),
            },
        )
        .await
        .unwrap();
        let entry = idx.get_item("item-1").await.unwrap();
        assert_eq!(entry.dataset_id, "ds");
    }

    #[tokio::test]
    async fn reopen_reads_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let idx = StoreIndex::open(&path).await.unwrap();
            idx.publish_dataset_version("prices", 1).await.unwrap();
        }
        let idx2 = StoreIndex::open(&path).await.unwrap();
        assert_eq!(idx2.latest_dataset_version("prices").await, Some(1));
    }

    #[tokio::test]
    async fn tombstoned_items_are_excluded_from_get_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let idx = StoreIndex::open(dir.path().join("index.db")).await.unwrap();
        idx.insert_item(
            "item-1".into(),
            IndexEntry {
                dataset_id: "ds".into(),
                version: 1,
                path: "p".into(),
                size: 1,
                checksum: "c".into(),
            },
        )
        .await
        .unwrap();
        idx.tombstone_item("item-1").await.unwrap();
        assert!(idx.get_item("item-1").await.is_none());
        assert!(idx.query(|_| true).await.is_empty());
    }

    #[tokio::test]
    async fn dataset_versions_are_strictly_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let idx = StoreIndex::open(dir.path().join("index.db")).await.unwrap();
        idx.publish_dataset_version("prices", 1).await.unwrap();
        idx.publish_dataset_version("prices", 2).await.unwrap();
        assert_eq!(idx.latest_dataset_version("prices").await, Some(2));
    }

    #[tokio::test]
    async fn non_advancing_version_is_a_reported_error_not_a_debug_assert() {
        let dir = tempfile::tempdir().unwrap();
        let idx = StoreIndex::open(dir.path().join("index.db")).await.unwrap();
        idx.publish_dataset_version("prices", 1).await.unwrap();
        assert!(idx.publish_dataset_version("prices", 1).await.is_err());
        assert!(idx.publish_dataset_version("prices", 0).await.is_err());
        assert_eq!(idx.latest_dataset_version("prices").await, Some(1));
    }
}
