//! Checkpoints-as-items (spec §9 "Checkpointing ad hoc" redesign guidance).
//!
//! A checkpoint is stored through the same content-addressed blob backend as
//! any other item, plus one small per-`run_id` pointer record so
//! `latest_checkpoint` is a single lookup instead of a scan. The Store, not
//! the Coordinator, owns the bytes; the Coordinator is still the only
//! *writer* (spec §3 Ownership).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::content_hash::ContentHash;
use crate::error::Result;
use crate::store::backend::BlobBackend;
use crate::types::{Checkpoint, RunId};

/// Tracks the latest checkpoint's content hash per run, persisted the same
/// way the main index is (temp+rename), so a crash never leaves a
/// half-updated pointer.
pub struct CheckpointPointers {
    path: PathBuf,
    pointers: RwLock<HashMap<RunId, String>>,
}

impl CheckpointPointers {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let pointers = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            pointers: RwLock::new(pointers),
        })
    }

    async fn persist(&self, data: &HashMap<RunId, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(data)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    async fn set(&self, run_id: &str, hash: ContentHash) -> Result<()> {
        let mut data = self.pointers.write().await;
        data.insert(run_id.to_string(), hash.to_hex());
        self.persist(&data).await
    }

    async fn get(&self, run_id: &str) -> Option<ContentHash> {
        let data = self.pointers.read().await;
        data.get(run_id).and_then(|h| ContentHash::from_hex(h).ok())
    }
}

/// Store-backed checkpoint writer/reader used exclusively by the
/// Coordinator (spec §3 Ownership).
pub struct CheckpointStore {
    backend: Arc<dyn BlobBackend>,
    pointers: CheckpointPointers,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn BlobBackend>, pointers: CheckpointPointers) -> Self {
        Self { backend, pointers }
    }

    /// Persist a checkpoint blob and atomically advance the run's latest
    /// pointer.
    pub async fn put(&self, checkpoint: &Checkpoint) -> Result<ContentHash> {
        let bytes = bincode::serialize(checkpoint)
            .map_err(|e| crate::error::PulseError::SerializationError(e.to_string()))?;
        let hash = self.backend.put(&bytes).await?;
        self.pointers.set(&checkpoint.run_id, hash.clone()).await?;
        Ok(hash)
    }

    /// Load the latest checkpoint for a run, if one exists.
    pub async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let Some(hash) = self.pointers.get(run_id).await else {
            return Ok(None);
        };
        let bytes = self.backend.get(&hash).await?;
        let checkpoint = bincode::deserialize(&bytes)
            .map_err(|e| crate::error::PulseError::SerializationError(e.to_string()))?;
        Ok(Some(checkpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::FilesystemBackend;
    use chrono::Utc;

    fn sample_checkpoint(run_id: &str, batch_index: u64) -> Checkpoint {
        Checkpoint {
            run_id: run_id.to_string(),
            batch_index,
            store_versions_consumed: HashMap::new(),
            trust_snapshot_id: "snap-1".into(),
            metrics_watermark: Utc::now(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn latest_checkpoint_tracks_most_recent_put() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn BlobBackend> = Arc::new(FilesystemBackend::new(dir.path()));
        let pointers = CheckpointPointers::open(dir.path().join("checkpoints.ptr")).await.unwrap();
        let store = CheckpointStore::new(backend, pointers);

        store.put(&sample_checkpoint("run-1", 2)).await.unwrap();
        store.put(&sample_checkpoint("run-1", 5)).await.unwrap();

        let latest = store.latest("run-1").await.unwrap().unwrap();
        assert_eq!(latest.batch_index, 5);
    }

    #[tokio::test]
    async fn unknown_run_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn BlobBackend> = Arc::new(FilesystemBackend::new(dir.path()));
        let pointers = CheckpointPointers::open(dir.path().join("checkpoints.ptr")).await.unwrap();
        let store = CheckpointStore::new(backend, pointers);
        assert!(store.latest("never-run").await.unwrap().is_none());
    }
}
