//! Content-addressed hashing.
//!
//! Items and features are identified by a SHA-256 hash of their canonical
//! content rather than by a name the caller chose. This gives deduplication
//! (same content hashes the same regardless of who submitted it),
//! verification on read, and a stable cache key.
//!
//! A `sha256:<hex>` identifier over arbitrary bytes, folding in canonical
//! metadata so that two items with identical payload bytes but different
//! canonical fields do not collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::ItemMetadata;

/// A SHA-256 content hash, displayed as `sha256:<64 hex characters>`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash raw bytes directly.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Hash a sequence of byte slices as if concatenated, without an
    /// intermediate allocation.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    /// Derive an item's content hash from `(canonical_metadata_json ||
    /// payload_bytes)`, per spec §4.1.
    pub fn for_item(metadata: &ItemMetadata, payload: &[u8]) -> Self {
        // Canonical fields are sorted by key via BTreeMap so the same
        // logical metadata always serializes identically.
        let canonical: std::collections::BTreeMap<_, _> = metadata.canonical_fields.iter().collect();
        let canonical_json =
            serde_json::to_vec(&canonical).expect("BTreeMap<String, String> always serializes");
        Self::from_parts(&[&canonical_json, payload])
    }

    /// Derive a feature id from its inputs, per spec §4.5.
    pub fn for_feature(source_item_ids: &[String], pipeline_id: &str, pipeline_version: u32, normalized_params: &str) -> Self {
        let mut hasher = Sha256::new();
        for id in source_item_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(pipeline_id.as_bytes());
        hasher.update(pipeline_version.to_le_bytes());
        hasher.update(normalized_params.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Self, crate::error::PulseError> {
        let hex_str = s.strip_prefix("sha256:").unwrap_or(s);
        if hex_str.len() != 64 {
            return Err(crate::error::PulseError::InvalidContentHash(format!(
                "expected 64 hex characters, got {}",
                hex_str.len()
            )));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| crate::error::PulseError::InvalidContentHash(format!("invalid hex: {e}")))?;
        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            crate::error::PulseError::InvalidContentHash(format!("hash must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Two-level fan-out prefix used for item blob paths (spec §6):
    /// `store/items/<aa>/<bb>/<item_id>`.
    pub fn fanout_prefix(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_string(), hex[2..4].to_string())
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        Self::from_bytes(data) == *self
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl std::str::FromStr for ContentHash {
    type Err = crate::error::PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
