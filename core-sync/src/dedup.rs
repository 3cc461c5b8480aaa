//! # Content Deduplication Index
//!
//! Content-hash identity for asset kinds (photos).
//!
//! ## Overview
//!
//! Paths and file names are not identity for assets: the same photo can be
//! exported to a different folder, renamed by the library, or imported from a
//! second source. A [`ContentKey`] is a SHA-256 over the asset bytes, and the
//! [`DedupIndex`] maps each key to the mapping record that already tracks it.
//! The change classifier consults the index before treating an unmapped asset
//! as new, so re-running an export after files moved does not duplicate them.

use crate::entity::hex_digest;
use crate::error::{Result, SyncError};
use crate::mapping::MappingId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Strong content hash identifying an asset independent of its location
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    /// Hash raw asset bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex_digest(bytes))
    }

    /// Accept a SHA-256 an adapter already computed
    ///
    /// Returns `None` unless `hex` is 64 hexadecimal characters. Case is
    /// normalized so keys from different adapters compare equal.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim();
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(hex.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where asset content can be read from
#[derive(Debug, Clone)]
pub enum AssetSource {
    Bytes(Bytes),
    Path(PathBuf),
}

/// Compute the content key of an asset.
///
/// Files are hashed in chunks so large videos do not have to fit in memory.
///
/// # Errors
///
/// Returns `SyncError::Normalization` if the file cannot be read.
pub async fn identify(source: &AssetSource) -> Result<ContentKey> {
    match source {
        AssetSource::Bytes(bytes) => Ok(ContentKey::from_bytes(bytes)),
        AssetSource::Path(path) => identify_path(path).await,
    }
}

async fn identify_path(path: &Path) -> Result<ContentKey> {
    let read_error = |e: std::io::Error| SyncError::Normalization {
        kind: bridge_traits::EntityKind::Photo,
        entity: core_runtime::logging::strip_path(&path.to_string_lossy()).to_string(),
        message: format!("cannot read asset: {}", e),
    };

    let mut file = tokio::fs::File::open(path).await.map_err(read_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = file.read(&mut buffer).await.map_err(read_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(ContentKey(format!("{:x}", hasher.finalize())))
}

/// Maps content keys to the mapping record that tracks that content
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    by_key: HashMap<ContentKey, MappingId>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ContentKey, mapping_id: MappingId) {
        self.by_key.insert(key, mapping_id);
    }

    /// Remove `key` if it still points at `mapping_id`
    pub fn remove(&mut self, key: &ContentKey, mapping_id: &MappingId) {
        if self.by_key.get(key) == Some(mapping_id) {
            self.by_key.remove(key);
        }
    }

    pub fn lookup(&self, key: &ContentKey) -> Option<&MappingId> {
        self.by_key.get(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_bytes_same_key() {
        let a = ContentKey::from_bytes(b"\xff\xd8jpeg-bytes");
        let b = ContentKey::from_bytes(b"\xff\xd8jpeg-bytes");
        let c = ContentKey::from_bytes(b"\xff\xd8other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_hex_normalizes_case() {
        let key = ContentKey::from_bytes(b"photo");
        let upper = key.as_str().to_ascii_uppercase();
        assert_eq!(ContentKey::from_hex(&upper), Some(key));
        assert_eq!(ContentKey::from_hex("not-a-hash"), None);
        assert_eq!(ContentKey::from_hex(&"z".repeat(64)), None);
    }

    #[tokio::test]
    async fn test_identify_path_matches_bytes() {
        let dir = std::env::temp_dir().join(format!("recordsync-dedup-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let first = dir.join("a").join("IMG_1.jpg");
        let moved = dir.join("b").join("renamed.jpg");
        tokio::fs::create_dir_all(first.parent().unwrap()).await.unwrap();
        tokio::fs::create_dir_all(moved.parent().unwrap()).await.unwrap();

        let content = vec![7u8; READ_CHUNK_SIZE * 2 + 17];
        tokio::fs::write(&first, &content).await.unwrap();
        tokio::fs::write(&moved, &content).await.unwrap();

        let from_path = identify(&AssetSource::Path(first)).await.unwrap();
        let from_moved = identify(&AssetSource::Path(moved)).await.unwrap();
        let from_bytes = identify(&AssetSource::Bytes(Bytes::from(content))).await.unwrap();
        assert_eq!(from_path, from_bytes);
        assert_eq!(from_moved, from_bytes);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_identify_missing_file_is_normalization_error() {
        let result = identify(&AssetSource::Path(PathBuf::from("/nonexistent/IMG_404.jpg"))).await;
        assert!(matches!(result, Err(SyncError::Normalization { .. })));
    }

    #[test]
    fn test_index_remove_only_matching_mapping() {
        let key = ContentKey::from_bytes(b"x");
        let first = MappingId::new();
        let second = MappingId::new();

        let mut index = DedupIndex::new();
        index.insert(key.clone(), first);
        index.remove(&key, &second);
        assert_eq!(index.lookup(&key), Some(&first));

        index.remove(&key, &first);
        assert!(index.is_empty());
    }
}
