//! Asset Sink boundary: where finished textures are committed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{PixelBuffer, SourceFormat};
use crate::error::SinkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    /// Asset name including the texture prefix
    pub name: String,
    /// Folder the asset lives in, no trailing slash
    pub destination: String,
    pub generated_at: DateTime<Utc>,
    /// Hash of the generation spec, the idempotency key
    pub spec_hash: String,
    pub width: u32,
    pub height: u32,
    pub source_format: Option<SourceFormat>,
}

impl AssetMetadata {
    pub fn object_path(&self) -> String {
        if self.destination.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.destination, self.name)
        }
    }
}

/// Stable identity of a committed asset. Re-commits keep the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetIdentity {
    pub id: Uuid,
    pub path: String,
}

#[async_trait]
pub trait AssetSink: Send + Sync {
    /// Commit pixels under the metadata's object path.
    ///
    /// A commit carrying the spec hash already stored at that path updates
    /// the asset in place and returns the same identity.
    async fn commit(&self, pixels: PixelBuffer, metadata: AssetMetadata) -> Result<AssetIdentity, SinkError>;
}

#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub identity: AssetIdentity,
    pub metadata: AssetMetadata,
    pub pixels: PixelBuffer,
    pub revision: u32,
}

/// Process-local sink keyed by object path.
#[derive(Debug, Default)]
pub struct MemoryAssetSink {
    assets: Mutex<HashMap<String, StoredAsset>>,
    commits: AtomicUsize,
}

impl MemoryAssetSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<StoredAsset> {
        self.assets.lock().ok()?.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.assets.lock().map(|assets| assets.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of commit calls received, successful or not.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetSink for MemoryAssetSink {
    async fn commit(&self, pixels: PixelBuffer, metadata: AssetMetadata) -> Result<AssetIdentity, SinkError> {
        self.commits.fetch_add(1, Ordering::SeqCst);

        let path = metadata.object_path();
        let mut assets = self
            .assets
            .lock()
            .map_err(|_| SinkError::Unavailable("asset table poisoned".into()))?;

        match assets.get_mut(&path) {
            Some(existing) if existing.metadata.spec_hash != metadata.spec_hash => Err(SinkError::Conflict(
                format!("{path} was generated from a different spec"),
            )),
            Some(existing) => {
                existing.metadata = metadata;
                existing.pixels = pixels;
                existing.revision += 1;
                Ok(existing.identity.clone())
            }
            None => {
                let identity = AssetIdentity {
                    id: Uuid::new_v4(),
                    path: path.clone(),
                };
                assets.insert(
                    path,
                    StoredAsset {
                        identity: identity.clone(),
                        metadata,
                        pixels,
                        revision: 1,
                    },
                );
                Ok(identity)
            }
        }
    }
}
