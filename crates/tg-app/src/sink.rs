//! Filesystem asset sink.
//!
//! Textures land under `<root>/<destination>/<name>.png`. An `assets.json`
//! index beside them maps object paths to identities and spec hashes, which
//! is what makes repeated commits of the same spec idempotent. A commit
//! that would replace an asset made from a different spec is handled by
//! the sink's [`ConflictPolicy`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use tg_core::codec::PixelBuffer;
use tg_core::{AssetIdentity, AssetMetadata, AssetSink, SinkError};

const INDEX_FILE: &str = "assets.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub identity: AssetIdentity,
    pub metadata: AssetMetadata,
    pub revision: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AssetIndex {
    assets: BTreeMap<String, IndexEntry>,
}

/// What to do when an object path already holds an asset from another spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fail the commit with [`SinkError::Conflict`]
    #[default]
    Reject,
    /// Replace the asset, keeping its identity
    Overwrite,
    /// Store under `<name>_<8 hex chars>` instead
    Rename,
}

pub struct FsAssetSink {
    root: Arc<PathBuf>,
    on_conflict: ConflictPolicy,
    /// Serializes index read-modify-write cycles
    lock: Mutex<()>,
}

impl FsAssetSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
            on_conflict: ConflictPolicy::default(),
            lock: Mutex::new(()),
        }
    }

    pub fn with_conflict_policy(mut self, on_conflict: ConflictPolicy) -> Self {
        self.on_conflict = on_conflict;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Index entry for an object path, if one was committed.
    pub fn entry(&self, path: &str) -> Result<Option<IndexEntry>, SinkError> {
        Ok(load_index(&self.root)?.assets.remove(path))
    }
}

#[async_trait]
impl AssetSink for FsAssetSink {
    async fn commit(&self, pixels: PixelBuffer, metadata: AssetMetadata) -> Result<AssetIdentity, SinkError> {
        let _guard = self.lock.lock().await;
        let root = self.root.clone();
        let on_conflict = self.on_conflict;

        tokio::task::spawn_blocking(move || write_asset(&root, &pixels, metadata, on_conflict))
            .await
            .map_err(|e| SinkError::Unavailable(format!("commit task failed: {e}")))?
    }
}

fn write_asset(
    root: &Path,
    pixels: &PixelBuffer,
    mut metadata: AssetMetadata,
    on_conflict: ConflictPolicy,
) -> Result<AssetIdentity, SinkError> {
    let mut index = load_index(root)?;

    let conflicting = |index: &AssetIndex, metadata: &AssetMetadata| {
        index
            .assets
            .get(&metadata.object_path())
            .is_some_and(|existing| existing.metadata.spec_hash != metadata.spec_hash)
    };
    if conflicting(&index, &metadata) {
        match on_conflict {
            ConflictPolicy::Reject => {
                return Err(SinkError::Conflict(format!(
                    "{} was generated from a different spec",
                    metadata.object_path()
                )));
            }
            ConflictPolicy::Overwrite => info!("Overwriting {}", metadata.object_path()),
            ConflictPolicy::Rename => {
                let base = metadata.name.clone();
                while conflicting(&index, &metadata) {
                    metadata.name = unique_name(&base);
                }
                info!("{}/{} is taken, writing {} instead", metadata.destination, base, metadata.name);
            }
        }
    }

    let object_path = metadata.object_path();
    let file = asset_file(root, &object_path)?;
    let (identity, revision) = match index.assets.get(&object_path) {
        Some(existing) => (existing.identity.clone(), existing.revision + 1),
        None => (
            AssetIdentity {
                id: Uuid::new_v4(),
                path: object_path.clone(),
            },
            1,
        ),
    };

    let image = pixels
        .to_rgba8()
        .ok_or_else(|| SinkError::Rejected(format!("unsupported pixel layout for {object_path}")))?;

    index.assets.insert(
        object_path.clone(),
        IndexEntry {
            identity: identity.clone(),
            metadata,
            revision,
        },
    );

    // both files are staged before either replaces its predecessor
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(unavailable)?;
    }
    let png_staging = file.with_extension("png.tmp");
    image
        .save_with_format(&png_staging, ImageFormat::Png)
        .map_err(|e| SinkError::Unavailable(e.to_string()))?;
    let index_staging = match stage_index(root, &index) {
        Ok(staging) => staging,
        Err(e) => {
            let _ = fs::remove_file(&png_staging);
            return Err(e);
        }
    };

    fs::rename(&png_staging, &file).map_err(unavailable)?;
    debug!("Wrote {}", file.display());
    fs::rename(&index_staging, root.join(INDEX_FILE)).map_err(unavailable)?;

    info!("Committed {} (revision {})", object_path, revision);
    Ok(identity)
}

/// `name` plus an underscore and the first 8 hex digits of a fresh UUID.
fn unique_name(name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{name}_{}", &suffix[..8])
}

/// Map an object path to a file under `root`, refusing anything that escapes it.
fn asset_file(root: &Path, object_path: &str) -> Result<PathBuf, SinkError> {
    let relative = Path::new(object_path);
    let contained = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if object_path.is_empty() || !contained {
        return Err(SinkError::Rejected(format!("'{object_path}' is not a relative asset path")));
    }
    Ok(root.join(format!("{object_path}.png")))
}

fn load_index(root: &Path) -> Result<AssetIndex, SinkError> {
    match fs::read(root.join(INDEX_FILE)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| SinkError::Unavailable(format!("corrupt {INDEX_FILE}: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AssetIndex::default()),
        Err(e) => Err(unavailable(e)),
    }
}

/// Write the index beside the live one and return the staged file.
fn stage_index(root: &Path, index: &AssetIndex) -> Result<PathBuf, SinkError> {
    fs::create_dir_all(root).map_err(unavailable)?;
    let json = serde_json::to_vec_pretty(index).map_err(|e| SinkError::Unavailable(e.to_string()))?;
    let staging = root.join(format!("{INDEX_FILE}.tmp"));
    fs::write(&staging, json).map_err(unavailable)?;
    Ok(staging)
}

fn unavailable(e: std::io::Error) -> SinkError {
    SinkError::Unavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tg_core::SourceFormat;

    fn red(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer {
            width,
            height,
            channels: 3,
            bit_depth: 8,
            data: [255, 0, 0].repeat((width * height) as usize),
            source_format: Some(SourceFormat::Png),
        }
    }

    fn metadata(hash: &str) -> AssetMetadata {
        AssetMetadata {
            name: "T_Red".into(),
            destination: "Textures".into(),
            generated_at: Utc::now(),
            spec_hash: hash.into(),
            width: 4,
            height: 4,
            source_format: Some(SourceFormat::Png),
        }
    }

    #[tokio::test]
    async fn test_commit_writes_png_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsAssetSink::new(dir.path());

        let identity = sink.commit(red(4, 4), metadata("abc")).await.unwrap();
        assert_eq!(identity.path, "Textures/T_Red");

        let written = image::open(dir.path().join("Textures/T_Red.png")).unwrap().to_rgba8();
        assert_eq!(written.dimensions(), (4, 4));
        assert_eq!(written.get_pixel(3, 3).0, [255, 0, 0, 255]);

        let entry = sink.entry("Textures/T_Red").unwrap().unwrap();
        assert_eq!(entry.identity, identity);
        assert_eq!(entry.revision, 1);
    }

    #[tokio::test]
    async fn test_same_spec_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsAssetSink::new(dir.path());

        let first = sink.commit(red(4, 4), metadata("abc")).await.unwrap();
        let second = sink.commit(red(4, 4), metadata("abc")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(sink.entry("Textures/T_Red").unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_different_spec_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsAssetSink::new(dir.path());

        sink.commit(red(4, 4), metadata("abc")).await.unwrap();
        let err = sink.commit(red(4, 4), metadata("def")).await.unwrap_err();
        assert!(matches!(err, SinkError::Conflict(_)));
        assert_eq!(sink.entry("Textures/T_Red").unwrap().unwrap().metadata.spec_hash, "abc");
    }

    #[tokio::test]
    async fn test_overwrite_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsAssetSink::new(dir.path()).with_conflict_policy(ConflictPolicy::Overwrite);

        let first = sink.commit(red(4, 4), metadata("abc")).await.unwrap();
        let second = sink.commit(red(2, 2), metadata("def")).await.unwrap();

        assert_eq!(first, second);
        let entry = sink.entry("Textures/T_Red").unwrap().unwrap();
        assert_eq!(entry.metadata.spec_hash, "def");
        assert_eq!(entry.revision, 2);
        let written = image::open(dir.path().join("Textures/T_Red.png")).unwrap();
        assert_eq!((written.width(), written.height()), (2, 2));
    }

    #[tokio::test]
    async fn test_rename_stores_beside_existing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsAssetSink::new(dir.path()).with_conflict_policy(ConflictPolicy::Rename);

        let first = sink.commit(red(4, 4), metadata("abc")).await.unwrap();
        let second = sink.commit(red(4, 4), metadata("def")).await.unwrap();

        assert_ne!(first.id, second.id);
        let suffix = second.path.strip_prefix("Textures/T_Red_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(dir.path().join(format!("{}.png", second.path)).exists());
        assert_eq!(sink.entry("Textures/T_Red").unwrap().unwrap().metadata.spec_hash, "abc");
        assert_eq!(sink.entry(&second.path).unwrap().unwrap().metadata.name, format!("T_Red_{suffix}"));

        // the same spec still lands on its original path
        assert_eq!(sink.commit(red(4, 4), metadata("abc")).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_no_staging_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsAssetSink::new(dir.path());
        sink.commit(red(4, 4), metadata("abc")).await.unwrap();

        assert!(!dir.path().join("Textures/T_Red.png.tmp").exists());
        assert!(!dir.path().join("assets.json.tmp").exists());
        assert!(dir.path().join("assets.json").exists());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        let root = Path::new("/tmp/assets");
        assert!(asset_file(root, "../T_Red").is_err());
        assert!(asset_file(root, "/abs/T_Red").is_err());
        assert!(asset_file(root, "").is_err());
        assert_eq!(
            asset_file(root, "Textures/T_Red").unwrap(),
            root.join("Textures/T_Red.png")
        );
    }
}
