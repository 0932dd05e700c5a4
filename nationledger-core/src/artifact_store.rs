//! Artifact Storage Abstraction
//!
//! Durable storage for raw artifact bytes. `put` returns an opaque
//! [`ArtifactLocation`]; the store is assumed durable once `put` returns.
//! Implementations may derive locations from content (the local store does)
//! but are not required to (the in-memory store does not).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::fingerprint::ContentFingerprinter;
use crate::types::ArtifactLocation;

const FILE_SCHEME: &str = "file://";
const MEMORY_SCHEME: &str = "memory://";

/// Error type for artifact storage operations
#[derive(Debug, thiserror::Error)]
pub enum ArtifactStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact location: {0}")]
    InvalidLocation(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Abstract artifact storage
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes, return their location
    async fn put(
        &self,
        content: &[u8],
        content_type: &str,
    ) -> Result<ArtifactLocation, ArtifactStoreError>;

    /// Fetch bytes by location
    async fn get(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactStoreError>;

    /// Delete bytes. Deleting a missing location is not an error.
    async fn delete(&self, location: &ArtifactLocation) -> Result<(), ArtifactStoreError>;

    /// Check if a location resolves
    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, ArtifactStoreError>;
}

// ---------------------------------------------------------------------------
// LocalArtifactStore
// ---------------------------------------------------------------------------

/// Content-addressed filesystem store: `file://<root>/<aa>/<bb>/<sha256>`.
///
/// Bytes are written to a temporary sibling and renamed into place, so an
/// interrupted `put` never leaves a partial artifact at a real location.
pub struct LocalArtifactStore {
    base_path: PathBuf,
}

impl LocalArtifactStore {
    /// Relative roots are anchored at the current directory and `.`/`..`
    /// segments are folded, so `../data` and `/srv/app/../data` both work.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let absolute = if base_path.is_absolute() {
            base_path
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&base_path))
                .unwrap_or(base_path)
        };
        Self {
            base_path: normalize(&absolute),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for_hex(&self, hex: &str) -> PathBuf {
        self.base_path.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Resolve a `file://` location, refusing anything outside the store root.
    fn path_from_location(&self, location: &ArtifactLocation) -> Result<PathBuf, ArtifactStoreError> {
        let path = location
            .as_str()
            .strip_prefix(FILE_SCHEME)
            .map(|raw| normalize(Path::new(raw)))
            .ok_or_else(|| {
                ArtifactStoreError::InvalidLocation(format!(
                    "Expected {} prefix: {}",
                    FILE_SCHEME, location
                ))
            })?;

        if !path.starts_with(&self.base_path) {
            return Err(ArtifactStoreError::InvalidLocation(format!(
                "Location outside store root: {}",
                location
            )));
        }
        Ok(path)
    }

    fn location_for(path: &Path) -> ArtifactLocation {
        ArtifactLocation::new(format!("{}{}", FILE_SCHEME, path.display()))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        content: &[u8],
        _content_type: &str,
    ) -> Result<ArtifactLocation, ArtifactStoreError> {
        let hex = ContentFingerprinter::digest_cooperative(content).await.to_hex();
        let path = self.path_for_hex(&hex);

        if tokio::fs::try_exists(&path).await? {
            return Ok(Self::location_for(&path));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(Self::location_for(&path))
    }

    async fn get(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactStoreError> {
        let path = self.path_from_location(location)?;

        if !tokio::fs::try_exists(&path).await? {
            return Err(ArtifactStoreError::NotFound(location.to_string()));
        }

        Ok(tokio::fs::read(path).await?)
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<(), ArtifactStoreError> {
        let path = self.path_from_location(location)?;

        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(path).await?;
        }

        Ok(())
    }

    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, ArtifactStoreError> {
        let path = self.path_from_location(location)?;
        Ok(tokio::fs::try_exists(path).await?)
    }
}

/// Lexically fold `.` and `..` segments. Does not touch the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// InMemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory store keyed by random ids (`memory://<uuid>`). Not content-addressed.
#[derive(Clone, Default)]
pub struct InMemoryArtifactStore {
    blobs: Arc<RwLock<HashMap<ArtifactLocation, Vec<u8>>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Overwrite stored bytes in place, bypassing `put`. Used to simulate tampering.
    pub async fn replace(&self, location: &ArtifactLocation, content: Vec<u8>) -> bool {
        let mut blobs = self.blobs.write().await;
        match blobs.get_mut(location) {
            Some(slot) => {
                *slot = content;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        content: &[u8],
        _content_type: &str,
    ) -> Result<ArtifactLocation, ArtifactStoreError> {
        let location = ArtifactLocation::new(format!("{}{}", MEMORY_SCHEME, Uuid::new_v4()));
        let mut blobs = self.blobs.write().await;
        blobs.insert(location.clone(), content.to_vec());
        Ok(location)
    }

    async fn get(&self, location: &ArtifactLocation) -> Result<Vec<u8>, ArtifactStoreError> {
        if !location.as_str().starts_with(MEMORY_SCHEME) {
            return Err(ArtifactStoreError::InvalidLocation(location.to_string()));
        }
        let blobs = self.blobs.read().await;
        blobs
            .get(location)
            .cloned()
            .ok_or_else(|| ArtifactStoreError::NotFound(location.to_string()))
    }

    async fn delete(&self, location: &ArtifactLocation) -> Result<(), ArtifactStoreError> {
        let mut blobs = self.blobs.write().await;
        blobs.remove(location);
        Ok(())
    }

    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, ArtifactStoreError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.contains_key(location))
    }
}
