//! Media storage.
//!
//! Uploaded files are addressed by a relative key such as
//! `avatars/<id>/<uuid>.png`. The public URL is the configured base URL
//! followed by the key.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

/// Errors raised by media storage.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The key escapes the storage root or is empty.
    #[error("invalid media key: {0}")]
    InvalidKey(String),

    /// Filesystem failure.
    #[error("media I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    /// Storage key.
    pub key: String,
    /// Public URL.
    pub url: String,
}

/// Where uploaded files live.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Store `bytes` under `folder` with a fresh name keeping the extension
    /// of `file_name`.
    async fn upload(
        &self,
        folder: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredMedia, MediaError>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), MediaError>;

    /// Whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool, MediaError>;
}

/// Media storage on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDiskStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalDiskStorage {
    /// Store files under `root`, served from `base_url`.
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Map a key, or a URL under the base URL, to a path inside the root.
    fn resolve(&self, key: &str) -> Result<PathBuf, MediaError> {
        let key = key
            .strip_prefix(&self.base_url)
            .unwrap_or(key)
            .trim_start_matches('/');
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(MediaError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{key}", self.base_url)
    }
}

fn extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map_or_else(|| "jpg".to_string(), str::to_ascii_lowercase)
}

#[async_trait]
impl MediaStorage for LocalDiskStorage {
    async fn upload(
        &self,
        folder: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredMedia, MediaError> {
        let folder = folder.trim_matches('/');
        let key = format!("{folder}/{}.{}", uuid::Uuid::new_v4(), extension(file_name));
        let path = self.resolve(&key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;

        tracing::debug!(key = %key, size = bytes.len(), "Stored media");

        Ok(StoredMedia {
            url: self.url_for(&key),
            key,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), MediaError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, MediaError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
