//! Object storage collaborator.
//!
//! The link workflow only needs `put`, `canonical_url` and `get`. The shipped
//! backend keeps objects on the local filesystem and publishes them under a
//! configurable public base URL, which the `/3d/*` proxy route serves. It
//! records an object's media type through its file extension, so `put` refuses
//! a type the path cannot carry.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use axum::body::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("{path} cannot be stored as {content_type}")]
    UnsupportedType { path: String, content_type: String },

    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub path: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `path`, replacing anything already there.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<ObjectRef, StorageError>;

    /// Stable, fetchable URL of a stored object.
    fn canonical_url(&self, object: &ObjectRef) -> String;

    /// Stored bytes together with the media type recorded at `put`.
    async fn get(&self, path: &str) -> Result<(ObjectRef, Bytes), StorageError>;
}

/// Reject absolute paths and anything that could climb out of the root.
pub fn validate_object_path(path: &str) -> Result<&str, StorageError> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('\\') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }

    let all_normal = Path::new(trimmed)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal || trimmed.split('/').any(|segment| segment.is_empty()) {
        return Err(StorageError::InvalidPath(path.to_string()));
    }

    Ok(trimmed)
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub async fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let root = root.canonicalize()?;

        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = validate_object_path(path)?;
        let full = self.root.join(relative);

        // SECURITY: never leave the storage root
        if !full.starts_with(&self.root) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        Ok(full)
    }
}

/// Media type the local store records for `path`.
fn recorded_type(path: &str) -> Option<String> {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<ObjectRef, StorageError> {
        let full_path = self.resolve(path)?;
        if let Some(content_type) = content_type {
            let carried = mime_guess::from_path(path)
                .iter()
                .any(|mime| mime.essence_str() == content_type);
            if !carried {
                return Err(StorageError::UnsupportedType {
                    path: path.to_string(),
                    content_type: content_type.to_string(),
                });
            }
        }
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        tracing::debug!(path, bytes = data.len(), "Stored object");

        let path = validate_object_path(path)?;
        Ok(ObjectRef {
            path: path.to_string(),
            size_bytes: data.len() as u64,
            content_type: recorded_type(path),
        })
    }

    fn canonical_url(&self, object: &ObjectRef) -> String {
        format!("{}/{}", self.public_base_url, object.path)
    }

    async fn get(&self, path: &str) -> Result<(ObjectRef, Bytes), StorageError> {
        let full_path = self.resolve(path)?;
        match fs::read(&full_path).await {
            Ok(data) => {
                let path = validate_object_path(path)?;
                let object = ObjectRef {
                    path: path.to_string(),
                    size_bytes: data.len() as u64,
                    content_type: recorded_type(path),
                };
                Ok((object, Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
