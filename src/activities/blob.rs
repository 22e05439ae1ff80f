use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob '{container}/{blob}' not found")]
    NotFound { container: String, blob: String },
    #[error("invalid blob path '{0}'")]
    InvalidPath(String),
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read access to uploaded objects.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch(&self, container: &str, blob: &str) -> Result<Vec<u8>, BlobError>;
}

/// Blobs stored as `<root>/<container>/<blob>` files.
pub struct FsBlobSource {
    root: PathBuf,
}

impl FsBlobSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, container: &str, blob: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(container).join(blob);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(BlobError::InvalidPath(format!("{container}/{blob}")));
        }
        Ok(self.root.join(relative))
    }

    /// Write a blob, creating the container directory as needed.
    pub async fn put(&self, container: &str, blob: &str, bytes: &[u8]) -> Result<PathBuf, BlobError> {
        let path = self.path_for(container, blob)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

#[async_trait]
impl BlobSource for FsBlobSource {
    async fn fetch(&self, container: &str, blob: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(container, blob)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blob source for tests, with injectable fetch failures.
#[derive(Default)]
pub struct InMemoryBlobSource {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    fetches: AtomicUsize,
    failures_left: AtomicUsize,
}

impl InMemoryBlobSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container: &str, blob: &str, bytes: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((container.to_string(), blob.to_string()), bytes);
    }

    /// Fail the next `n` fetches with an I/O error.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Number of fetch calls so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobSource for InMemoryBlobSource {
    async fn fetch(&self, container: &str, blob: &str) -> Result<Vec<u8>, BlobError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BlobError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected fetch failure",
            )));
        }
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(container.to_string(), blob.to_string()))
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            })
    }
}
