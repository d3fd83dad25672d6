use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Object storage collaborator for diagnostic artifacts
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` and return a URL it can be read from
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String>;
}

/// Stores objects as files under a root directory
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }

        tokio::fs::write(&path, body)
            .await
            .context(format!("Failed to write object: {}", path.display()))?;

        let absolute = tokio::fs::canonicalize(&path).await.unwrap_or(path);
        debug!("Stored {} object at {}", content_type, absolute.display());

        Ok(format!("file://{}", absolute.display()))
    }
}
