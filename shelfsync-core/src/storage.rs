use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::snapshot::DownloadStatus;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("url is empty")]
    EmptyUrl,
    #[error("url contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("file is not available: {0}")]
    Missing(String),
    #[error("download failed for {url}: {message}")]
    Download { url: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Materialization capability supplied by whatever backs the managed directory.
#[async_trait]
pub trait StorageLayer: Send + Sync {
    async fn download(&self, url: &str, reason: &str) -> Result<(), StorageError>;

    async fn status(&self, url: &str) -> DownloadStatus;

    async fn is_downloaded(&self, url: &str) -> bool {
        self.status(url).await.is_materialized()
    }

    async fn is_materializing(&self, url: &str) -> bool {
        matches!(self.status(url).await, DownloadStatus::Materializing(_))
    }

    fn local_path(&self, url: &str) -> Result<PathBuf, StorageError>;
}

/// A plain local directory: every file that exists is materialized.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl StorageLayer for LocalStorage {
    async fn download(&self, url: &str, _reason: &str) -> Result<(), StorageError> {
        let path = self.local_path(url)?;
        if tokio::fs::try_exists(&path).await? {
            Ok(())
        } else {
            Err(StorageError::Missing(url.to_string()))
        }
    }

    async fn status(&self, url: &str) -> DownloadStatus {
        let Ok(path) = self.local_path(url) else {
            return DownloadStatus::NotMaterialized;
        };
        match tokio::fs::try_exists(&path).await {
            Ok(true) => DownloadStatus::Materialized,
            _ => DownloadStatus::NotMaterialized,
        }
    }

    fn local_path(&self, url: &str) -> Result<PathBuf, StorageError> {
        managed_path_for(&self.root, url)
    }
}

/// Maps a logical url ("/Books/A.m4b") under `root`, rejecting parent traversal.
pub fn managed_path_for(root: &Path, url: &str) -> Result<PathBuf, StorageError> {
    if url.is_empty() {
        return Err(StorageError::EmptyUrl);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(url).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StorageError::UnsupportedComponent(url.to_string()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_url_under_root() {
        let mapped = managed_path_for(Path::new("/music"), "/Albums/a.mp3").unwrap();
        assert_eq!(mapped, PathBuf::from("/music/Albums/a.mp3"));
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(matches!(
            managed_path_for(Path::new("/music"), "/../secret"),
            Err(StorageError::UnsupportedComponent(_))
        ));
        assert!(matches!(
            managed_path_for(Path::new("/music"), ""),
            Err(StorageError::EmptyUrl)
        ));
    }
}
