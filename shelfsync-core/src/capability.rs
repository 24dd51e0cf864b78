use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("malformed source token: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("source token must reference an absolute path: {0}")]
    RelativePath(PathBuf),
    #[error("source is not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("access to source denied: {path}: {source}")]
    AccessDenied { path: PathBuf, source: io::Error },
}

/// A serializable grant for one file outside the managed root.
pub trait SourceToken {
    fn serialize(&self) -> Vec<u8>;
}

/// Exchanges serialized tokens for readable handles. Tokens must stay
/// resolvable across process restarts.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve(&self, token: &[u8]) -> Result<ResolvedSource, CapabilityError>;
}

#[derive(Debug)]
pub struct ResolvedSource {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathToken {
    pub path: PathBuf,
}

impl PathToken {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CapabilityError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(CapabilityError::RelativePath(path));
        }
        Ok(Self { path })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CapabilityError> {
        let token: PathToken = serde_json::from_slice(bytes)?;
        if !token.path.is_absolute() {
            return Err(CapabilityError::RelativePath(token.path));
        }
        Ok(token)
    }

    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

impl SourceToken for PathToken {
    fn serialize(&self) -> Vec<u8> {
        // Non UTF-8 paths cannot be encoded; the empty token then fails to resolve.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Resolver for platforms without a scoped-bookmark primitive: the stored
/// absolute path plus an open-for-read access check.
#[derive(Debug, Clone, Default)]
pub struct PathTokenResolver;

#[async_trait]
impl TokenResolver for PathTokenResolver {
    async fn resolve(&self, token: &[u8]) -> Result<ResolvedSource, CapabilityError> {
        let token = PathToken::from_bytes(token)?;
        open_source(&token.path).await
    }
}

async fn open_source(path: &Path) -> Result<ResolvedSource, CapabilityError> {
    let denied = |source: io::Error| CapabilityError::AccessDenied {
        path: path.to_path_buf(),
        source,
    };
    let meta = tokio::fs::metadata(path).await.map_err(denied)?;
    if !meta.is_file() {
        return Err(CapabilityError::NotAFile(path.to_path_buf()));
    }
    let file = tokio::fs::File::open(path).await.map_err(denied)?;
    Ok(ResolvedSource {
        path: path.to_path_buf(),
        file,
        len: meta.len(),
    })
}
