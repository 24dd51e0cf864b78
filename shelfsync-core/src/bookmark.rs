use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("bookmark store unavailable: {0}")]
pub struct BookmarkError(pub String);

/// Persisted "resume from here" pointer owned by the playback layer.
#[async_trait]
pub trait CurrentItemStore: Send + Sync {
    async fn get_current(&self) -> Result<Option<String>, BookmarkError>;
    async fn set_current(&self, url: Option<&str>) -> Result<(), BookmarkError>;
}

#[derive(Debug, Default)]
pub struct MemoryBookmarks {
    current: Mutex<Option<String>>,
}

#[async_trait]
impl CurrentItemStore for MemoryBookmarks {
    async fn get_current(&self) -> Result<Option<String>, BookmarkError> {
        let guard = self
            .current
            .lock()
            .map_err(|err| BookmarkError(err.to_string()))?;
        Ok(guard.clone())
    }

    async fn set_current(&self, url: Option<&str>) -> Result<(), BookmarkError> {
        let mut guard = self
            .current
            .lock()
            .map_err(|err| BookmarkError(err.to_string()))?;
        *guard = url.map(str::to_string);
        Ok(())
    }
}
