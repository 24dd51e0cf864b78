use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use shelfsync_core::{BookmarkError, CurrentItemStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{SqlitePool, migrate::Migrator};
use thiserror::Error;

mod entries;
mod tasks;

pub use entries::{EntryInput, EntryRecord};
pub use tasks::{CopyTaskRecord, TaskState};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("invalid download status: {0}")]
    InvalidDownloadStatus(String),
    #[error("invalid task state: {0}")]
    InvalidTaskState(String),
    #[error("entry not found: {0}")]
    MissingEntry(String),
}

/// Persistent catalog of library entries, copy tasks and the resume bookmark.
///
/// Clones share one pool. SQLite serializes writers, so every mutation here is
/// a short statement or a single transaction.
#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    mutations: Arc<AtomicU64>,
}

impl CatalogStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            mutations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn new(database_url: &str) -> Result<Self, CatalogError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, CatalogError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), CatalogError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Rows changed by this store since it was created.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    fn record_mutation(&self, rows: u64) -> bool {
        if rows > 0 {
            self.mutations.fetch_add(rows, Ordering::SeqCst);
        }
        rows > 0
    }

    pub async fn get_current(&self) -> Result<Option<String>, CatalogError> {
        let current: Option<Option<String>> =
            sqlx::query_scalar("SELECT current_url FROM bookmarks WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(current.flatten())
    }

    pub async fn set_current(&self, url: Option<&str>) -> Result<(), CatalogError> {
        let result = sqlx::query(
            "INSERT INTO bookmarks (id, current_url) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET current_url = excluded.current_url",
        )
        .bind(url)
        .execute(&self.pool)
        .await?;
        self.record_mutation(result.rows_affected());
        Ok(())
    }
}

#[async_trait]
impl CurrentItemStore for CatalogStore {
    async fn get_current(&self) -> Result<Option<String>, BookmarkError> {
        CatalogStore::get_current(self)
            .await
            .map_err(|err| BookmarkError(err.to_string()))
    }

    async fn set_current(&self, url: Option<&str>) -> Result<(), BookmarkError> {
        CatalogStore::set_current(self, url)
            .await
            .map_err(|err| BookmarkError(err.to_string()))
    }
}

pub fn default_db_path() -> Result<PathBuf, CatalogError> {
    let mut path = dirs::data_dir().ok_or(CatalogError::MissingDataDir)?;
    path.push("shelfsync");
    path.push("catalog.db");
    Ok(path)
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
