use shelfsync_core::{DownloadStatus, ObservedItem, parent_url, title_for_url};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::{CatalogError, CatalogStore};

const ENTRY_COLUMNS: &str = "id, url, parent_url, title, sort_order, file_hash, duplicate_of, play_count, liked, has_cover, is_collection, download_status";

/// Traversal key used for entries that were never ordered; they sort last.
const UNSORTED_KEY: i64 = i64::MAX;

/// Fields the Sync Engine derives from a filesystem observation.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInput {
    pub url: String,
    pub parent_url: Option<String>,
    pub title: String,
    pub is_collection: bool,
    pub download_status: DownloadStatus,
}

impl EntryInput {
    pub fn from_observed(item: &ObservedItem) -> Self {
        Self {
            url: item.url.clone(),
            parent_url: parent_url(&item.url),
            title: title_for_url(&item.url),
            is_collection: item.is_collection,
            download_status: item.download_status,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryRecord {
    pub id: i64,
    pub url: String,
    pub parent_url: Option<String>,
    pub title: String,
    pub sort_order: Option<i64>,
    pub file_hash: String,
    pub duplicate_of: Option<String>,
    pub play_count: i64,
    pub liked: bool,
    pub has_cover: bool,
    pub is_collection: bool,
    pub download_status: DownloadStatus,
}

impl EntryRecord {
    /// True when saving `input` would change a stored field.
    pub fn differs_from(&self, input: &EntryInput) -> bool {
        self.parent_url != input.parent_url
            || self.title != input.title
            || self.is_collection != input.is_collection
            || !self.download_status.same_kind(&input.download_status)
    }

    pub fn traversal_key(&self) -> i64 {
        self.sort_order.unwrap_or(UNSORTED_KEY)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<EntryRecord, CatalogError> {
    let status: String = row.try_get("download_status")?;
    let liked: i64 = row.try_get("liked")?;
    let has_cover: i64 = row.try_get("has_cover")?;
    let is_collection: i64 = row.try_get("is_collection")?;
    Ok(EntryRecord {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        parent_url: row.try_get("parent_url")?,
        title: row.try_get("title")?,
        sort_order: row.try_get("sort_order")?,
        file_hash: row.try_get("file_hash")?,
        duplicate_of: row.try_get("duplicate_of")?,
        play_count: row.try_get("play_count")?,
        liked: liked != 0,
        has_cover: has_cover != 0,
        is_collection: is_collection != 0,
        download_status: DownloadStatus::parse(&status)
            .ok_or(CatalogError::InvalidDownloadStatus(status))?,
    })
}

impl CatalogStore {
    /// Inserts a new row; returns false when the url already exists.
    pub async fn insert_entry(&self, input: &EntryInput) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "INSERT INTO entries (url, parent_url, title, is_collection, download_status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(url) DO NOTHING",
        )
        .bind(&input.url)
        .bind(&input.parent_url)
        .bind(&input.title)
        .bind(if input.is_collection { 1 } else { 0 })
        .bind(input.download_status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    /// Saves observation-derived fields only when one of them actually differs.
    pub async fn update_entry(&self, input: &EntryInput) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "UPDATE entries
             SET parent_url = ?2, title = ?3, is_collection = ?4, download_status = ?5
             WHERE url = ?1
                AND (parent_url IS NOT ?2
                    OR title <> ?3
                    OR is_collection <> ?4
                    OR download_status <> ?5)",
        )
        .bind(&input.url)
        .bind(&input.parent_url)
        .bind(&input.title)
        .bind(if input.is_collection { 1 } else { 0 })
        .bind(input.download_status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn get_entry(&self, url: &str) -> Result<Option<EntryRecord>, CatalogError> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE url = ?1"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn list_entries(&self) -> Result<Vec<EntryRecord>, CatalogError> {
        let rows = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn list_urls(&self) -> Result<Vec<String>, CatalogError> {
        Ok(sqlx::query_scalar("SELECT url FROM entries ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn count_entries(&self) -> Result<i64, CatalogError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn delete_entry(&self, url: &str) -> Result<bool, CatalogError> {
        let result = sqlx::query("DELETE FROM entries WHERE url = ?1")
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    /// Removes `url` and every entry nested under it. Returns the removed urls.
    pub async fn delete_subtree(&self, url: &str) -> Result<Vec<String>, CatalogError> {
        let mut removed: Vec<String> = sqlx::query_scalar(
            "DELETE FROM entries
             WHERE url = ?1 OR substr(url, 1, length(?1) + 1) = ?1 || '/'
             RETURNING url",
        )
        .bind(url)
        .fetch_all(&self.pool)
        .await?;
        self.record_mutation(removed.len() as u64);
        removed.sort();
        Ok(removed)
    }

    /// The entry at `position` in insertion order, re-read on every call.
    pub async fn entry_at_position(
        &self,
        position: i64,
    ) -> Result<Option<EntryRecord>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY id ASC LIMIT 1 OFFSET ?1"
        ))
        .bind(position)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Earliest-inserted entry carrying `hash`.
    pub async fn find_canonical_by_hash(
        &self,
        hash: &str,
    ) -> Result<Option<EntryRecord>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE file_hash = ?1 ORDER BY id ASC LIMIT 1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn set_file_hash(&self, url: &str, hash: &str) -> Result<bool, CatalogError> {
        let result =
            sqlx::query("UPDATE entries SET file_hash = ?2 WHERE url = ?1 AND file_hash <> ?2")
                .bind(url)
                .bind(hash)
                .execute(&self.pool)
                .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn set_duplicate_of(
        &self,
        url: &str,
        canonical: Option<&str>,
    ) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "UPDATE entries SET duplicate_of = ?2 WHERE url = ?1 AND duplicate_of IS NOT ?2",
        )
        .bind(url)
        .bind(canonical)
        .execute(&self.pool)
        .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn set_download_status(
        &self,
        url: &str,
        status: DownloadStatus,
    ) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "UPDATE entries SET download_status = ?2 WHERE url = ?1 AND download_status <> ?2",
        )
        .bind(url)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn record_play(&self, url: &str) -> Result<i64, CatalogError> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE entries SET play_count = play_count + 1 WHERE url = ?1 RETURNING play_count",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        let count = count.ok_or_else(|| CatalogError::MissingEntry(url.to_string()))?;
        self.record_mutation(1);
        Ok(count)
    }

    pub async fn set_liked(&self, url: &str, liked: bool) -> Result<bool, CatalogError> {
        let result = sqlx::query("UPDATE entries SET liked = ?2 WHERE url = ?1 AND liked <> ?2")
            .bind(url)
            .bind(if liked { 1 } else { 0 })
            .execute(&self.pool)
            .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn set_has_cover(&self, url: &str, has_cover: bool) -> Result<bool, CatalogError> {
        let result =
            sqlx::query("UPDATE entries SET has_cover = ?2 WHERE url = ?1 AND has_cover <> ?2")
                .bind(url)
                .bind(if has_cover { 1 } else { 0 })
                .execute(&self.pool)
                .await?;
        Ok(self.record_mutation(result.rows_affected()))
    }

    pub async fn sticky(&self) -> Result<Option<String>, CatalogError> {
        Ok(
            sqlx::query_scalar("SELECT url FROM entries WHERE sort_order = 0 LIMIT 1")
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Smallest `(order, url)` strictly after the given key.
    pub async fn next_after(&self, key: i64, url: &str) -> Result<Option<String>, CatalogError> {
        Ok(sqlx::query_scalar(
            "SELECT url FROM entries
             WHERE COALESCE(sort_order, ?3) > ?1
                OR (COALESCE(sort_order, ?3) = ?1 AND url > ?2)
             ORDER BY COALESCE(sort_order, ?3) ASC, url ASC
             LIMIT 1",
        )
        .bind(key)
        .bind(url)
        .bind(UNSORTED_KEY)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Largest `(order, url)` strictly before the given key.
    pub async fn prev_before(&self, key: i64, url: &str) -> Result<Option<String>, CatalogError> {
        Ok(sqlx::query_scalar(
            "SELECT url FROM entries
             WHERE COALESCE(sort_order, ?3) < ?1
                OR (COALESCE(sort_order, ?3) = ?1 AND url < ?2)
             ORDER BY COALESCE(sort_order, ?3) DESC, url DESC
             LIMIT 1",
        )
        .bind(key)
        .bind(url)
        .bind(UNSORTED_KEY)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn first(&self) -> Result<Option<String>, CatalogError> {
        Ok(sqlx::query_scalar(
            "SELECT url FROM entries ORDER BY COALESCE(sort_order, ?1) ASC, url ASC LIMIT 1",
        )
        .bind(UNSORTED_KEY)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn last(&self) -> Result<Option<String>, CatalogError> {
        Ok(sqlx::query_scalar(
            "SELECT url FROM entries ORDER BY COALESCE(sort_order, ?1) DESC, url DESC LIMIT 1",
        )
        .bind(UNSORTED_KEY)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Applies a complete ordering in one transaction. The previous sticky row
    /// is released first so the new assignment can claim order 0.
    pub async fn assign_orders(&self, orders: &[(String, i64)]) -> Result<(), CatalogError> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0u64;
        changed += sqlx::query("UPDATE entries SET sort_order = NULL WHERE sort_order = 0")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        for (url, order) in orders {
            changed += sqlx::query("UPDATE entries SET sort_order = ?2 WHERE url = ?1")
                .bind(url)
                .bind(order)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        self.record_mutation(changed);
        Ok(())
    }

    /// Pins `url` to order 0, demoting any other sticky row to order 1.
    pub async fn promote_sticky(&self, url: &str) -> Result<(), CatalogError> {
        let mut tx = self.pool.begin().await?;
        let demoted =
            sqlx::query("UPDATE entries SET sort_order = 1 WHERE sort_order = 0 AND url <> ?1")
                .bind(url)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        let promoted = sqlx::query("UPDATE entries SET sort_order = 0 WHERE url = ?1")
            .bind(url)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if promoted == 0 {
            tx.rollback().await?;
            return Err(CatalogError::MissingEntry(url.to_string()));
        }
        tx.commit().await?;
        self.record_mutation(demoted + promoted);
        Ok(())
    }
}
