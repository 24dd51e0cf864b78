use std::io;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use shelfsync_core::{StorageError, StorageLayer};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogError, CatalogStore, EntryRecord};

const HASH_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DuplicateError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplicateScanReport {
    pub visited: usize,
    pub hashed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub linked: usize,
    pub cleared: usize,
}

/// Lazily hashes materialized entries and links duplicates to the
/// earliest-inserted entry with the same content.
///
/// Only `file_hash` and `duplicate_of` are written, so a sweep can run next to
/// the Sync Engine. Iteration is positional, so concurrent inserts or deletes
/// shift the sweep by at most one element.
#[derive(Clone)]
pub struct DuplicateDetector {
    catalog: CatalogStore,
    storage: Arc<dyn StorageLayer>,
}

impl DuplicateDetector {
    pub fn new(catalog: CatalogStore, storage: Arc<dyn StorageLayer>) -> Self {
        Self { catalog, storage }
    }

    pub async fn scan_for_duplicates(&self) -> Result<DuplicateScanReport, DuplicateError> {
        let mut report = DuplicateScanReport::default();
        let mut position = 0i64;
        while let Some(entry) = self.catalog.entry_at_position(position).await? {
            position += 1;
            report.visited += 1;
            if entry.is_collection {
                continue;
            }
            if let Err(err) = self.visit(&entry, &mut report).await {
                report.failed += 1;
                warn!(url = %entry.url, error = %err, "duplicate scan failed for entry");
            }
        }

        if report.hashed > 0 || report.linked > 0 || report.cleared > 0 {
            info!(
                hashed = report.hashed,
                linked = report.linked,
                cleared = report.cleared,
                skipped = report.skipped,
                "duplicate sweep finished"
            );
        }
        Ok(report)
    }

    async fn visit(
        &self,
        entry: &EntryRecord,
        report: &mut DuplicateScanReport,
    ) -> Result<(), DuplicateError> {
        let hash = if entry.file_hash.is_empty() {
            if !self.storage.is_downloaded(&entry.url).await {
                debug!(url = %entry.url, "not materialized, hashing deferred");
                report.skipped += 1;
                return Ok(());
            }
            let path = self.storage.local_path(&entry.url)?;
            let hash = hash_file(&path).await?;
            self.catalog.set_file_hash(&entry.url, &hash).await?;
            report.hashed += 1;
            hash
        } else {
            entry.file_hash.clone()
        };

        let canonical = self.catalog.find_canonical_by_hash(&hash).await?;
        match canonical {
            Some(canonical) if canonical.url != entry.url => {
                // The lowest-id holder is canonical, so it never points elsewhere.
                if canonical.duplicate_of.is_some()
                    && self.catalog.set_duplicate_of(&canonical.url, None).await?
                {
                    report.cleared += 1;
                }
                if self
                    .catalog
                    .set_duplicate_of(&entry.url, Some(&canonical.url))
                    .await?
                {
                    debug!(url = %entry.url, canonical = %canonical.url, "duplicate linked");
                    report.linked += 1;
                }
            }
            _ => {
                if self.catalog.set_duplicate_of(&entry.url, None).await? {
                    report.cleared += 1;
                }
            }
        }
        Ok(())
    }
}

/// Hex SHA-256 of the file contents.
pub async fn hash_file(path: &Path) -> Result<String, io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
